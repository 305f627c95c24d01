//! Canonical identifier construction.
//!
//! Every durable record is keyed on a `source_ref` of the form
//! `tg:<channel_id>:<message_type>:<message_id>`, directly or through one of
//! the derived prefixes below. All identifier strings in the workspace are
//! built here; nothing assembles them inline.

use std::cmp::Ordering;

use crate::types::{BundleItem, ItemRole, MessageType, TopicAnchor};

pub const REF_PREFIX: &str = "tg";
pub const DOC_PREFIX: &str = "doc:";
pub const TOPIC_PREFIX: &str = "topic:";
pub const KB_MSG_PREFIX: &str = "kb:msg:";
pub const KB_TOPIC_PREFIX: &str = "kb:topic:";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentError {
    #[error("channel id must be non-empty and contain no ':' (got {0:?})")]
    BadChannelId(String),

    #[error("not a source ref: {0:?}")]
    BadRef(String),
}

/// Build the canonical material identity for one message.
pub fn canonical_ref(
    channel_id: &str,
    message_type: MessageType,
    message_id: i64,
) -> Result<String, IdentError> {
    if channel_id.is_empty() || channel_id.contains(':') {
        return Err(IdentError::BadChannelId(channel_id.to_string()));
    }
    Ok(format!("{REF_PREFIX}:{channel_id}:{message_type}:{message_id}"))
}

/// Inverse of [`canonical_ref`].
pub fn parse_ref(source_ref: &str) -> Result<(String, MessageType, i64), IdentError> {
    let bad = || IdentError::BadRef(source_ref.to_string());
    let mut parts = source_ref.splitn(4, ':');
    let prefix = parts.next().ok_or_else(bad)?;
    let channel_id = parts.next().ok_or_else(bad)?;
    let message_type = parts.next().ok_or_else(bad)?;
    let message_id = parts.next().ok_or_else(bad)?;
    if prefix != REF_PREFIX || channel_id.is_empty() {
        return Err(bad());
    }
    let message_type: MessageType = message_type.parse().map_err(|_| bad())?;
    let message_id: i64 = message_id.parse().map_err(|_| bad())?;
    Ok((channel_id.to_string(), message_type, message_id))
}

pub fn doc_id(source_ref: &str) -> String {
    format!("{DOC_PREFIX}{source_ref}")
}

pub fn topic_id(primary_anchor_ref: &str) -> String {
    format!("{TOPIC_PREFIX}{primary_anchor_ref}")
}

pub fn kb_msg_id(source_ref: &str) -> String {
    format!("{KB_MSG_PREFIX}{source_ref}")
}

pub fn kb_topic_id(topic_id: &str) -> String {
    format!("{KB_TOPIC_PREFIX}{topic_id}")
}

/// The single canonical anchor ordering: score descending, `anchor_ref`
/// ascending on ties.
pub fn anchor_order(a: &TopicAnchor, b: &TopicAnchor) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.anchor_ref.cmp(&b.anchor_ref))
}

pub fn sort_anchors(anchors: &mut [TopicAnchor]) {
    anchors.sort_by(anchor_order);
}

/// Canonical ranked ordering shared by bundle items and resolved sources:
/// anchors first, then score descending, then `source_ref` ascending.
pub fn ranked_order(
    a_role: ItemRole,
    a_score: f64,
    a_ref: &str,
    b_role: ItemRole,
    b_score: f64,
    b_ref: &str,
) -> Ordering {
    a_role
        .rank()
        .cmp(&b_role.rank())
        .then_with(|| b_score.total_cmp(&a_score))
        .then_with(|| a_ref.cmp(b_ref))
}

pub fn sort_items(items: &mut [BundleItem]) {
    items.sort_by(|a, b| {
        ranked_order(a.role, a.score, &a.source_ref, b.role, b.score, &b.source_ref)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_round_trip() {
        let r = canonical_ref("@demo", MessageType::Post, 1).unwrap();
        assert_eq!(r, "tg:@demo:post:1");
        let (ch, mt, id) = parse_ref(&r).unwrap();
        assert_eq!(ch, "@demo");
        assert_eq!(mt, MessageType::Post);
        assert_eq!(id, 1);
    }

    #[test]
    fn ref_round_trip_comment() {
        let r = canonical_ref("-1001234567890", MessageType::Comment, 99).unwrap();
        let (ch, mt, id) = parse_ref(&r).unwrap();
        assert_eq!(ch, "-1001234567890");
        assert_eq!(mt, MessageType::Comment);
        assert_eq!(id, 99);
    }

    #[test]
    fn channel_with_colon_rejected() {
        assert!(canonical_ref("a:b", MessageType::Post, 1).is_err());
        assert!(canonical_ref("", MessageType::Post, 1).is_err());
    }

    #[test]
    fn parse_rejects_foreign_strings() {
        assert!(parse_ref("doc:tg:@demo:post:1").is_err());
        assert!(parse_ref("tg:@demo:reaction:1").is_err());
        assert!(parse_ref("tg:@demo:post:abc").is_err());
        assert!(parse_ref("tg:@demo:post").is_err());
    }

    #[test]
    fn derived_ids() {
        assert_eq!(doc_id("tg:@d:post:1"), "doc:tg:@d:post:1");
        assert_eq!(topic_id("tg:@d:post:1"), "topic:tg:@d:post:1");
        assert_eq!(kb_msg_id("tg:@d:post:1"), "kb:msg:tg:@d:post:1");
        assert_eq!(kb_topic_id("topic:tg:@d:post:1"), "kb:topic:topic:tg:@d:post:1");
    }

    fn anchor(r: &str, score: f64) -> TopicAnchor {
        let (channel_id, message_type, message_id) = parse_ref(r).unwrap();
        TopicAnchor {
            channel_id,
            message_id,
            message_type,
            anchor_ref: r.to_string(),
            score,
        }
    }

    #[test]
    fn anchors_sort_by_score_then_ref() {
        let mut anchors = vec![
            anchor("tg:c:post:3", 0.9),
            anchor("tg:c:post:1", 0.9),
            anchor("tg:c:post:2", 0.8),
        ];
        sort_anchors(&mut anchors);
        let refs: Vec<&str> = anchors.iter().map(|a| a.anchor_ref.as_str()).collect();
        assert_eq!(refs, ["tg:c:post:1", "tg:c:post:3", "tg:c:post:2"]);
    }

    #[test]
    fn ranked_order_puts_anchors_first() {
        let ord = ranked_order(
            ItemRole::Supporting,
            0.99,
            "tg:c:post:1",
            ItemRole::Anchor,
            0.1,
            "tg:c:post:2",
        );
        assert_eq!(ord, Ordering::Greater);
    }
}
