//! Versioned prompt registry.
//!
//! Prompts are identified by name; the `prompt_id` is a short deterministic
//! hash of system prompt + user template, computed once per process and
//! stamped into document metadata so outputs can be traced back to the
//! exact prompt text that produced them.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// `sha256:<first 16 hex chars>` over `system + "\n---\n" + user_template`.
pub fn compute_prompt_id(system: &str, user_template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system.as_bytes());
    hasher.update(b"\n---\n");
    hasher.update(user_template.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("sha256:{}", &digest[..16])
}

/// One registered prompt: fixed system text plus a user template with
/// `{{placeholder}}` slots.
pub struct PromptDef {
    pub name: &'static str,
    pub system: &'static str,
    pub user_template: &'static str,
    id: OnceLock<String>,
}

impl PromptDef {
    const fn new(name: &'static str, system: &'static str, user_template: &'static str) -> Self {
        Self {
            name,
            system,
            user_template,
            id: OnceLock::new(),
        }
    }

    pub fn prompt_id(&self) -> &str {
        self.id
            .get_or_init(|| compute_prompt_id(self.system, self.user_template))
    }

    /// Fill `{{key}}` slots. Unknown slots are left as-is.
    pub fn render_user(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.user_template.to_string();
        for (key, value) in vars {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }
}

pub fn get(name: &str) -> Option<&'static PromptDef> {
    [&MESSAGE_EXTRACT, &TOPIC_DISCOVERY, &TOPIC_SUPPORT]
        .into_iter()
        .find(|p| p.name == name)
}

/// Turns one raw message into a structured document.
pub static MESSAGE_EXTRACT: PromptDef = PromptDef::new(
    "message_extract",
    "You are a knowledge-extraction assistant. You receive the raw text of a \
single chat message and produce a JSON object describing it. Respond with \
exactly one JSON object and nothing else, with these fields:\n\
- \"text_clean\" (string, required): the message text with markup, emoji \
spam and boilerplate removed, preserving meaning.\n\
- \"summary\" (string or null): one- or two-sentence summary; null when the \
message is too short to summarize.\n\
- \"topics\" (array of strings): short topical labels, lowercase.\n\
- \"entities\" (array of objects): {\"type\", \"value\", \"confidence\"} \
where confidence is a number between 0 and 1.\n\
- \"language\" (string or null): ISO 639-1 code of the message language.",
    "Message text:\n\n{{text}}",
);

/// Groups processed documents into topic proposals.
pub static TOPIC_DISCOVERY: PromptDef = PromptDef::new(
    "topic_discovery",
    "You are a topic-discovery assistant. You receive a JSON list of \
candidate documents, each with a source_ref, a text excerpt, an optional \
summary and topical labels. Group related documents into topics. Respond \
with exactly one JSON object {\"topics\": [...]}; each topic has:\n\
- \"title\" (string): short descriptive title.\n\
- \"summary\" (string): two or three sentences on what the topic covers.\n\
- \"scope_in\" (array of strings): what belongs in the topic.\n\
- \"scope_out\" (array of strings): adjacent things that do not belong.\n\
- \"type\": \"singleton\" for a single strong document, \"cluster\" for a \
group.\n\
- \"anchors\" (array): {\"anchor_ref\": source_ref, \"score\": 0..1} for \
the documents that best represent the topic, strongest first.\n\
- \"tags\" (array of strings, optional).\n\
Only propose topics the candidates clearly support.",
    "Candidate documents:\n\n{{candidates}}",
);

/// Attaches supporting documents to an accepted topic.
pub static TOPIC_SUPPORT: PromptDef = PromptDef::new(
    "topic_support",
    "You are ranking documents for relevance to one topic. You receive the \
topic (title, summary, scope) and a JSON list of candidate documents. \
Respond with exactly one JSON object {\"items\": [...]}; each item has:\n\
- \"source_ref\" (string): the candidate's source_ref.\n\
- \"score\" (number 0..1): how strongly the document supports the topic.\n\
- \"justification\" (string, optional): one sentence on why.\n\
Omit documents that are unrelated to the topic.",
    "Topic:\n{{topic}}\n\nCandidate documents:\n\n{{candidates}}",
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_id_shape_and_stability() {
        let a = compute_prompt_id("sys", "user");
        let b = compute_prompt_id("sys", "user");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 16);
    }

    #[test]
    fn prompt_id_depends_on_both_parts() {
        let a = compute_prompt_id("sys", "user");
        assert_ne!(a, compute_prompt_id("sys2", "user"));
        assert_ne!(a, compute_prompt_id("sys", "user2"));
        // The separator keeps (a, bc) distinct from (ab, c).
        assert_ne!(compute_prompt_id("a", "bc"), compute_prompt_id("ab", "c"));
    }

    #[test]
    fn cached_id_matches_direct_computation() {
        assert_eq!(
            MESSAGE_EXTRACT.prompt_id(),
            compute_prompt_id(MESSAGE_EXTRACT.system, MESSAGE_EXTRACT.user_template)
        );
    }

    #[test]
    fn render_fills_slots() {
        let out = MESSAGE_EXTRACT.render_user(&[("text", "hello world")]);
        assert!(out.ends_with("hello world"));
        assert!(!out.contains("{{text}}"));
    }

    #[test]
    fn registry_lookup() {
        assert!(get("message_extract").is_some());
        assert!(get("topic_discovery").is_some());
        assert!(get("topic_support").is_some());
        assert!(get("nope").is_none());
    }
}
