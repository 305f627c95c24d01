//! Best-effort public URL for a channel message.

/// Resolution order: known username, private `-100…` channel id, bare
/// username-shaped channel id, otherwise nothing.
pub fn resolve_telegram_url(
    channel_username: Option<&str>,
    channel_id: &str,
    message_id: i64,
) -> Option<String> {
    if let Some(username) = channel_username {
        if !username.is_empty() {
            return Some(format!("https://t.me/{username}/{message_id}"));
        }
    }
    if let Some(internal) = channel_id.strip_prefix("-100") {
        return Some(format!("https://t.me/c/{internal}/{message_id}"));
    }
    if !channel_id.starts_with('-')
        && channel_id.len() >= 5
        && channel_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Some(format!("https://t.me/{channel_id}/{message_id}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_wins() {
        assert_eq!(
            resolve_telegram_url(Some("durov"), "-1001234567890", 42).as_deref(),
            Some("https://t.me/durov/42")
        );
    }

    #[test]
    fn private_channel_id() {
        assert_eq!(
            resolve_telegram_url(None, "-1001234567890", 42).as_deref(),
            Some("https://t.me/c/1234567890/42")
        );
    }

    #[test]
    fn username_shaped_channel_id() {
        assert_eq!(
            resolve_telegram_url(None, "test_channel", 42).as_deref(),
            Some("https://t.me/test_channel/42")
        );
    }

    #[test]
    fn unresolvable_ids() {
        assert_eq!(resolve_telegram_url(None, "-42", 1), None);
        assert_eq!(resolve_telegram_url(None, "@demo", 1), None);
        assert_eq!(resolve_telegram_url(None, "abc", 1), None);
        assert_eq!(resolve_telegram_url(Some(""), "-42", 1), None);
    }
}
