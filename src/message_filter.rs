use crate::models::SourceTags;
use crate::rate_limiter::RateLimiter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ingress filtering policy snapshot, applied in a fixed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFilterConfig {
    #[serde(default)]
    pub enable_command_filter: bool,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default)]
    pub strip_emotes: bool,
    #[serde(default = "default_min_length")]
    pub min_message_length: usize,
    #[serde(default = "default_max_length")]
    pub max_message_length: usize,
    #[serde(default)]
    pub user_filters: Vec<UserFilterEntry>,
    #[serde(default = "default_max_messages")]
    pub rate_max_messages: usize,
    #[serde(default = "default_window_secs")]
    pub rate_window_secs: u64,
    #[serde(default)]
    pub blocklist_substrings: Vec<String>,
}

fn default_command_prefix() -> String {
    "!".to_string()
}
fn default_min_length() -> usize {
    1
}
fn default_max_length() -> usize {
    500
}
fn default_max_messages() -> usize {
    5
}
fn default_window_secs() -> u64 {
    10
}

impl Default for MessageFilterConfig {
    fn default() -> Self {
        Self {
            enable_command_filter: true,
            command_prefix: default_command_prefix(),
            strip_emotes: true,
            min_message_length: default_min_length(),
            max_message_length: default_max_length(),
            user_filters: Vec::new(),
            rate_max_messages: default_max_messages(),
            rate_window_secs: default_window_secs(),
            blocklist_substrings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFilterEntry {
    pub username: String,
    pub action: UserFilterAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserFilterAction {
    Block,
    AllowOnly,
}

pub struct FilterOutcome {
    pub accept: bool,
    pub filtered_text: String,
}

/// Applies the ingress policies in §4.2 order: command prefix, emote stripping,
/// length bounds, user allow/block, rate limit, substring blocklist.
pub fn apply_filters(
    user: &str,
    raw_text: &str,
    tags: &SourceTags,
    config: &MessageFilterConfig,
    rate_limiter: &RateLimiter,
) -> FilterOutcome {
    let reject = |text: String| FilterOutcome {
        accept: false,
        filtered_text: text,
    };

    if config.enable_command_filter && raw_text.starts_with(config.command_prefix.as_str()) {
        return reject(raw_text.to_string());
    }

    let mut text = raw_text.to_string();
    if config.strip_emotes && !tags.emote_offsets.is_empty() {
        text = strip_emote_offsets(&text, &tags.emote_offsets);
    }
    text = collapse_whitespace(&text);

    if text.is_empty() || text.len() < config.min_message_length || text.len() > config.max_message_length {
        return reject(text);
    }

    let user_lower = user.to_lowercase();
    if !config.user_filters.is_empty() {
        let matched = config
            .user_filters
            .iter()
            .find(|f| f.username.to_lowercase() == user_lower);
        match matched {
            Some(entry) if entry.action == UserFilterAction::Block => return reject(text),
            None if config
                .user_filters
                .iter()
                .any(|f| f.action == UserFilterAction::AllowOnly) =>
            {
                // An allow-only list exists and this user isn't on it.
                return reject(text);
            }
            _ => {}
        }
    }

    if rate_limiter.is_spam(
        user,
        config.rate_max_messages,
        Duration::from_secs(config.rate_window_secs),
    ) {
        return reject(text);
    }
    rate_limiter.add(user);

    let text_lower = text.to_lowercase();
    if config
        .blocklist_substrings
        .iter()
        .any(|needle| text_lower.contains(&needle.to_lowercase()))
    {
        return reject(text);
    }

    FilterOutcome {
        accept: true,
        filtered_text: text,
    }
}

/// Removes byte-offset emote spans (descending order, so earlier offsets stay valid)
/// and collapses the remaining whitespace.
fn strip_emote_offsets(text: &str, offsets: &[(usize, usize)]) -> String {
    let mut spans: Vec<(usize, usize)> = offsets.to_vec();
    spans.sort_by(|a, b| b.0.cmp(&a.0));
    let mut bytes: Vec<u8> = text.as_bytes().to_vec();
    for (start, end) in spans {
        if end <= bytes.len() && start <= end {
            bytes.drain(start..end);
        }
    }
    String::from_utf8_lossy(&bytes).to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_secs(300))
    }

    #[test]
    fn rejects_command_prefixed_messages() {
        let config = MessageFilterConfig::default();
        let out = apply_filters("alice", "!skip", &SourceTags::default(), &config, &limiter());
        assert!(!out.accept);
    }

    #[test]
    fn rejects_empty_after_strip() {
        let config = MessageFilterConfig::default();
        let out = apply_filters("alice", "   ", &SourceTags::default(), &config, &limiter());
        assert!(!out.accept);
    }

    #[test]
    fn accepts_plain_message() {
        let config = MessageFilterConfig::default();
        let out = apply_filters("alice", "hello there", &SourceTags::default(), &config, &limiter());
        assert!(out.accept);
        assert_eq!(out.filtered_text, "hello there");
    }

    #[test]
    fn collapses_internal_whitespace() {
        let config = MessageFilterConfig::default();
        let out = apply_filters("alice", "hello   there\tfriend", &SourceTags::default(), &config, &limiter());
        assert!(out.accept);
        assert_eq!(out.filtered_text, "hello there friend");
    }

    #[test]
    fn blocked_user_is_rejected() {
        let mut config = MessageFilterConfig::default();
        config.user_filters.push(UserFilterEntry {
            username: "Mallory".to_string(),
            action: UserFilterAction::Block,
        });
        let out = apply_filters("mallory", "hi", &SourceTags::default(), &config, &limiter());
        assert!(!out.accept);
    }

    #[test]
    fn blocklist_substring_is_case_insensitive() {
        let mut config = MessageFilterConfig::default();
        config.blocklist_substrings.push("spamword".to_string());
        let out = apply_filters("alice", "this has SpamWord in it", &SourceTags::default(), &config, &limiter());
        assert!(!out.accept);
    }

    #[test]
    fn filter_is_idempotent_on_already_filtered_text() {
        let config = MessageFilterConfig::default();
        let rl = limiter();
        let first = apply_filters("alice", "hello  there", &SourceTags::default(), &config, &rl);
        let second = apply_filters("alice", &first.filtered_text, &SourceTags::default(), &config, &rl);
        assert_eq!(first.filtered_text, second.filtered_text);
    }
}
