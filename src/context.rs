//! Context management utilities: token estimation and history truncation.
//!
//! These are opt-in helpers — nothing here runs automatically. The router
//! uses `estimate_tokens`-style per-message counting as its fallback token
//! accounting when a stream ends without a provider-reported usage figure
//! (spec §4.1: `input_tokens = Σ ceil(len(text_of_each_message)/4)`).

use crate::message::{ContentBlock, Message, MessageRole};

/// Character-based token approximation (1 token ≈ 4 characters). This is a
/// conservative estimate that holds up reasonably across model families and
/// is used both for context-window bookkeeping and as the router's
/// last-resort usage estimator.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;

    for message in messages {
        total_chars += 8; // role formatting overhead

        for block in &message.content {
            if let ContentBlock::Text(text) = block {
                total_chars += text.text.len();
            }
        }

        if let Some(tool_calls) = &message.tool_calls {
            for call in tool_calls {
                total_chars += call.function.name.len();
                total_chars += call.function.arguments.len();
            }
        }
    }

    total_chars += 16; // conversation-level overhead

    (total_chars + 3) / 4
}

/// Ceiling-divide a single string's length by 4 — the router's fallback
/// per-message estimator named directly in spec §4.1.
pub fn estimate_tokens_for_text(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Truncate message history, keeping recent messages. Always preserves the
/// system prompt (if present and requested) and keeps the most recent
/// `keep` messages. This is a simple truncation — it does not attempt to
/// preserve tool call chains.
pub fn truncate_messages(messages: &[Message], keep: usize, preserve_system: bool) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    if messages.len() <= keep {
        return messages.to_vec();
    }

    let has_system = preserve_system && messages[0].role == MessageRole::System;

    if has_system {
        let mut result = vec![messages[0].clone()];
        if keep > 0 && messages.len() > 1 {
            let start = messages.len().saturating_sub(keep);
            result.extend_from_slice(&messages[start..]);
        }
        result
    } else if keep > 0 {
        let start = messages.len().saturating_sub(keep);
        messages[start..].to_vec()
    } else {
        Vec::new()
    }
}

/// Convenience check combining estimation with a threshold: true if
/// estimated tokens exceed `limit * margin`.
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentBlock, Message, MessageRole, TextBlock};

    #[test]
    fn test_estimate_tokens_empty() {
        let messages: Vec<Message> = vec![];
        assert_eq!(estimate_tokens(&messages), 0);
    }

    #[test]
    fn test_estimate_tokens_simple() {
        let messages = vec![Message::new(
            MessageRole::User,
            vec![ContentBlock::Text(TextBlock::new("Hello world"))],
        )];
        let tokens = estimate_tokens(&messages);
        assert!(tokens >= 3 && tokens <= 10);
    }

    #[test]
    fn test_estimate_tokens_for_text_matches_spec_formula() {
        assert_eq!(estimate_tokens_for_text(""), 0);
        assert_eq!(estimate_tokens_for_text("abcd"), 1);
        assert_eq!(estimate_tokens_for_text("abcde"), 2);
    }

    #[test]
    fn test_truncate_messages_preserve_system() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
            Message::user("Message 4"),
        ];
        let truncated = truncate_messages(&messages, 2, true);
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated[0].role, MessageRole::System);
    }

    #[test]
    fn test_truncate_messages_no_preserve() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
        ];
        let truncated = truncate_messages(&messages, 2, false);
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].role, MessageRole::User);
    }

    #[test]
    fn test_is_approaching_limit() {
        let messages = vec![Message::user("x".repeat(1000))];
        assert!(!is_approaching_limit(&messages, 1000, 0.9));
        assert!(is_approaching_limit(&messages, 200, 0.9));
    }
}
