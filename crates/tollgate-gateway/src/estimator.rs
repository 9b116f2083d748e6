//! Token estimation and usage measurement.
//!
//! Uses tiktoken's `cl100k_base` encoding, which matches the accounting of
//! most current chat APIs closely enough for admission purposes. Both
//! functions are pure; the handler computes the estimate once per request
//! and carries it through the pipeline.

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse};

/// Structural overhead the upstream bills per message (role markers and
/// separators).
const PER_MESSAGE_OVERHEAD: u64 = 4;

/// Overhead for priming the assistant reply.
const REPLY_PRIMING: u64 = 2;

static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();

fn tokenizer() -> &'static CoreBPE {
    TOKENIZER.get_or_init(|| {
        cl100k_base().expect("cl100k_base vocabulary is embedded and always loads")
    })
}

/// Count tokens in a string.
pub fn count_text(text: &str) -> u64 {
    tokenizer().encode_with_special_tokens(text).len() as u64
}

/// Estimate the prompt-token cost of a chat request.
pub fn estimate_prompt(request: &ChatCompletionRequest) -> u64 {
    request
        .messages
        .iter()
        .map(|m| count_text(&m.role) + count_text(&m.content) + PER_MESSAGE_OVERHEAD)
        .sum::<u64>()
        + REPLY_PRIMING
}

/// Actual `(prompt, completion)` token counts from an upstream response.
pub fn measure_usage(response: &ChatCompletionResponse) -> (u64, u64) {
    (
        response.usage.prompt_tokens,
        response.usage.completion_tokens,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, Choice, Usage};

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages,
            max_tokens: None,
            temperature: None,
            stream: false,
        }
    }

    #[test]
    fn test_estimate_is_deterministic() {
        let req = request(vec![ChatMessage::new("user", "Hello, world!")]);
        assert_eq!(estimate_prompt(&req), estimate_prompt(&req));
    }

    #[test]
    fn test_estimate_includes_overheads() {
        let empty = request(vec![ChatMessage::new("user", "")]);
        // role tokens + 4 per message + 2 priming, with empty content
        assert_eq!(
            estimate_prompt(&empty),
            count_text("user") + PER_MESSAGE_OVERHEAD + REPLY_PRIMING
        );

        let two = request(vec![
            ChatMessage::new("system", "You are helpful."),
            ChatMessage::new("user", "Hi"),
        ]);
        let one = request(vec![ChatMessage::new("system", "You are helpful.")]);
        let added = estimate_prompt(&two) - estimate_prompt(&one);
        assert_eq!(
            added,
            count_text("user") + count_text("Hi") + PER_MESSAGE_OVERHEAD
        );
    }

    #[test]
    fn test_estimate_grows_with_content() {
        let short = request(vec![ChatMessage::new("user", "hi")]);
        let long = request(vec![ChatMessage::new(
            "user",
            "The quick brown fox jumps over the lazy dog, repeatedly and at length.",
        )]);
        assert!(estimate_prompt(&long) > estimate_prompt(&short));
    }

    #[test]
    fn test_measure_usage_reads_response_accounting() {
        let response = ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new("assistant", "ok"),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::new(10, 5),
        };
        assert_eq!(measure_usage(&response), (10, 5));
    }
}
