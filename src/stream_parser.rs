//! Extract token usage from a sequence of upstream response byte chunks.
//!
//! Scans the **last** chunk first, line by line from end to start, since
//! usage accounting appears in terminal SSE events. Falls back to parsing
//! the whole last chunk as a single JSON document for non-streaming
//! responses. A malformed line never aborts the scan — it's just skipped.

use serde_json::Value;

/// Token usage extracted from a response, or zeroed fields when a usage
/// object was found but some fields were absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Scan chunks for usage. Returns `None` if the final chunk carries no
/// usage data at all (per the "no usage in final chunk → null" invariant).
pub fn extract_usage(chunks: &[Vec<u8>]) -> Option<TokenUsage> {
    let last = chunks.last()?;
    let text = String::from_utf8_lossy(last);

    if let Some(usage) = scan_sse_lines(&text) {
        return Some(usage);
    }

    // Non-streaming fallback: the whole last chunk is one JSON document.
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if let Some(usage) = usage_from_value(&value) {
            return Some(usage);
        }
    }

    None
}

fn scan_sse_lines(text: &str) -> Option<TokenUsage> {
    for line in text.lines().rev() {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim_start();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            // Malformed line: keep scanning, don't abort.
            continue;
        };
        if let Some(usage) = usage_from_value(&value) {
            return Some(usage);
        }
    }
    None
}

/// Precedence: nested `anthropic.usage`, then top-level `usage` with
/// `input_tokens`/`output_tokens`, falling back to `prompt_tokens`/
/// `completion_tokens`. Missing fields default to 0.
fn usage_from_value(value: &Value) -> Option<TokenUsage> {
    if let Some(usage) = value.get("anthropic").and_then(|a| a.get("usage")) {
        if let Some(u) = parse_usage_object(usage) {
            return Some(u);
        }
    }
    if let Some(usage) = value.get("usage") {
        if let Some(u) = parse_usage_object(usage) {
            return Some(u);
        }
    }
    None
}

fn parse_usage_object(usage: &Value) -> Option<TokenUsage> {
    if !usage.is_object() {
        return None;
    }
    let input = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .or_else(|| usage.get("prompt_tokens").and_then(Value::as_u64))
        .unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .or_else(|| usage.get("completion_tokens").and_then(Value::as_u64))
        .unwrap_or(0);
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn no_usage_in_final_chunk_returns_none() {
        let chunks = vec![
            chunk("data: {\"type\":\"content_block_delta\"}\n\n"),
            chunk("data: [DONE]\n\n"),
        ];
        assert_eq!(extract_usage(&chunks), None);
    }

    #[test]
    fn finds_usage_in_terminal_sse_event() {
        let chunks = vec![chunk(
            "data: {\"type\":\"message_delta\"}\n\ndata: {\"usage\":{\"input_tokens\":12,\"output_tokens\":34}}\n\ndata: [DONE]\n\n",
        )];
        assert_eq!(
            extract_usage(&chunks),
            Some(TokenUsage {
                input_tokens: 12,
                output_tokens: 34
            })
        );
    }

    #[test]
    fn scans_last_chunk_only() {
        // Usage sits in the *first* chunk — the parser scans the last
        // chunk only and must not find it there.
        let chunks = vec![
            chunk("data: {\"usage\":{\"input_tokens\":99,\"output_tokens\":1}}\n\n"),
            chunk("data: [DONE]\n\n"),
        ];
        assert_eq!(extract_usage(&chunks), None);
    }

    #[test]
    fn malformed_line_does_not_abort_scan() {
        let chunks = vec![chunk(
            "data: {not valid json\n\ndata: {\"usage\":{\"input_tokens\":5,\"output_tokens\":6}}\n\n",
        )];
        assert_eq!(
            extract_usage(&chunks),
            Some(TokenUsage {
                input_tokens: 5,
                output_tokens: 6
            })
        );
    }

    #[test]
    fn non_streaming_whole_json_fallback() {
        let chunks = vec![chunk(
            "{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":7,\"output_tokens\":8}}",
        )];
        assert_eq!(
            extract_usage(&chunks),
            Some(TokenUsage {
                input_tokens: 7,
                output_tokens: 8
            })
        );
    }

    #[test]
    fn nested_anthropic_usage_takes_precedence() {
        let chunks = vec![chunk(
            "data: {\"anthropic\":{\"usage\":{\"input_tokens\":1,\"output_tokens\":2}},\"usage\":{\"input_tokens\":100,\"output_tokens\":200}}\n\n",
        )];
        assert_eq!(
            extract_usage(&chunks),
            Some(TokenUsage {
                input_tokens: 1,
                output_tokens: 2
            })
        );
    }

    #[test]
    fn openai_style_prompt_completion_tokens_fallback() {
        let chunks = vec![chunk(
            "data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":4}}\n\n",
        )];
        assert_eq!(
            extract_usage(&chunks),
            Some(TokenUsage {
                input_tokens: 3,
                output_tokens: 4
            })
        );
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let chunks = vec![chunk("data: {\"usage\":{\"input_tokens\":9}}\n\n")];
        assert_eq!(
            extract_usage(&chunks),
            Some(TokenUsage {
                input_tokens: 9,
                output_tokens: 0
            })
        );
    }

    #[test]
    fn empty_chunk_list_returns_none() {
        assert_eq!(extract_usage(&[]), None);
    }
}
