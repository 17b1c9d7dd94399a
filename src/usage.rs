use crate::providers::ProviderDialect;
use serde_json::Value;

/// Token counts observed for one request. Absent or malformed usage fields
/// read as zero, never as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.tokens_in == 0 && self.tokens_out == 0
    }
}

/// Per-stream usage state. Counts only move forward: a later event's
/// non-zero value supersedes what came before, a zero never clobbers a
/// count already observed.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    usage: TokenUsage,
}

impl UsageAccumulator {
    pub fn record_in(&mut self, tokens: u64) {
        if tokens > 0 {
            self.usage.tokens_in = tokens;
        }
    }

    pub fn record_out(&mut self, tokens: u64) {
        if tokens > 0 {
            self.usage.tokens_out = tokens;
        }
    }

    pub fn finish(self) -> TokenUsage {
        self.usage
    }
}

fn u64_at<'a, I>(value: &'a Value, path: I) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    let mut current = value;
    for key in path {
        match current.get(key) {
            Some(next) => current = next,
            None => return 0,
        }
    }
    current.as_u64().unwrap_or(0)
}

/// Read the dialect's usage fields out of a complete response document.
pub fn extract_from_document(dialect: ProviderDialect, body: &Value) -> TokenUsage {
    match dialect {
        ProviderDialect::Anthropic => TokenUsage {
            tokens_in: u64_at(body, ["usage", "input_tokens"]),
            tokens_out: u64_at(body, ["usage", "output_tokens"]),
        },
        ProviderDialect::OpenAi => TokenUsage {
            tokens_in: u64_at(body, ["usage", "prompt_tokens"]),
            tokens_out: u64_at(body, ["usage", "completion_tokens"]),
        },
        ProviderDialect::Google => TokenUsage {
            tokens_in: u64_at(body, ["usageMetadata", "promptTokenCount"]),
            tokens_out: u64_at(body, ["usageMetadata", "candidatesTokenCount"]),
        },
    }
}

/// Fold one decoded streaming event into the accumulator. Safe to call on
/// every event of the stream, including ones that carry no usage at all.
pub fn extract_from_event(dialect: ProviderDialect, acc: &mut UsageAccumulator, event: &Value) {
    match dialect {
        ProviderDialect::Anthropic => {
            match event.get("type").and_then(Value::as_str) {
                // message_start carries the input count up front.
                Some("message_start") => {
                    acc.record_in(u64_at(event, ["message", "usage", "input_tokens"]));
                }
                // message_delta carries the running output count.
                Some("message_delta") => {
                    acc.record_out(u64_at(event, ["usage", "output_tokens"]));
                }
                _ => {}
            }
            // Some relays flatten usage onto the terminal event.
            if event.get("usage").is_some() {
                acc.record_in(u64_at(event, ["usage", "input_tokens"]));
                acc.record_out(u64_at(event, ["usage", "output_tokens"]));
            }
        }
        ProviderDialect::OpenAi => {
            // Usage arrives only on the final chunk; earlier chunks have
            // usage: null.
            acc.record_in(u64_at(event, ["usage", "prompt_tokens"]));
            acc.record_out(u64_at(event, ["usage", "completion_tokens"]));
        }
        ProviderDialect::Google => {
            acc.record_in(u64_at(event, ["usageMetadata", "promptTokenCount"]));
            acc.record_out(u64_at(event, ["usageMetadata", "candidatesTokenCount"]));
        }
    }
}
