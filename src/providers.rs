use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Wire conventions of a supported upstream provider family: request path
/// shapes, usage field names, streaming event framing, and error envelopes.
/// Determined per-request, never persisted.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderDialect {
    Anthropic,
    OpenAi,
    Google,
}

impl ProviderDialect {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(ProviderDialect::Anthropic),
            "openai" => Some(ProviderDialect::OpenAi),
            "google" => Some(ProviderDialect::Google),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderDialect::Anthropic => "anthropic",
            ProviderDialect::OpenAi => "openai",
            ProviderDialect::Google => "google",
        }
    }
}

/// Infer the dialect from well-known path substrings; anything unmatched
/// uses the configured default.
pub fn detect_dialect(path: &str, default: ProviderDialect) -> ProviderDialect {
    if path.contains("/v1/messages") {
        ProviderDialect::Anthropic
    } else if path.contains("/chat/completions") {
        ProviderDialect::OpenAi
    } else if path.contains("generateContent") {
        ProviderDialect::Google
    } else {
        default
    }
}

/// Upstream base authority per dialect. Defaults to the public API hosts;
/// each entry can be overridden for self-hosted gateways and tests.
#[derive(Debug, Clone)]
pub struct UpstreamMap {
    anthropic: String,
    openai: String,
    google: String,
}

impl Default for UpstreamMap {
    fn default() -> Self {
        Self {
            anthropic: "https://api.anthropic.com".to_string(),
            openai: "https://api.openai.com".to_string(),
            google: "https://generativelanguage.googleapis.com".to_string(),
        }
    }
}

impl UpstreamMap {
    pub fn new(
        anthropic: Option<String>,
        openai: Option<String>,
        google: Option<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            anthropic: anthropic.unwrap_or(defaults.anthropic),
            openai: openai.unwrap_or(defaults.openai),
            google: google.unwrap_or(defaults.google),
        }
    }

    pub fn resolve(&self, dialect: ProviderDialect) -> &str {
        match dialect {
            ProviderDialect::Anthropic => &self.anthropic,
            ProviderDialect::OpenAi => &self.openai,
            ProviderDialect::Google => &self.google,
        }
    }
}

const CREDIT_EXCEEDED_MESSAGE: &str =
    "Your monthly AI credits have been used up. They will be renewed in the next billing cycle.";

/// Rejection payload shaped like the provider's own rate-limit error so the
/// caller's SDK surfaces it without special-casing the proxy.
pub fn credit_exceeded_body(dialect: ProviderDialect) -> Value {
    match dialect {
        ProviderDialect::Anthropic => json!({
            "type": "error",
            "error": {
                "type": "rate_limit_error",
                "message": CREDIT_EXCEEDED_MESSAGE,
            },
        }),
        ProviderDialect::OpenAi | ProviderDialect::Google => json!({
            "error": {
                "message": CREDIT_EXCEEDED_MESSAGE,
                "type": "rate_limit_error",
                "code": "credit_exceeded",
            },
        }),
    }
}

/// A request opts into streaming relay via `"stream": true` in its body.
pub fn is_streaming_request(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dialect_from_path() {
        let default = ProviderDialect::Anthropic;
        assert_eq!(
            detect_dialect("/v1/messages", default),
            ProviderDialect::Anthropic
        );
        assert_eq!(
            detect_dialect("/v1/chat/completions", default),
            ProviderDialect::OpenAi
        );
        assert_eq!(
            detect_dialect(
                "/v1beta/models/gemini-2.5-pro:streamGenerateContent",
                default
            ),
            ProviderDialect::Google
        );
        assert_eq!(
            detect_dialect("/v1/embeddings", ProviderDialect::OpenAi),
            ProviderDialect::OpenAi
        );
    }

    #[test]
    fn streaming_flag_requires_literal_true() {
        assert!(is_streaming_request(br#"{"stream":true}"#));
        assert!(!is_streaming_request(br#"{"stream":false}"#));
        assert!(!is_streaming_request(br#"{"stream":"true"}"#));
        assert!(!is_streaming_request(br#"{}"#));
        assert!(!is_streaming_request(b"not json"));
    }

    #[test]
    fn rejection_envelopes_match_provider_shapes() {
        let anthropic = credit_exceeded_body(ProviderDialect::Anthropic);
        assert_eq!(
            anthropic.get("type").and_then(Value::as_str),
            Some("error")
        );
        assert_eq!(
            anthropic
                .get("error")
                .and_then(|e| e.get("type"))
                .and_then(Value::as_str),
            Some("rate_limit_error")
        );

        let openai = credit_exceeded_body(ProviderDialect::OpenAi);
        assert_eq!(
            openai
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(Value::as_str),
            Some("credit_exceeded")
        );
    }

    #[test]
    fn upstream_overrides_replace_defaults() {
        let map = UpstreamMap::new(Some("http://127.0.0.1:9999".to_string()), None, None);
        assert_eq!(
            map.resolve(ProviderDialect::Anthropic),
            "http://127.0.0.1:9999"
        );
        assert_eq!(
            map.resolve(ProviderDialect::OpenAi),
            "https://api.openai.com"
        );
    }
}
