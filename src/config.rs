use crate::providers::{ProviderDialect, UpstreamMap};
use serde::{Deserialize, Serialize};

/// What to do with a request when the ledger cannot answer the admission
/// check. The default favors availability: requests go through unmetered
/// until the ledger recovers.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    FailOpen,
    FailClosed,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::FailOpen
    }
}

impl AdmissionPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fail_open" => Some(AdmissionPolicy::FailOpen),
            "fail_closed" => Some(AdmissionPolicy::FailClosed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen: String,
    pub metrics_path: String,
    pub ledger_url: String,
    pub ledger_key: String,
    pub user_id: String,
    pub instance_id: String,
    /// Model identifier billed against the pricing table.
    pub model: String,
    pub default_dialect: ProviderDialect,
    pub admission_policy: AdmissionPolicy,
    pub default_cap_cents: i64,
    pub ledger_timeout_ms: u64,
    pub max_request_bytes: usize,
    pub upstreams: UpstreamMap,
}

impl ProxySettings {
    pub fn from_env() -> Self {
        let listen = env_var("TOLLGATE_LISTEN").unwrap_or_else(|| "127.0.0.1:4100".to_string());
        let metrics_path = env_var("TOLLGATE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let ledger_url = env_var("TOLLGATE_LEDGER_URL").unwrap_or_default();
        let ledger_key = env_var("TOLLGATE_LEDGER_KEY").unwrap_or_default();
        let user_id = env_var("TOLLGATE_USER_ID").unwrap_or_default();
        let instance_id = env_var("TOLLGATE_INSTANCE_ID").unwrap_or_default();
        let model = env_var("TOLLGATE_MODEL")
            .unwrap_or_else(|| crate::pricing::DEFAULT_MODEL.to_string());
        let default_dialect = env_var("TOLLGATE_DEFAULT_PROVIDER")
            .and_then(|v| ProviderDialect::from_str(&v))
            .unwrap_or(ProviderDialect::Anthropic);
        let admission_policy = env_var("TOLLGATE_ADMISSION_POLICY")
            .and_then(|v| AdmissionPolicy::from_str(&v))
            .unwrap_or_default();
        let default_cap_cents = env_var("TOLLGATE_DEFAULT_CAP_CENTS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1500);
        let ledger_timeout_ms = env_var("TOLLGATE_LEDGER_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3_000);
        let max_request_bytes = env_var("TOLLGATE_MAX_REQUEST_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10 * 1024 * 1024);
        let upstreams = UpstreamMap::new(
            env_var("TOLLGATE_UPSTREAM_ANTHROPIC"),
            env_var("TOLLGATE_UPSTREAM_OPENAI"),
            env_var("TOLLGATE_UPSTREAM_GOOGLE"),
        );
        Self {
            listen,
            metrics_path,
            ledger_url,
            ledger_key,
            user_id,
            instance_id,
            model,
            default_dialect,
            admission_policy,
            default_cap_cents,
            ledger_timeout_ms,
            max_request_bytes,
            upstreams,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
