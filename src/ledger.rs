use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One active spending record per user per billing period. Owned by the
/// external ledger store; the proxy never deletes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub user_id: String,
    pub period_start: DateTime<Utc>,
    pub total_cost_cents: i64,
    pub cap_cents: i64,
}

impl CreditBalance {
    pub fn open(user_id: impl Into<String>, cap_cents: i64) -> Self {
        Self {
            user_id: user_id.into(),
            period_start: Utc::now(),
            total_cost_cents: 0,
            cap_cents,
        }
    }

    /// May go negative transiently under concurrent settlement.
    pub fn remaining_cents(&self) -> i64 {
        self.cap_cents - self.total_cost_cents
    }
}

/// Append-only usage row, one per completed billable request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub instance_id: String,
    pub user_id: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_cents: i64,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Transport(String),
    #[error("ledger returned malformed payload: {0}")]
    Malformed(String),
    #[error("balance update lost the compare-and-swap race after {0} attempts")]
    Contention(u32),
}

/// The four operations the proxy needs from a balance/usage store. Any
/// backend satisfying this contract suffices.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn fetch_balance(&self, user_id: &str) -> Result<Option<CreditBalance>, LedgerError>;
    async fn create_balance(&self, balance: &CreditBalance) -> Result<(), LedgerError>;
    /// Must be read-modify-write safe against concurrent settlements for the
    /// same user: serialize or conditionally update, never blind-overwrite.
    async fn add_cost(&self, user_id: &str, cost_cents: i64) -> Result<(), LedgerError>;
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), LedgerError>;
}

const CAS_MAX_ATTEMPTS: u32 = 4;

/// PostgREST-style HTTP ledger. Every round-trip carries a bounded timeout
/// so a slow store cannot stall admission.
pub struct RestLedger {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    timeout: Duration,
}

impl RestLedger {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            service_key: service_key.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn table_url(&self, table: &str, filters: &str) -> String {
        format!(
            "{}/rest/v1/{}{}",
            self.base_url.trim_end_matches('/'),
            table,
            filters
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .timeout(self.timeout)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn read_rows(&self, url: String) -> Result<Vec<Value>, LedgerError> {
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Transport(format!(
                "ledger status {}: {}",
                status, text
            )));
        }
        resp.json::<Vec<Value>>()
            .await
            .map_err(|err| LedgerError::Malformed(err.to_string()))
    }

    async fn insert_row(&self, table: &str, row: Value) -> Result<(), LedgerError> {
        let resp = self
            .request(reqwest::Method::POST, self.table_url(table, ""))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Transport(format!(
                "ledger status {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    /// Conditional update keyed on the observed total. An empty result set
    /// means another settlement won the race; the caller re-reads and
    /// retries.
    async fn patch_total_if_unchanged(
        &self,
        user_id: &str,
        observed_total: i64,
        new_total: i64,
    ) -> Result<bool, LedgerError> {
        let url = self.table_url(
            "credit_balance",
            &format!("?user_id=eq.{user_id}&total_cost_cents=eq.{observed_total}"),
        );
        let resp = self
            .request(reqwest::Method::PATCH, url)
            .header("Prefer", "return=representation")
            .json(&json!({ "total_cost_cents": new_total }))
            .send()
            .await
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Transport(format!(
                "ledger status {}: {}",
                status, text
            )));
        }
        let rows = resp
            .json::<Vec<Value>>()
            .await
            .map_err(|err| LedgerError::Malformed(err.to_string()))?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl LedgerStore for RestLedger {
    async fn fetch_balance(&self, user_id: &str) -> Result<Option<CreditBalance>, LedgerError> {
        let url = self.table_url(
            "credit_balance",
            &format!(
                "?user_id=eq.{user_id}&select=user_id,period_start,total_cost_cents,cap_cents"
            ),
        );
        let rows = self.read_rows(url).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        serde_json::from_value(row)
            .map(Some)
            .map_err(|err| LedgerError::Malformed(err.to_string()))
    }

    async fn create_balance(&self, balance: &CreditBalance) -> Result<(), LedgerError> {
        self.insert_row(
            "credit_balance",
            serde_json::to_value(balance)
                .map_err(|err| LedgerError::Malformed(err.to_string()))?,
        )
        .await
    }

    async fn add_cost(&self, user_id: &str, cost_cents: i64) -> Result<(), LedgerError> {
        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some(balance) = self.fetch_balance(user_id).await? else {
                return Err(LedgerError::Malformed(format!(
                    "no balance row for user {user_id}"
                )));
            };
            let observed = balance.total_cost_cents;
            if self
                .patch_total_if_unchanged(user_id, observed, observed + cost_cents)
                .await?
            {
                return Ok(());
            }
            tracing::debug!(user_id, observed, "balance update raced, retrying");
        }
        Err(LedgerError::Contention(CAS_MAX_ATTEMPTS))
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), LedgerError> {
        self.insert_row(
            "ai_usage",
            serde_json::to_value(record)
                .map_err(|err| LedgerError::Malformed(err.to_string()))?,
        )
        .await
    }
}

#[derive(Default)]
struct MemoryLedgerState {
    balances: HashMap<String, CreditBalance>,
    usage: Vec<UsageRecord>,
}

/// In-process ledger for tests and local development. The mutex serializes
/// balance updates, which satisfies the `add_cost` contract directly.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<MemoryLedgerState>>,
}

impl MemoryLedger {
    pub async fn seed_balance(&self, balance: CreditBalance) {
        let mut guard = self.inner.lock().await;
        guard.balances.insert(balance.user_id.clone(), balance);
    }

    pub async fn balance(&self, user_id: &str) -> Option<CreditBalance> {
        self.inner.lock().await.balances.get(user_id).cloned()
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.inner.lock().await.usage.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn fetch_balance(&self, user_id: &str) -> Result<Option<CreditBalance>, LedgerError> {
        Ok(self.inner.lock().await.balances.get(user_id).cloned())
    }

    async fn create_balance(&self, balance: &CreditBalance) -> Result<(), LedgerError> {
        let mut guard = self.inner.lock().await;
        guard
            .balances
            .entry(balance.user_id.clone())
            .or_insert_with(|| balance.clone());
        Ok(())
    }

    async fn add_cost(&self, user_id: &str, cost_cents: i64) -> Result<(), LedgerError> {
        let mut guard = self.inner.lock().await;
        let balance = guard.balances.get_mut(user_id).ok_or_else(|| {
            LedgerError::Malformed(format!("no balance row for user {user_id}"))
        })?;
        balance.total_cost_cents += cost_cents;
        Ok(())
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), LedgerError> {
        self.inner.lock().await.usage.push(record.clone());
        Ok(())
    }
}
