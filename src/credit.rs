use crate::ledger::{CreditBalance, LedgerError, LedgerStore, UsageRecord};
use crate::pricing::PricingTable;
use crate::usage::TokenUsage;
use chrono::Utc;
use std::sync::Arc;

/// Pre-flight admission decision for one request.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub remaining_cents: i64,
    pub admitted: bool,
}

/// Orchestrates the ledger and the pricing table: admit/reject up front,
/// convert observed usage into a charged cost afterwards. Admission and
/// settlement are deliberately not atomic; concurrent in-flight requests
/// may overspend the cap by at most their own cost.
#[derive(Clone)]
pub struct CreditGuard {
    ledger: Arc<dyn LedgerStore>,
    pricing: Arc<PricingTable>,
    user_id: String,
    instance_id: String,
    default_cap_cents: i64,
}

impl CreditGuard {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        pricing: Arc<PricingTable>,
        user_id: impl Into<String>,
        instance_id: impl Into<String>,
        default_cap_cents: i64,
    ) -> Self {
        Self {
            ledger,
            pricing,
            user_id: user_id.into(),
            instance_id: instance_id.into(),
            default_cap_cents,
        }
    }

    /// Reads the user's balance, creating it lazily with the default cap on
    /// first sight. Not admitted iff no credit remains.
    pub async fn check_admission(&self) -> Result<Admission, LedgerError> {
        match self.ledger.fetch_balance(&self.user_id).await? {
            Some(balance) => {
                let remaining_cents = balance.remaining_cents();
                Ok(Admission {
                    remaining_cents,
                    admitted: remaining_cents > 0,
                })
            }
            None => {
                let balance = CreditBalance::open(self.user_id.clone(), self.default_cap_cents);
                self.ledger.create_balance(&balance).await?;
                Ok(Admission {
                    remaining_cents: self.default_cap_cents,
                    admitted: true,
                })
            }
        }
    }

    /// Prices the observed usage, appends the usage record, and increments
    /// the period total. The usage-record write is best-effort; only the
    /// balance increment can fail the settlement.
    pub async fn settle(&self, model: &str, usage: TokenUsage) -> Result<i64, LedgerError> {
        let cost_cents = self
            .pricing
            .cost_cents(model, usage.tokens_in, usage.tokens_out);
        let record = UsageRecord {
            instance_id: self.instance_id.clone(),
            user_id: self.user_id.clone(),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_cents,
            model: model.to_string(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.ledger.append_usage(&record).await {
            tracing::warn!("usage record write failed: {err}");
        }
        self.ledger.add_cost(&self.user_id, cost_cents).await?;
        Ok(cost_cents)
    }
}
