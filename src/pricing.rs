use std::collections::HashMap;

/// Model billed when the configured model identifier has no table entry.
pub const DEFAULT_MODEL: &str = "anthropic/claude-opus-4-6";

/// Prices in cents per one million tokens.
#[derive(Debug, Clone, Copy)]
pub struct PricingEntry {
    pub input_cents_per_million: u64,
    pub output_cents_per_million: u64,
}

/// Immutable model pricing, built once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        let mut add = |model: &str, input: u64, output: u64| {
            entries.insert(
                model.to_string(),
                PricingEntry {
                    input_cents_per_million: input,
                    output_cents_per_million: output,
                },
            );
        };
        add("anthropic/claude-opus-4-6", 1500, 7500);
        add("anthropic/claude-sonnet-4-5", 300, 1500);
        add("openai/gpt-5.2", 250, 1000);
        add("openai/gpt-4.1", 200, 800);
        add("google/gemini-2.5-pro", 125, 500);
        add("xai/grok-3", 300, 1500);
        add("deepseek/deepseek-chat", 27, 110);
        Self { entries }
    }

    pub fn entry(&self, model: &str) -> PricingEntry {
        self.entries
            .get(model)
            .or_else(|| self.entries.get(DEFAULT_MODEL))
            .copied()
            .unwrap_or(PricingEntry {
                input_cents_per_million: 0,
                output_cents_per_million: 0,
            })
    }

    /// Whole-cent cost, ceiling-rounded so fractional cents never go
    /// unbilled. Integer arithmetic throughout.
    pub fn cost_cents(&self, model: &str, tokens_in: u64, tokens_out: u64) -> i64 {
        let entry = self.entry(model);
        let weighted = u128::from(tokens_in) * u128::from(entry.input_cents_per_million)
            + u128::from(tokens_out) * u128::from(entry.output_cents_per_million);
        let cents = weighted.div_ceil(1_000_000);
        i64::try_from(cents).unwrap_or(i64::MAX)
    }
}
