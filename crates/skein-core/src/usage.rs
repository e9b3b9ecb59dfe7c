//! Token usage, pricing and the per-execution metrics fold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::events::{Envelope, Event};
use crate::ids::{CallId, ThreadId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Price of one model, per million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(default = "default_cache_read_multiplier")]
    pub cache_read_multiplier: f64,
    #[serde(default = "default_cache_write_multiplier")]
    pub cache_write_multiplier: f64,
}

fn default_cache_read_multiplier() -> f64 {
    0.1
}

fn default_cache_write_multiplier() -> f64 {
    1.25
}

impl ModelPricing {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
            cache_read_multiplier: 0.1,
            cache_write_multiplier: 1.25,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let per_tok_in = self.input_per_mtok / 1_000_000.0;
        let per_tok_out = self.output_per_mtok / 1_000_000.0;
        usage.input_tokens as f64 * per_tok_in
            + usage.output_tokens as f64 * per_tok_out
            + usage.cache_read_tokens as f64 * per_tok_in * self.cache_read_multiplier
            + usage.cache_creation_tokens as f64 * per_tok_in * self.cache_write_multiplier
    }
}

/// Model name (or name prefix) → pricing. Unknown models cost nothing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable(BTreeMap<String, ModelPricing>);

impl Default for PricingTable {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert("claude-opus-4".to_owned(), ModelPricing::new(15.0, 75.0));
        table.insert("claude-sonnet-4".to_owned(), ModelPricing::new(3.0, 15.0));
        table.insert("claude-haiku-4".to_owned(), ModelPricing::new(1.0, 5.0));
        table.insert("gpt-4o".to_owned(), ModelPricing::new(2.5, 10.0));
        table.insert("gpt-4o-mini".to_owned(), ModelPricing::new(0.15, 0.6));
        table.insert("gemini-2.5-pro".to_owned(), ModelPricing::new(1.25, 10.0));
        table.insert("gemini-2.5-flash".to_owned(), ModelPricing::new(0.3, 2.5));
        Self(table)
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.0.insert(model.into(), pricing);
    }

    /// Exact match first, then the longest registered prefix.
    pub fn lookup(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(p) = self.0.get(model) {
            return Some(p);
        }
        self.0
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, p)| p)
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.lookup(model).map(|p| p.cost(usage)).unwrap_or(0.0)
    }

    pub fn merge(&mut self, other: PricingTable) {
        self.0.extend(other.0);
    }
}

/// Usage of one model call, keyed by `(thread_id, call_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub thread_id: ThreadId,
    pub call_id: CallId,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<u64>,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Build a record from a `GenerationEnd` envelope. Other events yield `None`.
    ///
    /// A missing `call_id` falls back to one derived from the model and the
    /// envelope sequence, which is stable across redelivery.
    pub fn from_envelope(env: &Envelope, pricing: &PricingTable) -> Option<Self> {
        let Event::GenerationEnd {
            model,
            usage,
            call_id,
            duration_ms,
            time_to_first_token_ms,
            ..
        } = &env.event
        else {
            return None;
        };
        let call_id = call_id
            .clone()
            .unwrap_or_else(|| CallId::from_raw(format!("{model}#{}", env.sequence)));
        Some(Self {
            thread_id: env.thread_id.clone(),
            call_id,
            model: model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            duration_ms: duration_ms.unwrap_or(0),
            time_to_first_token_ms: *time_to_first_token_ms,
            cost_usd: pricing.cost(model, usage),
            recorded_at: env.timestamp,
        })
    }
}

/// Accumulated usage for one model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_duration_ms: u64,
    pub ttft_total_ms: u64,
    pub ttft_samples: u64,
    pub cost_usd: f64,
}

impl ModelUsage {
    pub fn record(&mut self, record: &UsageRecord) {
        self.calls += 1;
        self.input_tokens = self.input_tokens.saturating_add(record.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(record.output_tokens);
        self.total_duration_ms = self.total_duration_ms.saturating_add(record.duration_ms);
        if let Some(ttft) = record.time_to_first_token_ms {
            self.ttft_total_ms = self.ttft_total_ms.saturating_add(ttft);
            self.ttft_samples += 1;
        }
        self.cost_usd += record.cost_usd;
    }

    pub fn absorb(&mut self, other: &ModelUsage) {
        self.calls += other.calls;
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_duration_ms = self.total_duration_ms.saturating_add(other.total_duration_ms);
        self.ttft_total_ms = self.ttft_total_ms.saturating_add(other.ttft_total_ms);
        self.ttft_samples += other.ttft_samples;
        self.cost_usd += other.cost_usd;
    }

    pub fn avg_ttft_ms(&self) -> Option<f64> {
        (self.ttft_samples > 0).then(|| self.ttft_total_ms as f64 / self.ttft_samples as f64)
    }

    pub fn avg_duration_ms(&self) -> Option<f64> {
        (self.calls > 0).then(|| self.total_duration_ms as f64 / self.calls as f64)
    }
}

/// Per-model totals across all executions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub by_model: BTreeMap<String, ModelUsage>,
    pub totals: ModelUsage,
    pub since: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Metrics of one execution, folded from its envelopes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub thread_id: ThreadId,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub generation_calls: u64,
    pub tool_calls: u64,
    pub errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_duration_ms: u64,
    pub cost_usd: f64,
    pub by_model: BTreeMap<String, ModelUsage>,
    #[serde(skip)]
    seen_calls: HashSet<CallId>,
}

impl ExecutionMetrics {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            ..Default::default()
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, ExecutionStatus::Running)
    }

    /// Fold one envelope. Returns the usage record when a new model call
    /// was counted; a repeated `call_id` is ignored.
    pub fn observe(&mut self, env: &Envelope, pricing: &PricingTable) -> Option<UsageRecord> {
        if self.started_at.is_none() && env.event.is_substantive() {
            self.started_at = Some(env.timestamp);
            if self.status == ExecutionStatus::Pending {
                self.status = ExecutionStatus::Running;
            }
        }

        match &env.event {
            Event::GenerationEnd { .. } => {
                let record = UsageRecord::from_envelope(env, pricing)?;
                if !self.seen_calls.insert(record.call_id.clone()) {
                    return None;
                }
                self.generation_calls += 1;
                self.input_tokens = self.input_tokens.saturating_add(record.input_tokens);
                self.output_tokens = self.output_tokens.saturating_add(record.output_tokens);
                self.total_duration_ms = self.total_duration_ms.saturating_add(record.duration_ms);
                self.cost_usd += record.cost_usd;
                self.by_model.entry(record.model.clone()).or_default().record(&record);
                Some(record)
            }
            Event::ToolEnd { .. } => {
                self.tool_calls += 1;
                None
            }
            Event::Error { kind, .. } => {
                self.errors += 1;
                if kind.is_terminal() {
                    self.finish(env.timestamp, ExecutionStatus::Failed);
                }
                None
            }
            Event::GraphEnd { .. } => {
                self.finish(env.timestamp, ExecutionStatus::Completed);
                None
            }
            Event::StateSnapshot(snapshot) if snapshot.is_final() => {
                self.finish(env.timestamp, ExecutionStatus::Completed);
                None
            }
            _ => None,
        }
    }

    fn finish(&mut self, at: DateTime<Utc>, status: ExecutionStatus) {
        if self.ended_at.is_none() {
            self.ended_at = Some(at);
        }
        if self.status != ExecutionStatus::Failed {
            self.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::events::Origin;

    fn gen_end(seq: u64, model: &str, call: Option<&str>, input: u64, output: u64) -> Envelope {
        Envelope::new(
            &Origin::thread("t1".into()),
            seq,
            Event::GenerationEnd {
                model: model.into(),
                output_preview: String::new(),
                usage: TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    ..Default::default()
                },
                tool_calls: vec![],
                call_id: call.map(CallId::from),
                duration_ms: Some(100),
                time_to_first_token_ms: Some(40),
            },
        )
    }

    #[test]
    fn pricing_prefix_lookup() {
        let table = PricingTable::default();
        let p = table.lookup("claude-sonnet-4-20250514").unwrap();
        assert_eq!(p.input_per_mtok, 3.0);
        assert!(table.lookup("mystery-model").is_none());
        assert_eq!(table.cost("mystery-model", &TokenUsage::default()), 0.0);
    }

    #[test]
    fn longest_prefix_wins() {
        let table = PricingTable::default();
        assert_eq!(table.lookup("gpt-4o-mini-2024").unwrap().input_per_mtok, 0.15);
        assert_eq!(table.lookup("gpt-4o-2024").unwrap().input_per_mtok, 2.5);
    }

    #[test]
    fn cost_per_million() {
        let p = ModelPricing::new(3.0, 15.0);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            ..Default::default()
        };
        assert!((p.cost(&usage) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_call_is_ignored() {
        let pricing = PricingTable::default();
        let mut m = ExecutionMetrics::new("t1".into());
        assert!(m.observe(&gen_end(0, "claude-sonnet-4", Some("c1"), 10, 5), &pricing).is_some());
        assert!(m.observe(&gen_end(0, "claude-sonnet-4", Some("c1"), 10, 5), &pricing).is_none());
        assert_eq!(m.generation_calls, 1);
        assert_eq!(m.input_tokens, 10);
        assert_eq!(m.status, ExecutionStatus::Running);
    }

    #[test]
    fn models_accumulate_independently() {
        let pricing = PricingTable::default();
        let mut m = ExecutionMetrics::new("t1".into());
        m.observe(&gen_end(0, "claude-sonnet-4", Some("a"), 100, 10), &pricing);
        m.observe(&gen_end(1, "gpt-4o", Some("b"), 7, 3), &pricing);
        m.observe(&gen_end(2, "claude-sonnet-4", Some("c"), 1, 1), &pricing);
        assert_eq!(m.by_model["claude-sonnet-4"].calls, 2);
        assert_eq!(m.by_model["claude-sonnet-4"].input_tokens, 101);
        assert_eq!(m.by_model["gpt-4o"].calls, 1);
        assert_eq!(m.by_model["gpt-4o"].output_tokens, 3);
        assert_eq!(m.by_model["gpt-4o"].avg_ttft_ms(), Some(40.0));
    }

    #[test]
    fn hostile_token_counts_saturate() {
        let huge = TokenUsage {
            input_tokens: u64::MAX,
            output_tokens: 5,
            ..Default::default()
        };
        assert_eq!(huge.total(), u64::MAX);

        let pricing = PricingTable::empty();
        let mut m = ExecutionMetrics::new("t1".into());
        m.observe(&gen_end(0, "m", Some("a"), u64::MAX, 1), &pricing);
        m.observe(&gen_end(1, "m", Some("b"), 10, 1), &pricing);
        assert_eq!(m.input_tokens, u64::MAX);
        assert_eq!(m.by_model["m"].input_tokens, u64::MAX);
        assert_eq!(m.by_model["m"].calls, 2);
    }

    #[test]
    fn missing_call_id_derives_from_sequence() {
        let pricing = PricingTable::empty();
        let env = gen_end(9, "m", None, 1, 1);
        let record = UsageRecord::from_envelope(&env, &pricing).unwrap();
        assert_eq!(record.call_id.as_str(), "m#9");
        assert_eq!(record.cost_usd, 0.0);
    }

    #[test]
    fn terminal_events_finish_the_execution() {
        let pricing = PricingTable::default();
        let origin = Origin::thread("t1".into());
        let mut m = ExecutionMetrics::new("t1".into());
        m.observe(&Envelope::new(&origin, 0, Event::GraphStart), &pricing);
        m.observe(
            &Envelope::new(
                &origin,
                1,
                Event::Error {
                    kind: ErrorKind::EngineFailure,
                    message: "x".into(),
                },
            ),
            &pricing,
        );
        m.observe(&Envelope::new(&origin, 2, Event::GraphEnd { response: String::new() }), &pricing);
        assert_eq!(m.status, ExecutionStatus::Failed);
        assert_eq!(m.errors, 1);
        assert!(m.ended_at.is_some());
    }
}
