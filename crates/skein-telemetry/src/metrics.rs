use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use skein_core::events::Envelope;
use skein_core::ids::ThreadId;
use skein_core::sink::EventObserver;
use skein_core::usage::{AggregatedMetrics, ExecutionMetrics, ModelUsage, PricingTable, UsageRecord};

/// Cost is accumulated in nano-dollars so it fits an atomic integer.
const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// Per-model monotonic counters.
#[derive(Default)]
struct ModelCounters {
    calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    total_duration_ms: AtomicU64,
    ttft_total_ms: AtomicU64,
    ttft_samples: AtomicU64,
    cost_nanos: AtomicU64,
}

impl ModelCounters {
    fn record(&self, record: &UsageRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens.fetch_add(record.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(record.output_tokens, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(record.duration_ms, Ordering::Relaxed);
        if let Some(ttft) = record.time_to_first_token_ms {
            self.ttft_total_ms.fetch_add(ttft, Ordering::Relaxed);
            self.ttft_samples.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = (record.cost_usd.max(0.0) * NANOS_PER_USD).round() as u64;
        self.cost_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn load(&self) -> ModelUsage {
        ModelUsage {
            calls: self.calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
            ttft_total_ms: self.ttft_total_ms.load(Ordering::Relaxed),
            ttft_samples: self.ttft_samples.load(Ordering::Relaxed),
            cost_usd: self.cost_nanos.load(Ordering::Relaxed) as f64 / NANOS_PER_USD,
        }
    }
}

/// Process-wide usage accumulator.
///
/// Keeps per-model counters across all executions plus the folded
/// [`ExecutionMetrics`] of each thread. Counters only grow; [`reset`](Self::reset)
/// is the single way to zero them.
pub struct MetricsAggregator {
    models: RwLock<HashMap<String, ModelCounters>>,
    executions: Mutex<HashMap<ThreadId, ExecutionMetrics>>,
    pricing: RwLock<PricingTable>,
    since: RwLock<DateTime<Utc>>,
}

static GLOBAL: OnceLock<Arc<MetricsAggregator>> = OnceLock::new();

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(PricingTable::default())
    }
}

impl MetricsAggregator {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            pricing: RwLock::new(pricing),
            since: RwLock::new(Utc::now()),
        }
    }

    /// The process-wide instance, created on first use.
    pub fn global() -> Arc<MetricsAggregator> {
        GLOBAL.get_or_init(|| Arc::new(MetricsAggregator::default())).clone()
    }

    pub fn set_pricing(&self, pricing: PricingTable) {
        *self.pricing.write() = pricing;
    }

    /// Fold one envelope into its execution and, for a new model call, into
    /// the per-model counters.
    pub fn observe_envelope(&self, env: &Envelope) {
        let record = {
            let pricing = self.pricing.read();
            let mut executions = self.executions.lock();
            executions
                .entry(env.thread_id.clone())
                .or_insert_with(|| ExecutionMetrics::new(env.thread_id.clone()))
                .observe(env, &pricing)
        };
        if let Some(record) = record {
            tracing::debug!(
                thread_id = %record.thread_id,
                call_id = %record.call_id,
                model = %record.model,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                "usage recorded"
            );
            self.record_usage(&record);
        }
    }

    /// Add one usage record to the per-model counters.
    pub fn record_usage(&self, record: &UsageRecord) {
        let models = self.models.read();
        if let Some(c) = models.get(&record.model) {
            c.record(record);
            return;
        }
        drop(models);
        let mut models = self.models.write();
        models.entry(record.model.clone()).or_default().record(record);
    }

    pub fn model(&self, model: &str) -> Option<ModelUsage> {
        self.models.read().get(model).map(ModelCounters::load)
    }

    pub fn snapshot(&self) -> AggregatedMetrics {
        let models = self.models.read();
        let by_model: BTreeMap<String, ModelUsage> =
            models.iter().map(|(name, c)| (name.clone(), c.load())).collect();
        drop(models);
        let mut totals = ModelUsage::default();
        for usage in by_model.values() {
            totals.absorb(usage);
        }
        AggregatedMetrics {
            by_model,
            totals,
            since: Some(*self.since.read()),
            captured_at: Some(Utc::now()),
        }
    }

    pub fn execution(&self, thread_id: &ThreadId) -> Option<ExecutionMetrics> {
        self.executions.lock().get(thread_id).cloned()
    }

    pub fn active_executions(&self) -> usize {
        self.executions.lock().values().filter(|m| m.is_running()).count()
    }

    /// Drop the per-thread fold of a finished thread. Model counters keep
    /// its contribution.
    pub fn forget_execution(&self, thread_id: &ThreadId) -> bool {
        self.executions.lock().remove(thread_id).is_some()
    }

    /// Operator action: zero every counter and forget every execution.
    pub fn reset(&self) {
        self.models.write().clear();
        self.executions.lock().clear();
        *self.since.write() = Utc::now();
        tracing::info!("metrics aggregator reset");
    }
}

impl EventObserver for MetricsAggregator {
    fn observe(&self, envelope: &Envelope) {
        self.observe_envelope(envelope);
    }

    fn release(&self, thread_id: &ThreadId) {
        self.forget_execution(thread_id);
    }
}
