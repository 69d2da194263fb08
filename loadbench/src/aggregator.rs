//! Run statistics over terminal request records.
mod series;

use loadbench_core::{Distribution, ErrorKind, Outcome, RequestRecord, RunSummary, Throughput};
use series::Series;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Shared, order-independent accumulator of [`RequestRecord`]s.
///
/// Cloning yields another handle to the same state, so any number of writers can submit
/// concurrently. Token totals and the e2e, TTFT and TBT series cover successful requests only;
/// utilization is taken from every record that reported it.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    run_id: Uuid,
    state: Arc<Mutex<State>>,
}

#[derive(Debug)]
struct State {
    total: u64,
    successes: u64,
    failures_by_kind: BTreeMap<ErrorKind, u64>,
    throttled_attempts: u64,
    retries: u64,
    context_tokens: u64,
    generated_tokens: u64,
    e2e: Series,
    ttft: Series,
    tbt: Series,
    utilization: Series,
    latency_adjustment: Option<Duration>,
    model: Option<String>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_run_id(Uuid::new_v4())
    }

    pub fn with_run_id(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: Arc::new(Mutex::new(State {
                total: 0,
                successes: 0,
                failures_by_kind: BTreeMap::new(),
                throttled_attempts: 0,
                retries: 0,
                context_tokens: 0,
                generated_tokens: 0,
                e2e: Series::new(),
                ttft: Series::new(),
                tbt: Series::new(),
                utilization: Series::new(),
                latency_adjustment: None,
                model: None,
            })),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Network latency to subtract in the adjusted e2e and TTFT distributions.
    pub fn set_latency_adjustment(&self, adjustment: Duration) {
        self.lock().latency_adjustment = Some(adjustment);
    }

    pub fn submit(&self, record: &RequestRecord) {
        let mut detected = None;
        {
            let mut state = self.lock();
            state.total += 1;
            state.throttled_attempts += u64::from(record.throttled_attempts);
            state.retries += u64::from(record.retries);

            match &record.outcome {
                Outcome::Success => {
                    state.successes += 1;
                    state.context_tokens += u64::from(record.context_tokens);
                    state.generated_tokens += u64::from(record.generated_tokens);
                    if let Some(latency) = record.latency {
                        state.e2e.push(latency.as_secs_f64());
                    }
                    if let Some(ttft) = record.ttft {
                        state.ttft.push(ttft.as_secs_f64());
                    }
                    if let Some(tbt) = record.time_between_tokens() {
                        state.tbt.push(tbt.as_secs_f64());
                    }
                }
                Outcome::Failure { error, .. } => {
                    *state.failures_by_kind.entry(*error).or_default() += 1;
                }
            }

            if let Some(utilization) = record.utilization {
                state.utilization.push(utilization);
            }
            if state.model.is_none() && record.model.is_some() {
                state.model = record.model.clone();
                detected = record.model.as_deref();
            }
        }

        if let Some(model) = detected {
            info!("Model detected: {model}");
        }

        #[cfg(feature = "metrics")]
        record_metrics(record);
    }

    /// Total records submitted so far.
    pub fn count(&self) -> u64 {
        self.lock().total
    }

    /// Provisional statistics for a run that has been going for `elapsed`.
    pub fn snapshot(&self, elapsed: Duration) -> RunSummary {
        self.summarize(elapsed, false, false)
    }

    /// Final statistics. The aggregator stays usable, but the run is over by convention.
    pub fn finalize(&self, elapsed: Duration, early_terminated: bool) -> RunSummary {
        self.summarize(elapsed, true, early_terminated)
    }

    fn summarize(&self, elapsed: Duration, is_final: bool, early_terminated: bool) -> RunSummary {
        let state = self.lock();
        let failures: u64 = state.failures_by_kind.values().sum();
        let secs = elapsed.as_secs_f64();
        let per_sec = |v: u64| if secs > 0. { v as f64 / secs } else { 0. };
        let e2e = state.e2e.distribution();
        let ttft = state.ttft.distribution();
        let adjusted = |dist: Option<Distribution>| {
            Some(dist?.shifted(state.latency_adjustment?.as_secs_f64()))
        };

        RunSummary {
            run_id: self.run_id,
            is_final,
            early_terminated,
            run_seconds: elapsed,
            total_requests: state.total,
            successes: state.successes,
            failures,
            failures_by_kind: state.failures_by_kind.clone(),
            throttled_attempts: state.throttled_attempts,
            retries: state.retries,
            success_rate: if state.total > 0 {
                state.successes as f64 / state.total as f64
            } else {
                0.
            },
            context_tokens: state.context_tokens,
            generated_tokens: state.generated_tokens,
            throughput: Throughput {
                requests_per_sec: per_sec(state.total),
                requests_per_min: per_sec(state.total) * 60.,
                context_tokens_per_sec: per_sec(state.context_tokens),
                generated_tokens_per_sec: per_sec(state.generated_tokens),
            },
            e2e_adjusted: adjusted(e2e),
            ttft_adjusted: adjusted(ttft),
            e2e,
            ttft,
            tbt: state.tbt.distribution(),
            utilization: state.utilization.distribution(),
            latency_adjustment: state.latency_adjustment,
            model: state.model.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(feature = "metrics")]
fn record_metrics(record: &RequestRecord) {
    let outcome = match record.outcome.error() {
        None => "success",
        Some(kind) => kind.as_str(),
    };
    metrics::counter!("loadbench_requests_total", "outcome" => outcome).increment(1);

    if record.throttled_attempts > 0 {
        metrics::counter!("loadbench_throttled_total")
            .increment(u64::from(record.throttled_attempts));
    }

    if record.outcome.is_success() {
        metrics::counter!("loadbench_generated_tokens_total")
            .increment(u64::from(record.generated_tokens));
        metrics::counter!("loadbench_context_tokens_total")
            .increment(u64::from(record.context_tokens));
        if let Some(latency) = record.latency {
            metrics::histogram!("loadbench_e2e_seconds").record(latency.as_secs_f64());
        }
        if let Some(ttft) = record.ttft {
            metrics::histogram!("loadbench_ttft_seconds").record(ttft.as_secs_f64());
        }
    }

    if let Some(utilization) = record.utilization {
        metrics::gauge!("loadbench_deployment_utilization").set(utilization);
    }
}
