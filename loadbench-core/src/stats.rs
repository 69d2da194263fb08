use crate::data::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Distribution summary of one latency-like series. Time series are in seconds, utilization in
/// percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    /// `false` once the series outgrew exact retention and quantiles come from the t-digest.
    pub exact: bool,
}

impl Distribution {
    /// The same distribution with `offset` subtracted from every statistic, floored at zero.
    pub fn shifted(&self, offset: f64) -> Distribution {
        let shift = |v: f64| (v - offset).max(0.);
        Distribution {
            avg: shift(self.avg),
            min: shift(self.min),
            max: shift(self.max),
            p50: shift(self.p50),
            p90: shift(self.p90),
            p95: shift(self.p95),
            p99: shift(self.p99),
            ..*self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Throughput {
    pub requests_per_sec: f64,
    pub requests_per_min: f64,
    pub context_tokens_per_sec: f64,
    pub generated_tokens_per_sec: f64,
}

/// Run-level statistics over the terminal records seen so far.
///
/// Periodic snapshots and the final summary share this shape; the final summary has `final`
/// set and covers exactly the emitted record stream.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub early_terminated: bool,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub run_seconds: Duration,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub failures_by_kind: BTreeMap<ErrorKind, u64>,
    pub throttled_attempts: u64,
    pub retries: u64,
    pub success_rate: f64,
    pub context_tokens: u64,
    pub generated_tokens: u64,
    pub throughput: Throughput,
    pub e2e: Option<Distribution>,
    pub ttft: Option<Distribution>,
    pub tbt: Option<Distribution>,
    pub utilization: Option<Distribution>,
    /// Average pre-run ping; subtracted from `e2e` and `ttft` in the adjusted series.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub latency_adjustment: Option<Duration>,
    pub e2e_adjusted: Option<Distribution>,
    pub ttft_adjusted: Option<Distribution>,
    /// First model name the endpoint reported.
    pub model: Option<String>,
}

impl RunSummary {
    pub fn failures_of(&self, kind: ErrorKind) -> u64 {
        self.failures_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Whole milliseconds keep humantime from printing nanosecond noise.
        let elapsed = Duration::from_millis(self.run_seconds.as_millis() as u64);
        write!(
            f,
            "elapsed={} requests={} failures={} throttled={} rpm={:.1} tps_gen={:.1}",
            humantime::format_duration(elapsed),
            self.total_requests,
            self.failures,
            self.throttled_attempts,
            self.throughput.requests_per_min,
            self.throughput.generated_tokens_per_sec,
        )?;
        write_distribution(f, "e2e", self.e2e.as_ref())?;
        write_distribution(f, "ttft", self.ttft.as_ref())?;
        write_distribution(f, "tbt", self.tbt.as_ref())?;
        match &self.utilization {
            Some(util) => write!(f, " util_avg={:.1}% util_p95={:.1}%", util.avg, util.p95)?,
            None => write!(f, " util_avg=n/a")?,
        }
        if let Some(adjustment) = self.latency_adjustment {
            write!(f, " ping={:.1}ms", adjustment.as_secs_f64() * 1000.)?;
        }
        if let Some(model) = &self.model {
            write!(f, " model={model}")?;
        }
        Ok(())
    }
}

fn write_distribution(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    dist: Option<&Distribution>,
) -> fmt::Result {
    match dist {
        Some(dist) => write!(
            f,
            " {name}_avg={:.3}s {name}_p95={:.3}s",
            dist.avg, dist.p95
        ),
        None => write!(f, " {name}_avg=n/a"),
    }
}
