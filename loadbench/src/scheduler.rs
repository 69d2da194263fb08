//! Dispatch pacing.
mod stop;

pub use stop::StopSignal;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use loadbench_core::MIN_RATE;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// A single permission to dispatch one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based position in the run.
    pub seq: u64,
    /// Time since the scheduler started.
    pub elapsed: Duration,
}

/// Emits dispatch ticks at a target rate for a bounded duration.
///
/// Pacing is a GCRA token bucket, so a tick that is picked up late does not push every later
/// tick back, and a stall longer than one period is forgiven instead of replayed: at most
/// `burst` ticks fire back-to-back after it. Over a full run the tick count lies within
/// `[rate * duration - 1, rate * duration + burst]`, minus whatever the consumer stalled.
pub struct RateScheduler {
    limiter: DefaultDirectRateLimiter,
    start: Instant,
    duration: Duration,
    max_ticks: Option<u64>,
    emitted: u64,
    stop: StopSignal,
    finished: bool,
}

impl RateScheduler {
    /// `rate` is in ticks per second and must be positive and finite.
    pub fn new(rate: f64, duration: Duration, burst: NonZeroU32, stop: StopSignal) -> Self {
        Self {
            limiter: rate_limiter(rate, burst),
            start: Instant::now(),
            duration,
            max_ticks: None,
            emitted: 0,
            stop,
            finished: false,
        }
    }

    /// Stop after `max_ticks` ticks even if the duration has not elapsed.
    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }

    /// Wait for the next tick. Returns `None` once the duration has elapsed, the tick cap was
    /// reached or the stop signal fired, and on every call after that.
    pub async fn next_tick(&mut self) -> Option<Tick> {
        if self.finished {
            return None;
        }

        let deadline = self.start + self.duration;
        if self.exhausted(deadline) {
            return self.finish();
        }

        let ready = tokio::select! {
            biased;
            _ = self.stop.stopped() => false,
            _ = tokio::time::sleep_until(deadline) => false,
            _ = self.limiter.until_ready() => true,
        };

        // NOTE: The limiter may resolve in the same instant the run ends; the deadline wins.
        if !ready || self.exhausted(deadline) {
            return self.finish();
        }

        let tick = Tick {
            seq: self.emitted,
            elapsed: self.start.elapsed(),
        };
        self.emitted += 1;
        trace!("Tick {} at {:?}", tick.seq, tick.elapsed);
        Some(tick)
    }

    /// Resolves once the stop signal fires or the run duration has elapsed.
    pub async fn interrupted(&self) {
        let deadline = async {
            match self.start.checked_add(self.duration) {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.stop.stopped() => {}
            _ = deadline => {}
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn exhausted(&self, deadline: Instant) -> bool {
        self.stop.is_stopped()
            || Instant::now() >= deadline
            || self.max_ticks.is_some_and(|max| self.emitted >= max)
    }

    fn finish(&mut self) -> Option<Tick> {
        if !self.finished {
            self.finished = true;
            debug!(
                "Scheduler finished after {} ticks in {}",
                self.emitted,
                humantime::format_duration(self.start.elapsed())
            );
        }
        None
    }
}

fn rate_limiter(rate: f64, burst: NonZeroU32) -> DefaultDirectRateLimiter {
    let longest = Duration::from_secs_f64(1. / MIN_RATE);
    let period = Duration::try_from_secs_f64(1. / rate)
        .unwrap_or(longest)
        .clamp(Duration::from_nanos(1), longest);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(burst);
    RateLimiter::direct(quota)
}
