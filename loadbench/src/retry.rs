use crate::client::{CompletionResponse, TransportError};
use loadbench_core::{ErrorKind, RunConfig};
use std::time::Duration;

/// Classification of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Transient(ErrorKind),
    Permanent(ErrorKind),
}

impl AttemptOutcome {
    pub fn classify(result: &Result<CompletionResponse, TransportError>) -> Self {
        let kind = match result {
            Ok(response) => match ErrorKind::from_status(response.status) {
                None => return AttemptOutcome::Success,
                Some(kind) => kind,
            },
            Err(err) => err.kind,
        };

        if kind.is_transient() {
            AttemptOutcome::Transient(kind)
        } else {
            AttemptOutcome::Permanent(kind)
        }
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            AttemptOutcome::Success => None,
            AttemptOutcome::Transient(kind) | AttemptOutcome::Permanent(kind) => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// The attempt succeeded; keep it.
    Accept,
    /// Terminal failure. `exhausted` is set when a transient error ran out of retries.
    GiveUp { exhausted: bool },
}

/// Capped exponential backoff for transient errors.
///
/// The n-th retry (zero-based) waits `base_delay * 2^n`, capped at `max_delay`. A server hint
/// replaces the computed delay but is capped the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base_delay,
            config.retry_max_delay,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide what to do after an attempt, given how many retries were already spent.
    pub fn decide(
        &self,
        outcome: &AttemptOutcome,
        retries: u32,
        hint: Option<Duration>,
    ) -> RetryDecision {
        match outcome {
            AttemptOutcome::Success => RetryDecision::Accept,
            AttemptOutcome::Permanent(_) => RetryDecision::GiveUp { exhausted: false },
            AttemptOutcome::Transient(_) if retries >= self.max_retries => {
                RetryDecision::GiveUp { exhausted: true }
            }
            AttemptOutcome::Transient(_) => {
                let delay = hint.unwrap_or_else(|| self.backoff(retries));
                RetryDecision::Retry(delay.min(self.max_delay))
            }
        }
    }

    pub fn backoff(&self, retries: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retries))
            .min(self.max_delay)
    }
}
