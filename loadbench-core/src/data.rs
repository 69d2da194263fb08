use crate::config::ShapeParams;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

/// Logical request id. Retries of the same request keep their id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Why an attempt (and eventually a request) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP 429.
    Throttled,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 408 or a client-side request timeout.
    Timeout,
    /// The connection could not be established or broke mid-response.
    Connection,
    /// Any other HTTP 4xx; the request itself is at fault.
    ClientError,
    /// The response could not be decoded.
    InvalidResponse,
    /// The request was still in flight when the drain timeout expired.
    DrainTimeout,
}

impl ErrorKind {
    /// Transient kinds are worth retrying; the rest are terminal on first sight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled | ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::Connection
        )
    }

    pub fn from_status(status: u16) -> Option<ErrorKind> {
        match status {
            200..=299 => None,
            429 => Some(ErrorKind::Throttled),
            408 => Some(ErrorKind::Timeout),
            500..=599 => Some(ErrorKind::ServerError),
            _ => Some(ErrorKind::ClientError),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Throttled => "throttled",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::ClientError => "client_error",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::DrainTimeout => "drain_timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure {
        error: ErrorKind,
        message: String,
        /// Set when the last error was transient but no retries were left.
        retries_exhausted: bool,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success => None,
            Outcome::Failure { error, .. } => Some(*error),
        }
    }
}

/// Terminal record of one logical request.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub shape: ShapeParams,
    #[serde(with = "time::serde::rfc3339")]
    pub dispatched_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub retries: u32,
    /// Attempts answered with HTTP 429, including the final one.
    pub throttled_attempts: u32,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub status_code: Option<u16>,
    /// End-to-end latency of the final attempt.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub latency: Option<Duration>,
    /// Time to first token of the final attempt.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub ttft: Option<Duration>,
    pub context_tokens: u32,
    pub generated_tokens: u32,
    /// Deployment utilization (percent) reported with the final response.
    pub utilization: Option<f64>,
    /// Model name reported by the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl RequestRecord {
    /// Mean time between generated tokens, if the request streamed more than one token.
    pub fn time_between_tokens(&self) -> Option<Duration> {
        let latency = self.latency?;
        let ttft = self.ttft?;
        if self.generated_tokens < 2 || latency < ttft {
            return None;
        }
        Some((latency - ttft) / (self.generated_tokens - 1))
    }
}
