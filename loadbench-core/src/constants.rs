use std::time::Duration;

/// Default number of requests allowed in flight at once (original `--clients`).
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Default token-bucket burst. A burst of one keeps the run close to `rate * duration` ticks.
pub const DEFAULT_BURST: u32 = 1;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on any single backoff delay, including server-provided hints.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// First GA Azure OpenAI API version that accepts `stream_options`.
pub const DEFAULT_API_VERSION: &str = "2024-10-21";

/// Lowest accepted request rate, one request every 1000 seconds.
pub const MIN_RATE: f64 = 0.001;

/// Tokens added by the chat framing of every message.
pub const TOKENS_PER_MESSAGE: u32 = 3;

/// Tokens used to prime every reply (`<|start|>assistant<|message|>`).
pub const REPLY_PRIMING_TOKENS: u32 = 3;

/// Words prepended to each prompt when server-side caching is prevented.
pub const CACHE_BUSTING_NONCE_WORDS: u32 = 4;

/// Relative deviation expected between the prompt-size estimate and a real BPE tokenizer.
pub const TOKEN_ESTIMATE_TOLERANCE: f64 = 0.05;

/// Latency series keep exact samples up to this many values before switching to a t-digest.
pub const EXACT_SAMPLE_LIMIT: usize = 1024;

/// Compression parameter of the latency t-digest.
pub const TDIGEST_COMPRESSION: f64 = 100.;

/// Stated quantile rank error of the t-digest for p50..p99.
pub const TDIGEST_RANK_ERROR: f64 = 0.01;

/// Pings sent before a run to estimate network latency; zero disables the adjustment.
pub const DEFAULT_PING_SAMPLES: u32 = 5;

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
