use crate::constants::*;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Any of these aborts a run before the first request is sent.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigValidationError {
    #[error("rate must be a finite number of requests per second of at least {min}, got {0}", min = MIN_RATE)]
    InvalidRate(f64),

    #[error("duration must be greater than 0")]
    ZeroDuration,

    #[error("concurrency must be greater than 0")]
    ZeroConcurrency,

    #[error("token bucket burst must be greater than 0")]
    ZeroBurst,

    #[error("request cap must be greater than 0 when set")]
    ZeroRequestCap,

    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("deployment name must not be empty")]
    EmptyDeployment,

    #[error("shape profile `{profile}` requires `{field}` to be set")]
    MissingShapeField {
        profile: ShapeProfile,
        field: &'static str,
    },

    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("completions must be greater than 0")]
    ZeroCompletions,

    #[error("retry base delay ({base:?}) must not exceed the max delay ({max:?})")]
    InvalidRetryDelays { base: Duration, max: Duration },

    #[error("unknown shape profile `{0}` (expected balanced, context, generation or custom)")]
    UnknownShapeProfile(String),

    #[error("unknown output format `{0}` (expected jsonl or human)")]
    UnknownOutputFormat(String),
}

/// Token-length preset for the synthetic requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeProfile {
    Balanced,
    Context,
    Generation,
    Custom,
}

impl ShapeProfile {
    /// `(context_tokens, max_tokens)` for the preset profiles.
    pub fn preset(&self) -> Option<(u32, u32)> {
        match self {
            ShapeProfile::Balanced => Some((500, 500)),
            ShapeProfile::Context => Some((2000, 200)),
            ShapeProfile::Generation => Some((500, 1000)),
            ShapeProfile::Custom => None,
        }
    }
}

impl fmt::Display for ShapeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShapeProfile::Balanced => "balanced",
            ShapeProfile::Context => "context",
            ShapeProfile::Generation => "generation",
            ShapeProfile::Custom => "custom",
        };
        f.write_str(name)
    }
}

impl FromStr for ShapeProfile {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "balanced" => Ok(ShapeProfile::Balanced),
            "context" => Ok(ShapeProfile::Context),
            "generation" => Ok(ShapeProfile::Generation),
            "custom" => Ok(ShapeProfile::Custom),
            _ => Err(ConfigValidationError::UnknownShapeProfile(s.to_string())),
        }
    }
}

/// Resolved token shape of every request in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeParams {
    pub context_tokens: u32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jsonl,
    Human,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jsonl => f.write_str("jsonl"),
            OutputFormat::Human => f.write_str("human"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" => Ok(OutputFormat::Jsonl),
            "human" => Ok(OutputFormat::Human),
            _ => Err(ConfigValidationError::UnknownOutputFormat(s.to_string())),
        }
    }
}

/// Optional sampling parameters forwarded verbatim in every request body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub completions: Option<u32>,
}

/// Everything a run needs. Build it with the chained setters, then [`RunConfig::validate`]
/// before handing it to the engine; it is not modified afterwards.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    /// Target requests per second.
    pub rate: f64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
    pub max_requests: Option<u64>,
    pub shape_profile: ShapeProfile,
    pub context_tokens: Option<u32>,
    pub max_tokens: Option<u32>,
    pub prevent_server_caching: bool,
    pub max_retries: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub retry_base_delay: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub retry_max_delay: Duration,
    pub concurrency: usize,
    pub burst: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub drain_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub stats_interval: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub request_timeout: Duration,
    pub output_format: OutputFormat,
    pub sampling: SamplingParams,
    /// Pings averaged into the latency adjustment before the run starts.
    #[serde(default = "default_ping_samples")]
    pub ping_samples: u32,
}

fn default_ping_samples() -> u32 {
    DEFAULT_PING_SAMPLES
}

impl RunConfig {
    pub fn new(endpoint: &str, deployment: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            deployment: deployment.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            rate: 1.,
            duration: Duration::from_secs(60),
            max_requests: None,
            shape_profile: ShapeProfile::Balanced,
            context_tokens: None,
            max_tokens: None,
            prevent_server_caching: true,
            max_retries: 0,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            concurrency: DEFAULT_CONCURRENCY,
            burst: DEFAULT_BURST,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            output_format: OutputFormat::Jsonl,
            sampling: SamplingParams::default(),
            ping_samples: DEFAULT_PING_SAMPLES,
        }
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    pub fn shape_profile(mut self, profile: ShapeProfile) -> Self {
        self.shape_profile = profile;
        self
    }

    pub fn context_tokens(mut self, tokens: u32) -> Self {
        self.context_tokens = Some(tokens);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn prevent_server_caching(mut self, prevent: bool) -> Self {
        self.prevent_server_caching = prevent;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn api_version(mut self, version: &str) -> Self {
        self.api_version = version.to_string();
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn ping_samples(mut self, samples: u32) -> Self {
        self.ping_samples = samples;
        self
    }

    /// Resolve the profile into concrete token counts. Explicit token counts win over the
    /// preset values; `custom` requires both.
    pub fn shape_params(&self) -> Result<ShapeParams, ConfigValidationError> {
        let (context_tokens, max_tokens) = match self.shape_profile.preset() {
            Some((context, max)) => (
                self.context_tokens.unwrap_or(context),
                self.max_tokens.unwrap_or(max),
            ),
            None => (
                self.context_tokens
                    .ok_or(ConfigValidationError::MissingShapeField {
                        profile: self.shape_profile,
                        field: "context_tokens",
                    })?,
                self.max_tokens
                    .ok_or(ConfigValidationError::MissingShapeField {
                        profile: self.shape_profile,
                        field: "max_tokens",
                    })?,
            ),
        };

        Ok(ShapeParams {
            context_tokens,
            max_tokens,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.rate.is_finite() || self.rate < MIN_RATE {
            return Err(ConfigValidationError::InvalidRate(self.rate));
        }

        if self.duration.is_zero() {
            return Err(ConfigValidationError::ZeroDuration);
        }

        if self.concurrency == 0 {
            return Err(ConfigValidationError::ZeroConcurrency);
        }

        if self.burst == 0 {
            return Err(ConfigValidationError::ZeroBurst);
        }

        if self.max_requests == Some(0) {
            return Err(ConfigValidationError::ZeroRequestCap);
        }

        if self.deployment.trim().is_empty() {
            return Err(ConfigValidationError::EmptyDeployment);
        }

        match url::Url::parse(&self.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigValidationError::InvalidEndpoint {
                    endpoint: self.endpoint.clone(),
                    reason: format!("unsupported scheme `{}`", url.scheme()),
                })
            }
            Err(err) => {
                return Err(ConfigValidationError::InvalidEndpoint {
                    endpoint: self.endpoint.clone(),
                    reason: err.to_string(),
                })
            }
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigValidationError::InvalidRetryDelays {
                base: self.retry_base_delay,
                max: self.retry_max_delay,
            });
        }

        self.shape_params()?;
        self.sampling.validate()
    }
}

impl SamplingParams {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        check_range("temperature", self.temperature, 0., 2.)?;
        check_range("top_p", self.top_p, 0., 1.)?;
        check_range("frequency_penalty", self.frequency_penalty, -2., 2.)?;
        check_range("presence_penalty", self.presence_penalty, -2., 2.)?;

        if self.completions == Some(0) {
            return Err(ConfigValidationError::ZeroCompletions);
        }

        Ok(())
    }
}

fn check_range(
    name: &'static str,
    value: Option<f64>,
    min: f64,
    max: f64,
) -> Result<(), ConfigValidationError> {
    match value {
        Some(value) if !(min..=max).contains(&value) => Err(ConfigValidationError::OutOfRange {
            name,
            value,
            min,
            max,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig::new("https://example.openai.azure.com", "gpt-4o")
            .rate(10.)
            .duration(Duration::from_secs(5))
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(config().validate(), Ok(()));
    }

    #[test]
    fn test_rate_must_be_positive() {
        assert_eq!(
            config().rate(0.).validate(),
            Err(ConfigValidationError::InvalidRate(0.))
        );
        assert!(config().rate(-3.).validate().is_err());
        assert!(config().rate(f64::NAN).validate().is_err());
        assert!(config().rate(f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_rate_has_a_floor() {
        assert_eq!(
            config().rate(1e-20).validate(),
            Err(ConfigValidationError::InvalidRate(1e-20))
        );
        assert_eq!(config().rate(MIN_RATE).validate(), Ok(()));
    }

    #[test]
    fn test_duration_must_be_positive() {
        assert_eq!(
            config().duration(Duration::ZERO).validate(),
            Err(ConfigValidationError::ZeroDuration)
        );
    }

    #[test]
    fn test_endpoint_must_parse() {
        let err = RunConfig::new("not a url", "gpt-4o").validate().unwrap_err();
        assert!(matches!(err, ConfigValidationError::InvalidEndpoint { .. }));

        let err = RunConfig::new("ftp://example.com", "gpt-4o")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigValidationError::InvalidEndpoint { .. }));
    }

    #[test]
    fn test_deployment_must_be_set() {
        let err = RunConfig::new("http://localhost:3002", "  ")
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigValidationError::EmptyDeployment);
    }

    #[test]
    fn test_custom_profile_requires_both_token_counts() {
        let cfg = config().shape_profile(ShapeProfile::Custom).context_tokens(100);
        assert_eq!(
            cfg.validate(),
            Err(ConfigValidationError::MissingShapeField {
                profile: ShapeProfile::Custom,
                field: "max_tokens",
            })
        );

        let cfg = cfg.max_tokens(50);
        assert_eq!(
            cfg.shape_params(),
            Ok(ShapeParams {
                context_tokens: 100,
                max_tokens: 50
            })
        );
    }

    #[test]
    fn test_preset_profiles_accept_overrides() {
        let params = config()
            .shape_profile(ShapeProfile::Context)
            .max_tokens(64)
            .shape_params()
            .unwrap();
        assert_eq!(params.context_tokens, 2000);
        assert_eq!(params.max_tokens, 64);
    }

    #[test]
    fn test_sampling_ranges() {
        let cfg = config().sampling(SamplingParams {
            temperature: Some(2.5),
            ..Default::default()
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigValidationError::OutOfRange {
                name: "temperature",
                ..
            })
        ));

        let cfg = config().sampling(SamplingParams {
            completions: Some(0),
            ..Default::default()
        });
        assert_eq!(cfg.validate(), Err(ConfigValidationError::ZeroCompletions));
    }

    #[test]
    fn test_retry_delays_ordered() {
        let cfg = config().retry_delays(Duration::from_secs(2), Duration::from_secs(1));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigValidationError::InvalidRetryDelays { .. })
        ));
    }

    #[test]
    fn test_parse_profile_and_format() {
        assert_eq!("Generation".parse(), Ok(ShapeProfile::Generation));
        assert!("huge".parse::<ShapeProfile>().is_err());
        assert_eq!("human".parse(), Ok(OutputFormat::Human));
        assert!("csv".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_config_serializes_durations_as_seconds() {
        let value = serde_json::to_value(config()).unwrap();
        assert_eq!(value["duration"], 5.0);
        assert_eq!(value["shape_profile"], "balanced");
        assert_eq!(value["output_format"], "jsonl");
    }
}
