use clap::{ArgAction, Parser};
use loadbench_core::{
    OutputFormat, RunConfig, SamplingParams, ShapeProfile, DEFAULT_API_VERSION, DEFAULT_BURST,
    DEFAULT_CONCURRENCY, DEFAULT_PING_SAMPLES,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Load test an Azure OpenAI or OpenAI-compatible chat-completions endpoint.
#[derive(Parser, Debug, Clone)]
#[command(name = "loadbench", version)]
pub struct Args {
    /// Base URL of the endpoint, e.g. https://my-resource.openai.azure.com
    pub endpoint: String,

    /// Deployment (Azure) or model (OpenAI) to call.
    #[arg(long)]
    pub deployment: String,

    /// Target requests per second.
    #[arg(long, default_value_t = 1.)]
    pub rate: f64,

    /// Token shape of each request: balanced, context, generation or custom.
    #[arg(long, default_value_t = ShapeProfile::Balanced)]
    pub shape_profile: ShapeProfile,

    /// Prompt size in tokens. Required for `custom`, overrides the preset otherwise.
    #[arg(long)]
    pub context_tokens: Option<u32>,

    /// Maximum tokens to generate. Required for `custom`, overrides the preset otherwise.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Retries per request for throttling, timeouts and server errors.
    #[arg(long, default_value_t = 0)]
    pub retry: u32,

    /// How long to issue requests, in seconds or as `90s`, `5m`, ...
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    pub duration: Duration,

    /// Format of the records and statistics written to stdout.
    #[arg(long, default_value_t = OutputFormat::Jsonl)]
    pub output_format: OutputFormat,

    /// Directory to save the log file and a JSON lines copy of the output in.
    #[arg(long)]
    pub log_save_dir: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_API_VERSION)]
    pub api_version: String,

    /// Environment variable holding the API key.
    #[arg(long, default_value = "OPENAI_API_KEY")]
    pub api_key_env: String,

    /// Maximum number of requests in flight.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub clients: usize,

    /// Stop after this many requests even if the duration has not elapsed.
    #[arg(long)]
    pub requests: Option<u64>,

    /// Requests that may be issued back-to-back after a stall.
    #[arg(long, default_value_t = DEFAULT_BURST)]
    pub burst: u32,

    /// How long to wait for in-flight requests once dispatching stops.
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub drain_timeout: Duration,

    /// Interval between statistics lines; 0 disables them.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub stats_interval: Duration,

    #[arg(long, value_parser = parse_duration, default_value = "120s")]
    pub request_timeout: Duration,

    /// Prefix every prompt with random words so the server cannot cache it.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub prevent_server_caching: bool,

    /// Completions per request (`n`).
    #[arg(long)]
    pub completions: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    pub frequency_penalty: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    pub presence_penalty: Option<f64>,

    /// Pings averaged into the latency adjustment before the run; 0 skips them.
    #[arg(long, default_value_t = DEFAULT_PING_SAMPLES)]
    pub ping_samples: u32,

    /// Serve Prometheus metrics on this address while the run is going.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Args {
    /// The run configuration these flags describe. Not validated yet.
    pub fn to_config(&self) -> RunConfig {
        let mut config = RunConfig::new(&self.endpoint, &self.deployment)
            .api_version(&self.api_version)
            .rate(self.rate)
            .duration(self.duration)
            .shape_profile(self.shape_profile)
            .max_retries(self.retry)
            .concurrency(self.clients)
            .burst(self.burst)
            .drain_timeout(self.drain_timeout)
            .stats_interval(self.stats_interval)
            .request_timeout(self.request_timeout)
            .prevent_server_caching(self.prevent_server_caching)
            .output_format(self.output_format)
            .ping_samples(self.ping_samples)
            .sampling(SamplingParams {
                temperature: self.temperature,
                top_p: self.top_p,
                frequency_penalty: self.frequency_penalty,
                presence_penalty: self.presence_penalty,
                completions: self.completions,
            });

        if let Some(tokens) = self.context_tokens {
            config = config.context_tokens(tokens);
        }
        if let Some(tokens) = self.max_tokens {
            config = config.max_tokens(tokens);
        }
        if let Some(requests) = self.requests {
            config = config.max_requests(requests);
        }
        config
    }
}

/// Plain numbers are seconds; anything else goes through humantime.
fn parse_duration(s: &str) -> Result<Duration, String> {
    match s.trim().parse::<f64>() {
        Ok(secs) => Duration::try_from_secs_f64(secs).map_err(|err| format!("`{s}`: {err}")),
        Err(_) => humantime::parse_duration(s).map_err(|err| err.to_string()),
    }
}
