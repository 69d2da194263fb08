//! A stand-in for an Azure OpenAI / OpenAI chat-completions endpoint.
//!
//! Streams synthetic tokens with configurable pacing, reports deployment utilization, throttles
//! with `429` + `retry-after-ms` above a request rate, and injects server errors on demand.
use axum::{
    debug_handler,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
#[allow(unused)]
use metrics::{counter, gauge, histogram};
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::debug;

const UTILIZATION_HEADER: &str = "azure-openai-deployment-utilization";
const RETRY_AFTER_MS_HEADER: &str = "retry-after-ms";
const DEFAULT_MAX_TOKENS: u32 = 16;

#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Delay before the first content chunk.
    pub ttft: Duration,
    /// Delay between content chunks; one chunk per token.
    pub token_interval: Duration,
    /// Standard deviation of the noise added to `ttft`, in milliseconds.
    pub jitter_ms: f64,
    /// Requests per second above which requests are throttled.
    pub max_rps: Option<NonZeroU32>,
    pub retry_after: Duration,
    /// Answer this many requests with `503` before serving normally.
    pub fail_first: u64,
    /// Probability of answering `500`.
    pub failure_rate: f64,
    /// Reported deployment utilization, in percent.
    pub utilization: f64,
    /// Model name put on every response.
    pub model: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            ttft: Duration::from_millis(20),
            token_interval: Duration::from_millis(1),
            jitter_ms: 0.,
            max_rps: None,
            retry_after: Duration::from_millis(100),
            fail_first: 0,
            failure_rate: 0.,
            utilization: 35.,
            model: "gpt-4o-2024-08-06".to_string(),
        }
    }
}

/// Request counters, shared with whoever started the server.
#[derive(Debug, Default)]
pub struct MockStats {
    pub requests: AtomicU64,
    pub throttled: AtomicU64,
    pub failed: AtomicU64,
    pub completed: AtomicU64,
}

impl MockStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

struct AppState {
    config: MockConfig,
    limiter: Option<DefaultDirectRateLimiter>,
    stats: Arc<MockStats>,
}

pub fn router(config: MockConfig, stats: Arc<MockStats>) -> Router {
    let limiter = config
        .max_rps
        .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
    let state = Arc::new(AppState {
        config,
        limiter,
        stats,
    });

    Router::new()
        .route(
            "/openai/deployments/:deployment/chat/completions",
            post(azure_completions),
        )
        .route("/v1/chat/completions", post(openai_completions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(listener: TcpListener, config: MockConfig) -> io::Result<()> {
    axum::serve(listener, router(config, Arc::default())).await
}

/// A server on an ephemeral local port, stopped when dropped.
pub struct MockServer {
    pub addr: SocketAddr,
    pub stats: Arc<MockStats>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(config: MockConfig) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let stats = Arc::new(MockStats::default());
        let app = router(config, stats.clone());

        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!("Mock service stopped: {err}");
            }
        });

        Ok(Self { addr, stats, task })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    messages: Vec<Message>,
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    n: Option<u32>,
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Deserialize)]
struct StreamOptions {
    #[serde(default)]
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[allow(unused)]
    role: String,
    content: String,
}

#[debug_handler]
async fn azure_completions(
    State(state): State<Arc<AppState>>,
    Path(deployment): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<ChatRequest>,
) -> Response {
    if !query.contains_key("api-version") {
        return error(
            StatusCode::NOT_FOUND,
            "Missing api-version query parameter",
            HeaderMap::new(),
        );
    }
    debug!("Completion for deployment {deployment}");
    complete(&state, body).await
}

#[debug_handler]
async fn openai_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequest>,
) -> Response {
    complete(&state, body).await
}

async fn complete(state: &AppState, body: ChatRequest) -> Response {
    let config = &state.config;
    let seq = state.stats.requests.fetch_add(1, Ordering::SeqCst);
    counter!("mock_service_requests_total").increment(1);

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("{:.1}%", config.utilization)) {
        headers.insert(UTILIZATION_HEADER, value);
    }

    if seq < config.fail_first {
        state.stats.failed.fetch_add(1, Ordering::SeqCst);
        return error(StatusCode::SERVICE_UNAVAILABLE, "Injected outage", headers);
    }

    if config.failure_rate > 0. && rand::random::<f64>() < config.failure_rate {
        state.stats.failed.fetch_add(1, Ordering::SeqCst);
        return error(StatusCode::INTERNAL_SERVER_ERROR, "Injected failure", headers);
    }

    if let Some(limiter) = &state.limiter {
        if limiter.check().is_err() {
            state.stats.throttled.fetch_add(1, Ordering::SeqCst);
            counter!("mock_service_throttled_total").increment(1);
            if let Ok(value) = HeaderValue::from_str(&config.retry_after.as_millis().to_string()) {
                headers.insert(RETRY_AFTER_MS_HEADER, value);
            }
            return error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded", headers);
        }
    }

    let prompt_tokens = prompt_tokens(&body.messages);
    let tokens = body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS).max(1);
    let completion_tokens = tokens * body.n.unwrap_or(1).max(1);
    let ttft = jittered(config.ttft, config.jitter_ms);
    let interval = config.token_interval;
    let model = config.model.clone();
    state.stats.completed.fetch_add(1, Ordering::SeqCst);

    let usage = json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens + completion_tokens,
    });

    if !body.stream {
        tokio::time::sleep(ttft + interval * tokens).await;
        let text = vec!["tok"; tokens as usize].join(" ");
        let body = json!({
            "object": "chat.completion",
            "model": model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}, "finish_reason": "length"}],
            "usage": usage,
        });
        return (headers, Json(body)).into_response();
    }

    // Usage goes out only on request, as `stream_options.include_usage` does upstream.
    let include_usage = body.stream_options.is_some_and(|o| o.include_usage);
    let done = tokens + 1 + u32::from(include_usage);

    let events = futures_util::stream::unfold(0u32, move |i| {
        let usage = usage.clone();
        let model = model.clone();
        async move {
            let chunk = |choices: serde_json::Value| {
                json!({"object": "chat.completion.chunk", "model": model, "choices": choices})
            };
            let data = match i {
                0 => chunk(json!([{"index": 0, "delta": {"role": "assistant"}}])).to_string(),
                i if i <= tokens => {
                    tokio::time::sleep(if i == 1 { ttft } else { interval }).await;
                    chunk(json!([{"index": 0, "delta": {"content": "tok "}}])).to_string()
                }
                i if include_usage && i == tokens + 1 => {
                    let mut last = chunk(json!([]));
                    last["usage"] = usage;
                    last.to_string()
                }
                i if i == done => "[DONE]".to_string(),
                _ => return None,
            };
            Some((Ok::<_, Infallible>(Event::default().data(data)), i + 1))
        }
    });

    (headers, Sse::new(events)).into_response()
}

fn error(status: StatusCode, message: &str, headers: HeaderMap) -> Response {
    let body = json!({"error": {"code": status.as_u16().to_string(), "message": message}});
    (status, headers, Json(body)).into_response()
}

/// Same framing as the client's estimate: one token per word, 3 per message, 3 for the reply.
fn prompt_tokens(messages: &[Message]) -> u32 {
    let words: usize = messages
        .iter()
        .map(|m| m.content.split_whitespace().count())
        .sum();
    (words + 3 * messages.len() + 3) as u32
}

fn jittered(base: Duration, jitter_ms: f64) -> Duration {
    if jitter_ms <= 0. {
        return base;
    }
    let Ok(normal) = Normal::new(0., jitter_ms) else {
        return base;
    };
    let ms = base.as_secs_f64() * 1000. + normal.sample(&mut rand::thread_rng());
    Duration::from_secs_f64(ms.max(0.) / 1000.)
}
