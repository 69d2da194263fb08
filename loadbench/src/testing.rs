//! Scripted endpoint used by the engine's unit tests.
use crate::client::{
    ChatMessage, CompletionRequest, CompletionResponse, EndpointClient, StreamOptions,
    TransportError,
};
use loadbench_core::ErrorKind;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Step {
    Ok,
    Status(u16),
    Error(ErrorKind),
    /// Never answers.
    Hang,
}

/// Answers calls from a script, then with a fallback step.
pub(crate) struct ScriptedClient {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    latency: Duration,
    jitter: Option<Mutex<(SmallRng, Normal<f64>)>>,
    prompt_tokens: Option<u32>,
    model: Option<String>,
    /// Ping round trip; `None` makes every ping fail.
    ping: Option<Duration>,
    pings: AtomicU64,
    calls: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(latency: Duration) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Ok,
            latency,
            jitter: None,
            prompt_tokens: None,
            model: None,
            ping: Some(Duration::from_millis(1)),
            pings: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        *self.script.lock().unwrap() = steps.into_iter().collect();
        self
    }

    pub fn fallback(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    /// Add normally distributed noise (standard deviation in milliseconds) to the latency.
    pub fn jitter(mut self, std_ms: f64) -> Self {
        let normal = Normal::new(0., std_ms).unwrap();
        self.jitter = Some(Mutex::new((SmallRng::seed_from_u64(0), normal)));
        self
    }

    pub fn prompt_tokens(mut self, tokens: Option<u32>) -> Self {
        self.prompt_tokens = tokens;
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn ping(mut self, ping: Option<Duration>) -> Self {
        self.ping = ping;
        self
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        match &self.jitter {
            Some(jitter) => {
                let (rng, normal) = &mut *jitter.lock().unwrap();
                let ms = self.latency.as_secs_f64() * 1000. + normal.sample(rng);
                Duration::from_secs_f64(ms.max(0.) / 1000.)
            }
            None => self.latency,
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EndpointClient for ScriptedClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let latency = self.latency();
        tokio::time::sleep(latency).await;

        match step {
            Step::Ok => Ok(CompletionResponse {
                status: 200,
                latency,
                ttft: Some(latency / 2),
                generated_tokens: request.max_tokens,
                prompt_tokens: self.prompt_tokens,
                utilization: Some(50.),
                model: self.model.clone(),
                ..Default::default()
            }),
            Step::Status(status) => Ok(CompletionResponse {
                status,
                latency,
                body: Some(format!("{{\"error\":\"scripted {status}\"}}")),
                ..Default::default()
            }),
            Step::Error(kind) => Err(TransportError::new(kind, "scripted failure")),
            Step::Hang => std::future::pending().await,
        }
    }

    async fn ping(&self) -> Result<Duration, TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let ping = self
            .ping
            .ok_or_else(|| TransportError::new(ErrorKind::Connection, "scripted ping failure"))?;
        tokio::time::sleep(ping).await;
        Ok(ping)
    }
}

pub(crate) fn request(context_tokens: u32, max_tokens: u32) -> CompletionRequest {
    CompletionRequest {
        messages: vec![ChatMessage::user("hello there".to_string())],
        max_tokens,
        stream: true,
        temperature: None,
        top_p: None,
        frequency_penalty: None,
        presence_penalty: None,
        completions: None,
        stream_options: Some(StreamOptions {
            include_usage: true,
        }),
        context_tokens,
    }
}
