//! Bounded-concurrency request dispatch.
mod in_flight;
mod timed;

use crate::client::{CompletionRequest, CompletionResponse, EndpointClient, TransportError};
use crate::retry::{AttemptOutcome, RetryDecision, RetryPolicy};
use async_channel::Sender;
use in_flight::{InFlight, Pending};
use loadbench_core::{ErrorKind, Outcome, RequestId, RequestRecord, ShapeParams};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use timed::Timed;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn, Instrument};

/// Longest slice of an error body kept in a failure message.
const ERROR_BODY_LIMIT: usize = 256;

/// Result of [`WorkerPool::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Requests still in flight when the drain started.
    pub pending: usize,
    /// Requests finalized as drain timeouts.
    pub timed_out: usize,
}

/// Issues requests concurrently, at most `concurrency` at a time.
///
/// Every dispatched request yields exactly one [`RequestRecord`] on the records channel, either
/// when its retry loop ends or when [`WorkerPool::drain`] gives up on it.
pub struct WorkerPool<C> {
    client: Arc<C>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    concurrency: usize,
    tasks: JoinSet<()>,
    in_flight: InFlight,
}

impl<C> WorkerPool<C>
where
    C: EndpointClient + Sync + 'static,
{
    pub fn new(
        client: Arc<C>,
        policy: RetryPolicy,
        concurrency: usize,
        records: Sender<RequestRecord>,
    ) -> Self {
        Self {
            client,
            policy,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            tasks: JoinSet::new(),
            in_flight: InFlight::new(records),
        }
    }

    /// Start a request. Returns immediately while below the concurrency bound, otherwise waits
    /// until a running request finishes. Returns `false` if the request was not started.
    pub async fn dispatch(
        &mut self,
        id: RequestId,
        shape: ShapeParams,
        request: CompletionRequest,
    ) -> bool {
        self.dispatch_until(id, shape, request, std::future::pending::<()>())
            .await
    }

    /// Like [`WorkerPool::dispatch`], but gives up waiting for a free slot once `interrupt`
    /// resolves. A request that was not started leaves no record.
    pub async fn dispatch_until<F>(
        &mut self,
        id: RequestId,
        shape: ShapeParams,
        request: CompletionRequest,
        interrupt: F,
    ) -> bool
    where
        F: Future<Output = ()>,
    {
        // Reap finished tasks so the join set does not grow with the run.
        while let Some(res) = self.tasks.try_join_next() {
            log_join_error(res);
        }

        let acquired = tokio::select! {
            biased;
            permit = self.permits.clone().acquire_owned() => permit,
            _ = interrupt => {
                debug!("{id} not dispatched, all {} slots still busy", self.concurrency);
                return false;
            }
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(err) => {
                error!("{id} not dispatched, concurrency permits unavailable: {err}");
                return false;
            }
        };

        let dispatched_at = OffsetDateTime::now_utc();
        self.in_flight.insert(
            id,
            Pending {
                shape,
                dispatched_at,
                context_tokens: request.context_tokens,
                retries: 0,
                throttled_attempts: 0,
            },
        );
        trace!("Dispatching {id}");

        #[cfg(feature = "metrics")]
        metrics::gauge!("loadbench_in_flight").set(self.in_flight() as f64);

        let client = self.client.clone();
        let policy = self.policy;
        let in_flight = self.in_flight.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            let attempts =
                run_request(&*client, policy, &in_flight, id, shape, dispatched_at, request);
            let (record, elapsed) = Timed::new(attempts).await;
            trace!(
                "{id} finished after {} attempt(s) in {}",
                record.retries + 1,
                humantime::format_duration(elapsed)
            );
            in_flight.complete(record);

            #[cfg(feature = "metrics")]
            metrics::gauge!("loadbench_in_flight").set(in_flight.len() as f64);
        }
        .in_current_span());
        true
    }

    /// Requests dispatched but not yet finalized.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Wait up to `timeout` for in-flight requests, then finalize the rest as drain timeouts.
    pub async fn drain(&mut self, timeout: Duration) -> DrainReport {
        let pending = self.in_flight();
        debug!(
            "Draining {pending} in-flight request(s) for up to {}",
            humantime::format_duration(timeout)
        );

        let tasks = &mut self.tasks;
        let joined = tokio::time::timeout(timeout, async {
            while let Some(res) = tasks.join_next().await {
                log_join_error(res);
            }
        })
        .await;

        let timed_out = match joined {
            Ok(()) => self
                .in_flight
                .expire("worker task ended without producing a result"),
            Err(_) => self.in_flight.expire(&format!(
                "still in flight after the {} drain timeout",
                humantime::format_duration(timeout)
            )),
        };

        // Stragglers were finalized above; a late completion is ignored by the registry.
        self.tasks.abort_all();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                if !err.is_cancelled() {
                    error!("Worker task failed: {err}");
                }
            }
        }

        if timed_out > 0 {
            warn!("{timed_out} request(s) did not finish before the drain timeout");
        }

        DrainReport { pending, timed_out }
    }
}

fn log_join_error(res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        error!("Worker task failed: {err}");
    }
}

/// Drive one logical request through its attempts.
async fn run_request<C: EndpointClient + Sync>(
    client: &C,
    policy: RetryPolicy,
    in_flight: &InFlight,
    id: RequestId,
    shape: ShapeParams,
    dispatched_at: OffsetDateTime,
    request: CompletionRequest,
) -> RequestRecord {
    let mut retries = 0;
    let mut throttled_attempts = 0;

    loop {
        let result = client.complete(&request).await;
        let outcome = AttemptOutcome::classify(&result);
        if outcome == AttemptOutcome::Transient(ErrorKind::Throttled) {
            throttled_attempts += 1;
        }

        let hint = result.as_ref().ok().and_then(|r| r.retry_after);
        let outcome = match policy.decide(&outcome, retries, hint) {
            RetryDecision::Retry(delay) => {
                debug!(
                    "{id} attempt {} failed ({}), retrying in {}",
                    retries + 1,
                    describe(&result),
                    humantime::format_duration(delay)
                );

                #[cfg(feature = "metrics")]
                metrics::counter!("loadbench_retries_total").increment(1);

                retries += 1;
                in_flight.progress(id, retries, throttled_attempts);
                tokio::time::sleep(delay).await;
                continue;
            }
            RetryDecision::Accept => Outcome::Success,
            RetryDecision::GiveUp { exhausted } => {
                let error = outcome.error().unwrap_or(ErrorKind::ClientError);
                let message = describe(&result);
                if exhausted {
                    warn!("{id} gave up after {retries} retries: {message}");
                } else {
                    debug!("{id} failed permanently: {message}");
                }
                Outcome::Failure {
                    error,
                    message,
                    retries_exhausted: exhausted,
                }
            }
        };

        let response = result.as_ref().ok();
        return RequestRecord {
            request_id: id,
            shape,
            dispatched_at,
            completed_at: OffsetDateTime::now_utc(),
            retries,
            throttled_attempts,
            outcome,
            status_code: response.map(|r| r.status),
            latency: response.map(|r| r.latency),
            ttft: response.and_then(|r| r.ttft),
            context_tokens: response
                .and_then(|r| r.prompt_tokens)
                .unwrap_or(request.context_tokens),
            generated_tokens: response.map(|r| r.generated_tokens).unwrap_or(0),
            utilization: response.and_then(|r| r.utilization),
            model: response.and_then(|r| r.model.clone()),
        };
    }
}

fn describe(result: &Result<CompletionResponse, TransportError>) -> String {
    match result {
        Ok(response) if response.is_success() => format!("HTTP {}", response.status),
        Ok(response) => match &response.body {
            Some(body) if !body.is_empty() => {
                let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
                format!("HTTP {}: {}", response.status, body.trim())
            }
            _ => format!("HTTP {}", response.status),
        },
        Err(err) => err.to_string(),
    }
}
