//! Run lifecycle: schedule, dispatch, drain, summarize.
use crate::aggregator::MetricsAggregator;
use crate::client::EndpointClient;
use crate::retry::RetryPolicy;
use crate::scheduler::{RateScheduler, StopSignal};
use crate::shape::{RequestShapeGenerator, ShapeConstructionError};
use crate::sink::OutputSink;
use crate::worker::WorkerPool;
use arc_swap::ArcSwap;
use async_channel::Receiver;
use loadbench_core::{ConfigValidationError, RequestId, RequestRecord, RunConfig, RunSummary};
use std::fmt;
use std::io;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Completed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("Invalid request shape: {0}")]
    Shape(#[from] ShapeConstructionError),

    #[error("Unable to write the run summary: {0}")]
    Output(#[source] io::Error),

    #[error("Record collector failed: {0}")]
    Collector(#[from] tokio::task::JoinError),
}

/// Observe or cancel a run from outside.
#[derive(Debug, Clone)]
pub struct RunHandle {
    stop: StopSignal,
    state: Arc<ArcSwap<RunState>>,
}

impl RunHandle {
    /// Stop issuing requests. In-flight requests still get the drain timeout to finish.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn state(&self) -> RunState {
        **self.state.load()
    }

    fn set_state(&self, state: RunState) {
        debug!("Run state: {state}");
        self.state.store(Arc::new(state));
    }
}

/// Drives one run from a validated [`RunConfig`] to its final [`RunSummary`].
pub struct RunController<C, S> {
    config: RunConfig,
    client: Arc<C>,
    sink: S,
    generator: RequestShapeGenerator,
    aggregator: MetricsAggregator,
    handle: RunHandle,
}

impl<C, S> RunController<C, S>
where
    C: EndpointClient + Sync + 'static,
    S: OutputSink,
{
    /// Validates the configuration and the request shape; nothing is sent yet.
    pub fn new(config: RunConfig, client: Arc<C>, sink: S) -> Result<Self, RunError> {
        config.validate()?;
        let generator = RequestShapeGenerator::new(
            config.shape_params()?,
            config.sampling,
            config.prevent_server_caching,
        )?;

        Ok(Self {
            config,
            client,
            sink,
            generator,
            aggregator: MetricsAggregator::new(),
            handle: RunHandle {
                stop: StopSignal::new(),
                state: Arc::new(ArcSwap::from_pointee(RunState::Idle)),
            },
        })
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn aggregator(&self) -> MetricsAggregator {
        self.aggregator.clone()
    }

    #[instrument(name = "run", skip_all, fields(run_id = %self.aggregator.run_id()))]
    pub async fn run(self) -> Result<RunSummary, RunError> {
        let Self {
            config,
            client,
            sink,
            mut generator,
            aggregator,
            handle,
        } = self;

        let ping = average_ping(&*client, config.ping_samples, &handle.stop).await;
        if let Some(adjustment) = ping {
            aggregator.set_latency_adjustment(adjustment);
        }

        let start = Instant::now();
        let shape = generator.shape();
        let (tx, rx) = async_channel::unbounded();
        let mut pool = WorkerPool::new(
            client,
            RetryPolicy::from_config(&config),
            config.concurrency,
            tx,
        );
        let collector = tokio::spawn(
            collect(rx, sink, aggregator.clone(), config.stats_interval, start).in_current_span(),
        );

        // Validated non-zero in `new`.
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let mut scheduler =
            RateScheduler::new(config.rate, config.duration, burst, handle.stop.clone());
        if let Some(max) = config.max_requests {
            scheduler = scheduler.with_max_ticks(max);
        }

        info!(
            "Starting run against {} ({}): {} req/s for {}, shape {} ctx / {} max",
            config.endpoint,
            config.deployment,
            config.rate,
            humantime::format_duration(config.duration),
            shape.context_tokens,
            shape.max_tokens,
        );
        handle.set_state(RunState::Running);

        while let Some(tick) = scheduler.next_tick().await {
            let request = generator.generate();
            let id = RequestId(tick.seq);
            if !pool
                .dispatch_until(id, shape, request, scheduler.interrupted())
                .await
            {
                debug!("Run ended while {id} waited for a free slot");
                break;
            }
        }

        let cancelled = handle.stop.is_stopped();
        if cancelled {
            info!("Run stopped after {} request(s)", scheduler.emitted());
        } else {
            info!("Dispatched {} request(s), draining", scheduler.emitted());
        }

        handle.set_state(RunState::Draining);
        let report = pool.drain(config.drain_timeout).await;
        debug!("Drain report: {report:?}");

        // Dropping the pool closes the record channel and lets the collector finish.
        drop(pool);
        let mut sink = collector.await?;

        let summary = aggregator.finalize(start.elapsed(), cancelled);
        sink.summary(&summary).map_err(RunError::Output)?;

        info!("Run finished: {summary}");
        handle.set_state(if cancelled {
            RunState::Cancelled
        } else {
            RunState::Completed
        });

        Ok(summary)
    }
}

/// Mean round trip of up to `samples` pings; `None` when pinging is off or nothing answered.
async fn average_ping<C: EndpointClient>(
    client: &C,
    samples: u32,
    stop: &StopSignal,
) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut answered = 0u32;
    for _ in 0..samples {
        if stop.is_stopped() {
            break;
        }
        match client.ping().await {
            Ok(rtt) => {
                total += rtt;
                answered += 1;
            }
            Err(err) => debug!("Ping failed: {err}"),
        }
    }

    if answered == 0 {
        if samples > 0 {
            warn!("Endpoint answered none of {samples} ping(s), latencies stay unadjusted");
        }
        return None;
    }
    let average = total / answered;
    info!("Average ping to endpoint: {:.1}ms", average.as_secs_f64() * 1000.);
    Some(average)
}

/// Own the sink for the duration of the run: write and aggregate every record, emit a
/// snapshot every `interval` (never, if zero).
async fn collect<S: OutputSink>(
    records: Receiver<RequestRecord>,
    mut sink: S,
    aggregator: MetricsAggregator,
    interval: Duration,
    start: Instant,
) -> S {
    let periodic = !interval.is_zero();
    let period = if periodic {
        interval
    } else {
        Duration::from_secs(3600)
    };
    let mut ticker = tokio::time::interval_at(start + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut failed_writes = 0u64;
    loop {
        tokio::select! {
            record = records.recv() => {
                let Ok(record) = record else { break };
                aggregator.submit(&record);
                if let Err(err) = sink.record(&record) {
                    failed_writes += 1;
                    warn!("Unable to write {}: {err}", record.request_id);
                }
            }
            _ = ticker.tick(), if periodic => {
                let snapshot = aggregator.snapshot(start.elapsed());
                info!("{snapshot}");
                if let Err(err) = sink.stats(&snapshot) {
                    warn!("Unable to write stats: {err}");
                }
            }
        }
    }

    if failed_writes > 0 {
        error!("{failed_writes} record(s) could not be written to the output");
    }
    sink
}
