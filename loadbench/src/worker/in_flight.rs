use async_channel::Sender;
use loadbench_core::{ErrorKind, Outcome, RequestId, RequestRecord, ShapeParams};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Progress of a request that has been dispatched but not yet finalized.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub shape: ShapeParams,
    pub dispatched_at: OffsetDateTime,
    pub context_tokens: u32,
    pub retries: u32,
    pub throttled_attempts: u32,
}

/// Registry of requests awaiting their terminal record.
///
/// Emitting a record happens under the registry lock together with removing the entry, so a
/// request is finalized exactly once whether it completes normally or is expired by a drain.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pending: Arc<Mutex<HashMap<RequestId, Pending>>>,
    records: Sender<RequestRecord>,
}

impl InFlight {
    pub fn new(records: Sender<RequestRecord>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            records,
        }
    }

    pub fn insert(&self, id: RequestId, pending: Pending) {
        self.lock().insert(id, pending);
    }

    /// Update the retry counters of a request that is still running.
    pub fn progress(&self, id: RequestId, retries: u32, throttled_attempts: u32) {
        if let Some(pending) = self.lock().get_mut(&id) {
            pending.retries = retries;
            pending.throttled_attempts = throttled_attempts;
        }
    }

    /// Finalize a request. Returns `false` if it was already finalized by [`InFlight::expire`].
    pub fn complete(&self, record: RequestRecord) -> bool {
        let mut pending = self.lock();
        if pending.remove(&record.request_id).is_none() {
            trace!("{} already finalized, dropping late completion", record.request_id);
            return false;
        }
        self.emit(record);
        true
    }

    /// Finalize every remaining request as a [`ErrorKind::DrainTimeout`] failure.
    pub fn expire(&self, message: &str) -> usize {
        let mut pending = self.lock();
        let now = OffsetDateTime::now_utc();
        let expired = pending.len();

        for (request_id, entry) in pending.drain() {
            self.emit(RequestRecord {
                request_id,
                shape: entry.shape,
                dispatched_at: entry.dispatched_at,
                completed_at: now,
                retries: entry.retries,
                throttled_attempts: entry.throttled_attempts,
                outcome: Outcome::Failure {
                    error: ErrorKind::DrainTimeout,
                    message: message.to_string(),
                    retries_exhausted: false,
                },
                status_code: None,
                latency: None,
                ttft: None,
                context_tokens: entry.context_tokens,
                generated_tokens: 0,
                utilization: None,
                model: None,
            });
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn emit(&self, record: RequestRecord) {
        if let Err(err) = self.records.try_send(record) {
            error!("Record channel closed, {} lost", err.into_inner().request_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
