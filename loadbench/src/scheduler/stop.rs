use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Run-wide cancellation signal. Cloning shares the signal; stopping is permanent.
#[derive(Clone, Default, Debug)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Default, Debug)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`StopSignal::stop`] has been called, immediately if it already was.
    pub async fn stopped(&self) {
        loop {
            // NOTE: The Notified future must exist before the flag check or a concurrent stop()
            // could slip between the two.
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}
