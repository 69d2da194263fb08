use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;

/// Wraps a future and reports how long it took from its first poll to completion.
#[pin_project::pin_project]
pub(crate) struct Timed<F> {
    #[pin]
    inner: F,
    start: Option<Instant>,
}

impl<F> Timed<F> {
    pub fn new(inner: F) -> Self {
        Self { inner, start: None }
    }
}

impl<F: Future> Future for Timed<F> {
    type Output = (F::Output, Duration);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let start = *this.start.get_or_insert_with(Instant::now);
        match this.inner.poll(cx) {
            Poll::Ready(out) => Poll::Ready((out, start.elapsed())),
            Poll::Pending => Poll::Pending,
        }
    }
}
