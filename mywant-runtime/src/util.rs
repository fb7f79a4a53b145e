//! Small stream/task helpers shared across the engine.

use futures::{stream, Future, FutureExt, Stream, StreamExt};
use pin_project::pin_project;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::runtime::Handle;

/// A [`tokio::task::JoinHandle`] that aborts its task when dropped, rather
/// than letting it run to completion. Every per-want cooperative task and
/// every asynchronous agent invocation is owned through one of these, so
/// deleting a want or cancelling an agent call is as simple as dropping the
/// handle.
pub(crate) struct CancelableJoinHandle<T> {
    inner: tokio::task::JoinHandle<T>,
}

impl<T: Send + 'static> CancelableJoinHandle<T> {
    pub(crate) fn spawn(future: impl Future<Output = T> + Send + 'static, runtime: &Handle) -> Self {
        CancelableJoinHandle {
            inner: runtime.spawn(future),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

impl<T: Default> Future for CancelableJoinHandle<T> {
    type Output = T;

    /// A task that was aborted or that panicked yields `T::default()`
    /// instead of re-panicking the poller — every `progress()`/agent-action
    /// panic is already caught and turned into a failed-want outcome before
    /// the task itself ever returns (see [`catch_panic`]), so a `JoinError`
    /// reaching here means the task was cancelled, not that it crashed.
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner.poll_unpin(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(err)) => {
                tracing::error!(error = %err, "cooperative task ended without a result");
                Poll::Ready(T::default())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Extracts a human-readable message from a caught panic's payload, the way
/// the standard panic hook does for `&str`/`String` payloads.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

#[pin_project]
pub(crate) struct OnComplete<S, F> {
    #[pin]
    stream: stream::Fuse<S>,
    #[pin]
    on_complete: F,
}

impl<S: Stream, F: Future<Output = ()>> Stream for OnComplete<S, F> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.stream.poll_next(cx) {
            Poll::Ready(None) => match this.on_complete.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(()) => Poll::Ready(None),
            },
            x => x,
        }
    }
}

pub(crate) trait EngineStreamExt: Stream + Sized {
    /// Runs `on_complete` once the stream finishes (by returning `None`).
    fn on_complete<F: Future<Output = ()>>(self, on_complete: F) -> OnComplete<Self, F> {
        OnComplete {
            stream: self.fuse(),
            on_complete,
        }
    }
}

impl<S: Stream> EngineStreamExt for S {}
