use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::task::JoinHandle;
use crate::error::{Error, Result};

/// Eventual outcome of one throttled call.
///
/// Dropping a `Deferred` does not cancel the call; the unit of work still
/// runs in its slot and its result is discarded.
pub struct Deferred<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Ready(Option<Result<T>>),
    Scheduled(JoinHandle<Result<T>>),
}

impl<T> Deferred<T> {
    pub(crate) fn ready(result: Result<T>) -> Self {
        Deferred { inner: Inner::Ready(Some(result)) }
    }

    pub(crate) fn scheduled(handle: JoinHandle<Result<T>>) -> Self {
        Deferred { inner: Inner::Scheduled(handle) }
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            Inner::Ready(_) => true,
            Inner::Scheduled(handle) => handle.is_finished(),
        }
    }
}

// No field is ever pinned; the result is moved out by value.
impl<T> Unpin for Deferred<T> {}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(slot) => Poll::Ready(slot.take().unwrap_or(Err(Error::Cancelled))),
            Inner::Scheduled(handle) => match ready!(Pin::new(handle).poll(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(e) if e.is_panic() => Poll::Ready(Err(Error::from_panic(e.into_panic()))),
                Err(_) => Poll::Ready(Err(Error::Cancelled)),
            },
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("finished", &self.is_finished())
            .finish()
    }
}
