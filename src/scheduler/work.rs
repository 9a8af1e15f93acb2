use std::future::Future;
use futures::future::{BoxFuture, FutureExt};
use crate::error::{BoxError, Error, Result};

/// What a unit of work hands back when the throttle invokes it.
///
/// Synchronous callables produce `Ready`; asynchronous ones produce
/// `Pending`, which the throttle drives to completion.
pub enum Work<T> {
    Ready(Result<T>),
    Pending(BoxFuture<'static, Result<T>>),
}

impl<T: Send + 'static> Work<T> {
    pub fn value(value: T) -> Self {
        Work::Ready(Ok(value))
    }

    pub fn ready<E>(result: std::result::Result<T, E>) -> Self
    where
        E: Into<BoxError>,
    {
        Work::Ready(result.map_err(Error::callable))
    }

    pub fn pending<F, E>(future: F) -> Self
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Work::Pending(future.map(|result| result.map_err(Error::callable)).boxed())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Work::Ready(_))
    }
}

impl<T> std::fmt::Debug for Work<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Ready(_) => f.write_str("Work::Ready"),
            Work::Pending(_) => f.write_str("Work::Pending"),
        }
    }
}
