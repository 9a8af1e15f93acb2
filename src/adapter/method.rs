use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use crate::config::ThrottleConfig;
use crate::error::{BoxError, Result};
use crate::scheduler::deferred::Deferred;
use crate::scheduler::throttle::Throttle;

/// Method-level throttle: one schedule per method definition, shared by
/// every receiver it is invoked on.
///
/// The original method is captured once, typically in a `lazy_static!`
/// next to the forwarding shim that replaces it:
///
/// ```rust,ignore
/// impl Client {
///     async fn fetch_unthrottled(self: Arc<Self>, path: String) -> Result<Body> { .. }
///
///     pub fn fetch(self: &Arc<Self>, path: String) -> Result<Deferred<Body>> {
///         lazy_static! {
///             static ref FETCH: ThrottledMethod<Client, String, Body> =
///                 ThrottledMethod::new(Duration::from_millis(100), None, Client::fetch_unthrottled)
///                     .expect("valid throttle");
///         }
///         FETCH.invoke(self, path)
///     }
/// }
/// ```
pub struct ThrottledMethod<S, A, T> {
    throttle: Throttle<Arc<S>, A, T>,
}

impl<S, A, T> ThrottledMethod<S, A, T>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, Fut, E>(interval: Duration, config: Option<ThrottleConfig>, method: F) -> Result<Self>
    where
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let throttle = Throttle::new_async(interval, config.unwrap_or_default(), method)?;
        Ok(ThrottledMethod { throttle })
    }

    /// Runs the method on `receiver` with `args` in the next free slot.
    pub fn invoke(&self, receiver: &Arc<S>, args: A) -> Result<Deferred<T>> {
        self.throttle.call(Arc::clone(receiver), args)
    }

    pub fn throttle(&self) -> &Throttle<Arc<S>, A, T> {
        &self.throttle
    }
}
