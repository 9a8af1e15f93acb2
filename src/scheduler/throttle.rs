use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::Instrument;
use crate::config::ThrottleConfig;
use crate::error::{BoxError, Error, Result};
use crate::observability::metrics;
use crate::observability::tracing::trace_throttled_call;
use crate::scheduler::deferred::Deferred;
use crate::scheduler::state::{fits_schedule, Admission, ThrottleSnapshot, ThrottleState};
use crate::scheduler::work::Work;

/// The wrapped unit of work: receives the call's context and arguments.
pub type Callable<C, A, T> = Arc<dyn Fn(C, A) -> Work<T> + Send + Sync>;

struct Shared {
    state: Mutex<ThrottleState>,
    interval: Duration,
    config: ThrottleConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        // Admission never panics while holding the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases an admitted call's pending slot when the call finishes,
/// however it finishes.
struct PendingGuard {
    shared: Arc<Shared>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let pending = state.release();
        metrics::record_pending(&self.shared.config.name, pending);
    }
}

/// Spaces invocations of a unit of work at least `interval` apart.
///
/// Clones share the same state; independently constructed throttles never do.
pub struct Throttle<C, A, T> {
    shared: Arc<Shared>,
    callable: Callable<C, A, T>,
}

impl<C, A, T> Clone for Throttle<C, A, T> {
    fn clone(&self) -> Self {
        Throttle {
            shared: Arc::clone(&self.shared),
            callable: Arc::clone(&self.callable),
        }
    }
}

impl<C, A, T> Throttle<C, A, T>
where
    C: Send + 'static,
    A: Send + 'static,
    T: Send + 'static,
{
    /// Wraps a callable that may complete synchronously or asynchronously.
    pub fn new<F>(interval: Duration, config: ThrottleConfig, callable: F) -> Result<Self>
    where
        F: Fn(C, A) -> Work<T> + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(Error::InvalidConfig(
                "interval must be greater than zero".to_string(),
            ));
        }
        config.validate()?;
        if !fits_schedule(Instant::now(), interval, config.slack()) {
            return Err(Error::InvalidConfig(
                "interval plus slack is too large to schedule".to_string(),
            ));
        }

        let state = ThrottleState::new(interval, config.slack(), config.max_queue_depth);
        Ok(Throttle {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                interval,
                config,
            }),
            callable: Arc::new(callable),
        })
    }

    /// Wraps an async callable.
    pub fn new_async<F, Fut, E>(interval: Duration, config: ThrottleConfig, callable: F) -> Result<Self>
    where
        F: Fn(C, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::new(interval, config, move |context, args| Work::pending(callable(context, args)))
    }

    /// Admits one call and returns its eventual result.
    ///
    /// Backpressure is reported here, synchronously. Every other failure,
    /// including errors and panics of the unit of work, arrives through the
    /// returned [`Deferred`]. Must be called from within a tokio runtime.
    pub fn call(&self, context: C, args: A) -> Result<Deferred<T>> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let admission = self.admit()?;
        let guard = PendingGuard { shared: Arc::clone(&self.shared) };
        let span = trace_throttled_call(&self.shared.config.name, admission.seq);
        let name = self.shared.config.name.clone();
        let strict = self.shared.config.require_async;

        if admission.is_immediate() {
            let work = span.in_scope(|| invoke(&self.callable, context, args));
            let future = match split_work(work, strict) {
                Ok(future) => future,
                Err(result) => {
                    span.in_scope(|| report(&result, &name));
                    drop(guard);
                    return Ok(Deferred::ready(result));
                }
            };
            let task = async move {
                let _guard = guard;
                let result = drive(future).await;
                report(&result, &name);
                result
            };
            return Ok(Deferred::scheduled(handle.spawn(task.instrument(span))));
        }

        let callable = Arc::clone(&self.callable);
        let task = async move {
            let _guard = guard;
            tokio::time::sleep_until(admission.start_at).await;
            let result = match split_work(invoke(&callable, context, args), strict) {
                Ok(future) => drive(future).await,
                Err(result) => result,
            };
            report(&result, &name);
            result
        };
        Ok(Deferred::scheduled(handle.spawn(task.instrument(span))))
    }

    fn admit(&self) -> Result<Admission> {
        let name = &self.shared.config.name;
        let admitted = {
            // The gauge is written under the lock so it never lags a release.
            let mut state = self.shared.lock();
            let admitted = state.admit(Instant::now());
            if let Ok(admission) = &admitted {
                metrics::record_pending(name, admission.pending);
            }
            admitted
        };
        match admitted {
            Ok(admission) => {
                tracing::debug!(
                    throttle = %name,
                    seq = admission.seq,
                    wait_ms = admission.wait.as_millis() as u64,
                    pending = admission.pending,
                    "call admitted"
                );
                metrics::record_admitted(name, admission.wait);
                Ok(admission)
            }
            Err(e) => {
                tracing::warn!(throttle = %name, "{}", e);
                metrics::record_rejected(name);
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().pending()
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.shared.config
    }
}

impl<A, T> Throttle<(), A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Calls a throttle that needs no context.
    pub fn run(&self, args: A) -> Result<Deferred<T>> {
        self.call((), args)
    }
}

/// Builds a throttle around an async callable, using the default options
/// when `config` is `None`.
pub fn make_throttled<C, A, T, F, Fut, E>(
    interval: Duration,
    callable: F,
    config: Option<ThrottleConfig>,
) -> Result<Throttle<C, A, T>>
where
    C: Send + 'static,
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(C, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
{
    Throttle::new_async(interval, config.unwrap_or_default(), callable)
}

fn invoke<C, A, T>(callable: &Callable<C, A, T>, context: C, args: A) -> Result<Work<T>> {
    std::panic::catch_unwind(AssertUnwindSafe(|| callable(context, args)))
        .map_err(Error::from_panic)
}

/// Splits work that still has to be driven from work that already finished.
fn split_work<T>(
    work: Result<Work<T>>,
    strict: bool,
) -> std::result::Result<BoxFuture<'static, Result<T>>, Result<T>> {
    match work {
        Ok(Work::Pending(future)) => Ok(future),
        Ok(Work::Ready(_)) if strict => Err(Err(Error::InvalidCallable)),
        Ok(Work::Ready(result)) => Err(result),
        Err(e) => Err(Err(e)),
    }
}

async fn drive<T>(future: BoxFuture<'static, Result<T>>) -> Result<T> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}

fn report<T>(result: &Result<T>, name: &str) {
    match result {
        Err(Error::Panicked(message)) => {
            tracing::error!(throttle = %name, "throttled call panicked: {}", message)
        }
        Err(e) => tracing::debug!(throttle = %name, error = %e, "throttled call failed"),
        Ok(_) => tracing::trace!(throttle = %name, "throttled call completed"),
    }
    metrics::record_outcome(name, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CALL_AMOUNT: usize = 10;
    const THROTTLE_TIME: Duration = Duration::from_millis(100);

    type Stamps = Arc<Mutex<Vec<Instant>>>;

    fn recorder(config: ThrottleConfig) -> (Throttle<(), (), ()>, Stamps) {
        let stamps: Stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stamps);
        let throttle = Throttle::new_async(THROTTLE_TIME, config, move |(), ()| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(Instant::now());
                Ok::<_, Error>(())
            }
        })
        .unwrap();
        (throttle, stamps)
    }

    fn assert_spaced(stamps: &[Instant], interval: Duration) {
        for pair in stamps.windows(2) {
            assert!(
                pair[1] - pair[0] >= interval,
                "calls started {:?} apart",
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_calls_are_spaced() {
        let (throttle, stamps) = recorder(ThrottleConfig::default());

        for _ in 0..CALL_AMOUNT {
            throttle.run(()).unwrap().await.unwrap();
        }

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), CALL_AMOUNT);
        assert_spaced(&stamps, THROTTLE_TIME);
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_calls_all_run() {
        let (throttle, stamps) = recorder(ThrottleConfig::default());

        for _ in 0..CALL_AMOUNT {
            let _ = throttle.run(()).unwrap();
        }
        assert_eq!(throttle.pending(), CALL_AMOUNT);

        tokio::time::sleep(THROTTLE_TIME * CALL_AMOUNT as u32 * 2).await;

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), CALL_AMOUNT);
        assert_spaced(&stamps, THROTTLE_TIME);
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_spaced() {
        let (throttle, stamps) = recorder(ThrottleConfig::default());

        let calls: Vec<_> = (0..CALL_AMOUNT).map(|_| throttle.run(()).unwrap()).collect();
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }

        let mut stamps = stamps.lock().unwrap().clone();
        stamps.sort();
        assert_eq!(stamps.len(), CALL_AMOUNT);
        assert_spaced(&stamps, THROTTLE_TIME);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_raises_backpressure() {
        let (throttle, stamps) = recorder(ThrottleConfig::default().with_max_queue_depth(3));

        let outcomes: Vec<_> = (0..6).map(|_| throttle.run(())).collect();

        assert!(outcomes[..3].iter().all(|outcome| outcome.is_ok()));
        let err = outcomes[3].as_ref().unwrap_err();
        assert!(err.is_backpressure());
        let message = err.to_string();
        assert!(message.contains("Throttle backpressure error"));
        assert!(message.contains("queue depth 4"));
        assert!(message.contains("max 3"));
        assert!(outcomes[4..].iter().all(|outcome| outcome.is_err()));
        assert_eq!(throttle.pending(), 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(stamps.lock().unwrap().len(), 3);
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_queue_depth_matches_explicit_default() {
        let (implicit, _) = recorder(ThrottleConfig::default());
        let (explicit, _) = recorder(ThrottleConfig::default().with_max_queue_depth(100));
        assert_eq!(implicit.config(), explicit.config());

        for throttle in [&implicit, &explicit] {
            for _ in 0..100 {
                throttle.run(()).unwrap();
            }
            let err = throttle.run(()).unwrap_err();
            assert!(err.to_string().contains("max 100"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn context_and_arguments_are_forwarded() {
        struct Account {
            id: String,
        }

        let throttle = make_throttled(
            THROTTLE_TIME,
            |account: Arc<Account>, (prefix, n): (&'static str, u32)| async move {
                Ok::<_, Error>(format!("{prefix}{}-{n}", account.id))
            },
            None,
        )
        .unwrap();

        let account = Arc::new(Account { id: "X".to_string() });
        let first = throttle.call(Arc::clone(&account), ("id:", 1)).unwrap();
        let second = throttle.call(account, ("id:", 2)).unwrap();
        assert_eq!(first.await.unwrap(), "id:X-1");
        assert_eq!(second.await.unwrap(), "id:X-2");
    }

    #[tokio::test(start_paused = true)]
    async fn sync_callables_run_when_not_strict() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let throttle = Throttle::new(THROTTLE_TIME, ThrottleConfig::default(), move |(), n: usize| {
            counter.fetch_add(1, Ordering::SeqCst);
            Work::value(n * 2)
        })
        .unwrap();

        let first = throttle.run(1).unwrap();
        assert!(first.is_finished());
        assert_eq!(first.await.unwrap(), 2);
        assert_eq!(throttle.run(4).unwrap().await.unwrap(), 8);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_throttle_rejects_sync_callables() {
        let throttle = Throttle::new(
            THROTTLE_TIME,
            ThrottleConfig::default().strict(),
            |(), ()| Work::value("done"),
        )
        .unwrap();

        for _ in 0..2 {
            let err = throttle.run(()).unwrap().await.unwrap_err();
            assert!(matches!(err, Error::InvalidCallable));
            assert!(err.to_string().contains("expects an asynchronous function"));
        }
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_disable_the_throttle() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let throttle = make_throttled(
            THROTTLE_TIME,
            move |(), ()| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt % 2 == 0 {
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "flaky upstream"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            None,
        )
        .unwrap();

        let calls: Vec<_> = (0..4).map(|_| throttle.run(()).unwrap()).collect();
        let results = futures::future::join_all(calls).await;

        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(attempt) => assert_eq!(attempt, i),
                Err(Error::Callable(inner)) => {
                    assert_eq!(inner.to_string(), "flaky upstream");
                    assert!(inner.downcast_ref::<std::io::Error>().is_some());
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_reported_and_release_the_slot() {
        let throttle = make_throttled(
            THROTTLE_TIME,
            |(), explode: bool| async move {
                if explode {
                    panic!("unit of work exploded");
                }
                Ok::<_, Error>("ok")
            },
            Some(ThrottleConfig::default().with_max_queue_depth(1)),
        )
        .unwrap();

        let err = throttle.run(true).unwrap().await.unwrap_err();
        assert!(matches!(err, Error::Panicked(ref m) if m == "unit of work exploded"));
        assert_eq!(throttle.pending(), 0);
        assert_eq!(throttle.run(false).unwrap().await.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_panics_are_reported() {
        let throttle = Throttle::new(THROTTLE_TIME, ThrottleConfig::default(), |(), ()| -> Work<()> {
            panic!("callable exploded before returning")
        })
        .unwrap();

        let immediate = throttle.run(()).unwrap();
        let delayed = throttle.run(()).unwrap();
        assert!(matches!(immediate.await, Err(Error::Panicked(_))));
        assert!(matches!(delayed.await, Err(Error::Panicked(_))));
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_result_does_not_cancel_the_call() {
        let (throttle, stamps) = recorder(ThrottleConfig::default());

        drop(throttle.run(()).unwrap());
        drop(throttle.run(()).unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(stamps.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_tracks_reserved_slots() {
        let (throttle, _) = recorder(ThrottleConfig::default().with_slack(Duration::ZERO));
        let start = Instant::now();

        for _ in 0..3 {
            let _ = throttle.run(()).unwrap();
        }

        let snapshot = throttle.snapshot();
        assert_eq!(snapshot.pending, 3);
        assert_eq!(snapshot.interval, THROTTLE_TIME);
        assert_eq!(snapshot.max_queue_depth, 100);
        assert_eq!(snapshot.next_allowed, Some(start + THROTTLE_TIME * 3));
    }

    #[tokio::test]
    async fn clones_share_state_but_new_throttles_do_not() {
        let (first, _) = recorder(ThrottleConfig::default());
        let (other, _) = recorder(ThrottleConfig::default());
        let clone = first.clone();

        let _ = first.run(()).unwrap();
        let _ = clone.run(()).unwrap();

        assert_eq!(first.snapshot(), clone.snapshot());
        assert_eq!(first.pending(), 2);
        assert_eq!(other.pending(), 0);
    }

    #[test]
    fn invalid_construction_is_rejected() {
        let zero_interval = make_throttled(Duration::ZERO, |(), ()| async { Ok::<_, Error>(()) }, None);
        assert!(matches!(zero_interval, Err(Error::InvalidConfig(_))));

        let zero_depth = make_throttled(
            THROTTLE_TIME,
            |(), ()| async { Ok::<_, Error>(()) },
            Some(ThrottleConfig::default().with_max_queue_depth(0)),
        );
        assert!(matches!(zero_depth, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn oversized_interval_is_rejected_at_construction() {
        let too_long = make_throttled(Duration::MAX, |(), ()| async { Ok::<_, Error>(()) }, None);
        assert!(matches!(too_long, Err(Error::InvalidConfig(_))));

        let too_much_slack = make_throttled(
            THROTTLE_TIME,
            |(), ()| async { Ok::<_, Error>(()) },
            Some(ThrottleConfig::default().with_slack(Duration::MAX)),
        );
        assert!(matches!(too_much_slack, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn slot_overflow_fails_the_call_instead_of_panicking() {
        // The first slot fits past now, the second does not.
        let interval = Duration::from_secs(i64::MAX as u64 / 2 + 1);
        let throttle = make_throttled(
            interval,
            |(), ()| async { Ok::<_, Error>("ran") },
            Some(ThrottleConfig::default().with_slack(Duration::ZERO)),
        )
        .unwrap();
        assert_eq!(throttle.interval(), interval);

        assert_eq!(throttle.run(()).unwrap().await.unwrap(), "ran");
        for _ in 0..2 {
            assert!(matches!(throttle.run(()), Err(Error::InvalidConfig(_))));
        }
        assert_eq!(throttle.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn callers_on_many_threads_stay_spaced() {
        const CALLERS: usize = 16;
        let interval = Duration::from_millis(20);
        let config = ThrottleConfig::default()
            .with_slack(Duration::from_millis(20))
            .named("multi-thread-callers");

        let stamps: Stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stamps);
        let throttle = Throttle::new_async(interval, config, move |(), ()| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(Instant::now());
                Ok::<_, Error>(())
            }
        })
        .unwrap();

        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move { throttle.run(()).unwrap().await })
            })
            .collect();
        for caller in futures::future::join_all(callers).await {
            caller.unwrap().unwrap();
        }

        let mut stamps = stamps.lock().unwrap().clone();
        stamps.sort();
        assert_eq!(stamps.len(), CALLERS);
        assert_spaced(&stamps, interval);
        assert_eq!(throttle.pending(), 0);
        assert_eq!(
            metrics::PENDING_CALLS.with_label_values(&["multi-thread-callers"]).get(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn named_throttles_report_under_their_own_label() {
        let (first, _) = recorder(ThrottleConfig::default().named("label-first"));
        let (second, _) = recorder(ThrottleConfig::default().named("label-second"));
        assert_eq!(first.config().name, "label-first");

        let admitted = |name: &str| metrics::CALLS_ADMITTED.with_label_values(&[name]).get();
        let pending = |name: &str| metrics::PENDING_CALLS.with_label_values(&[name]).get();

        let calls: Vec<_> = (0..3).map(|_| first.run(()).unwrap()).collect();
        let _ = second.run(()).unwrap();
        assert_eq!(admitted("label-first"), 3);
        assert_eq!(admitted("label-second"), 1);
        assert_eq!(pending("label-first"), 3);

        futures::future::join_all(calls).await;
        assert_eq!(pending("label-first"), 0);
    }

    #[test]
    fn calling_outside_a_runtime_fails_without_admitting() {
        let (throttle, _) = recorder(ThrottleConfig::default());
        assert!(matches!(throttle.run(()), Err(Error::NoRuntime)));
        assert_eq!(throttle.pending(), 0);
    }
}
