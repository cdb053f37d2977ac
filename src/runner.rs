use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::LoadError;

/// Failure of a single execution unit. A unit failing never affects its
/// siblings or the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("timeout")]
    Timeout,
    #[error("unit panicked: {0}")]
    Panicked(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<UnitError> for LoadError {
    fn from(error: UnitError) -> Self {
        match error {
            UnitError::Timeout => LoadError::Timeout,
            UnitError::Cancelled => LoadError::Cancelled,
            UnitError::Panicked(reason) => LoadError::SourceFailed(reason),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunnerOptions {
    pub timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
}

/// Aborts still-running units when the runner future itself is dropped,
/// so caller cancellation tears every spawned task down.
struct Teardown {
    aborts: Vec<AbortHandle>,
    armed: bool,
}

impl Teardown {
    fn arm(aborts: Vec<AbortHandle>) -> Self {
        Self { aborts, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.armed {
            for handle in &self.aborts {
                handle.abort();
            }
        }
    }
}

/// Runs independent units concurrently on spawned tasks, each under the
/// deadline and drawing from the parallelism bound. The returned list
/// preserves input identity and order; a unit's panic, timeout, or
/// forced termination is reported as its own `Err` outcome.
pub(crate) async fn run_parallel<K, T, F>(
    units: Vec<(K, F)>,
    options: RunnerOptions,
) -> Vec<(K, Result<T, UnitError>)>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let semaphore = options.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let deadline = options.timeout;
    let mut keyed: Vec<(K, JoinHandle<Result<T, UnitError>>)> = Vec::with_capacity(units.len());
    for (key, unit) in units {
        let semaphore = semaphore.clone();
        let handle = tokio::task::spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => {
                    Some(semaphore.acquire_owned().await.map_err(|_| UnitError::Cancelled)?)
                }
                None => None,
            };
            match deadline {
                Some(limit) => {
                    tokio::time::timeout(limit, unit).await.map_err(|_| UnitError::Timeout)
                }
                None => Ok(unit.await),
            }
        });
        keyed.push((key, handle));
    }

    let mut teardown = Teardown::arm(keyed.iter().map(|(_, h)| h.abort_handle()).collect());
    let mut outcomes = Vec::with_capacity(keyed.len());
    for (key, handle) in keyed {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(UnitError::Panicked(panic_message(join.into_panic()))),
            Err(_) => Err(UnitError::Cancelled),
        };
        outcomes.push((key, outcome));
    }
    teardown.disarm();
    outcomes
}

/// Runs units one at a time in the caller's context, still under the
/// deadline and with panics trapped.
pub(crate) async fn run_sequential<K, T, F>(
    units: Vec<(K, F)>,
    options: RunnerOptions,
) -> Vec<(K, Result<T, UnitError>)>
where
    F: Future<Output = T>,
{
    let mut outcomes = Vec::with_capacity(units.len());
    for (key, unit) in units {
        let guarded = AssertUnwindSafe(unit).catch_unwind();
        let outcome = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Err(_) => Err(UnitError::Timeout),
                Ok(Err(payload)) => Err(UnitError::Panicked(panic_message(payload))),
                Ok(Ok(value)) => Ok(value),
            },
            None => guarded.await.map_err(|payload| UnitError::Panicked(panic_message(payload))),
        };
        outcomes.push((key, outcome));
    }
    outcomes
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn preserves_input_identity_and_order() {
        let units = vec![
            ("a", async { 1u32 }.boxed()),
            ("b", async { 2u32 }.boxed()),
            ("c", async { 3u32 }.boxed()),
        ];
        let outcomes = run_parallel(units, RunnerOptions::default()).await;
        let keys: Vec<_> = outcomes.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(outcomes[2].1, Ok(3));
    }

    #[tokio::test]
    async fn times_out_a_single_unit_without_affecting_siblings() {
        let units = vec![
            ("slow", async { tokio::time::sleep(Duration::from_millis(250)).await; 1u32 }.boxed()),
            ("fast", async { 2u32 }.boxed()),
        ];
        let options =
            RunnerOptions { timeout: Some(Duration::from_millis(20)), max_concurrency: None };
        let outcomes = run_parallel(units, options).await;
        assert_eq!(outcomes[0].1, Err(UnitError::Timeout));
        assert_eq!(outcomes[1].1, Ok(2));
    }

    #[tokio::test]
    async fn traps_panics() {
        let units = vec![
            ("boom", async { panic!("kaboom") }.boxed()),
            ("ok", async { 7u32 }.boxed()),
        ];
        let outcomes = run_parallel(units, RunnerOptions::default()).await;
        assert_eq!(outcomes[0].1, Err(UnitError::Panicked("kaboom".to_owned())));
        assert_eq!(outcomes[1].1, Ok(7));
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        static LIVE: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);
        let units: Vec<_> = (0..8)
            .map(|i| {
                (i, async {
                    let live = LIVE.fetch_add(1, Ordering::SeqCst) + 1;
                    PEAK.fetch_max(live, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    LIVE.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed())
            })
            .collect();
        let options = RunnerOptions { timeout: None, max_concurrency: Some(2) };
        run_parallel(units, options).await;
        assert!(PEAK.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn sequential_traps_panics_and_timeouts() {
        let units = vec![
            ("boom", async { panic!("sequential kaboom") }.boxed_local()),
            ("slow", async { tokio::time::sleep(Duration::from_millis(250)).await }.boxed_local()),
            ("ok", async {}.boxed_local()),
        ];
        let options =
            RunnerOptions { timeout: Some(Duration::from_millis(20)), max_concurrency: None };
        let outcomes = run_sequential(units, options).await;
        assert_eq!(outcomes[0].1, Err(UnitError::Panicked("sequential kaboom".to_owned())));
        assert_eq!(outcomes[1].1, Err(UnitError::Timeout));
        assert_eq!(outcomes[2].1, Ok(()));
    }
}
