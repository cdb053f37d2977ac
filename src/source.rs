use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LoadError, LoaderError};
use crate::key::{BatchKey, ItemKey};

/// Default per-source run timeout.
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Capability interface every loader backend satisfies.
///
/// A source owns two tables: pending batches (batch key -> queued item
/// keys, de-duplicated) and results (batch key -> per-item outcomes).
/// `load` and `put` are pure bookkeeping; `run` is the only operation
/// that performs I/O, draining every pending batch into the result
/// table. Backends outside this crate can participate in a [`Loader`]
/// by implementing this trait.
///
/// [`Loader`]: crate::Loader
#[async_trait]
pub trait Source: fmt::Debug + Send {
    /// Queues an item in a batch unless it already resolved `{ok, _}`.
    /// Re-queues items whose last outcome was an error. Malformed keys
    /// fail here, at the call site.
    fn load(&mut self, batch: &BatchKey, item: &ItemKey) -> Result<(), LoaderError>;

    /// Warms the cache with an out-of-band value. Implementations may
    /// reject sentinel "not loaded" placeholders.
    fn put(&mut self, batch: &BatchKey, item: &ItemKey, value: Value) -> Result<(), LoaderError>;

    /// Drains pending batches, executes the batched fetches, and
    /// returns the updated source. With no pending batches this is
    /// identity. An `Err` marks the entire source as failed.
    async fn run(self: Box<Self>) -> Result<Box<dyn Source>, LoadError>;

    /// Reads one materialized outcome.
    fn fetch(&self, batch: &BatchKey, item: &ItemKey) -> Result<Value, LoadError>;

    fn pending_batches(&self) -> bool;

    /// Per-source run timeout, bounding each internal batch execution.
    fn timeout(&self) -> Option<Duration>;

    /// Whether the orchestrator may schedule this source in parallel
    /// with others. Sources needing store-side transactional affinity
    /// return false and run sequentially in the caller's context.
    fn is_async(&self) -> bool {
        true
    }
}

/// Source-local execution options shared by the reference sources.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub timeout: Option<Duration>,
    /// Upper bound on concurrently executing batches within one run.
    pub max_concurrency: usize,
    pub asynchronous: bool,
}

impl SourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Opt out of parallel scheduling during `Loader::run`.
    pub fn synchronous(mut self) -> Self {
        self.asynchronous = false;
        self
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_SOURCE_TIMEOUT),
            max_concurrency: default_max_concurrency(),
            asynchronous: true,
        }
    }
}

pub(crate) fn default_max_concurrency() -> usize {
    2 * std::thread::available_parallelism().map(usize::from).unwrap_or(1)
}
