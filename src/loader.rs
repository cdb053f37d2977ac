use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::error::{GetError, LoadError, LoaderError};
use crate::key::{BatchKey, ItemKey};
use crate::policy::GetPolicy;
use crate::runner::{self, RunnerOptions};
use crate::source::Source;
use crate::telemetry;

#[cfg(feature = "stats")]
use crate::run_stats::RunStats;

/// Floor for the run deadline when no source declares a timeout.
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(15);

/// Headroom added over the slowest source's own timeout.
const RUN_TIMEOUT_HEADROOM: Duration = Duration::from_secs(1);

/// Batch loads values from expensive resources, primarily intended for
/// mitigating GraphQL's N+1 problem.
///
/// A `Loader` owns a set of named [`Source`]s. Callers enqueue
/// `(source, batch, item)` requests with [`Loader::load`] and
/// [`Loader::load_many`]; no I/O happens until [`Loader::run`], which
/// materializes every pending batch across all sources — concurrently
/// for sources that allow it. Results are read back with
/// [`Loader::get`]/[`Loader::get_many`], shaped by the configured
/// [`GetPolicy`], and can be seeded out-of-band through
/// [`Loader::put`].
///
/// Results are memoized per `(source, batch, item)`: re-loading a key
/// that already resolved is a no-op, so repeated traversals of the same
/// object graph never refetch. Error results are not sticky — a key
/// whose batch failed is re-queued by the next `load` and may succeed
/// on a later run.
///
/// The loader presents value semantics: every mutating operation takes
/// `&mut self` and leaves the loader in a consistent, observable state.
/// A source whose `run` fails wholesale is replaced by an error
/// sentinel; reads and writes against it surface the failure while the
/// rest of the loader stays usable.
#[derive(Debug)]
pub struct Loader {
    sources: HashMap<String, SourceSlot>,
    options: LoaderOptions,
    #[cfg(feature = "stats")]
    stats: RunStats,
}

#[derive(Debug)]
enum SourceSlot {
    Ready(Box<dyn Source>),
    /// Left behind by a source-level run failure; all access surfaces
    /// the reason until the slot is re-registered.
    Failed(LoadError),
}

/// Loader-level options.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Deadline for an entire `run`. Defaults to the slowest source
    /// timeout plus one second, with a 15 s floor.
    pub timeout: Option<Duration>,
    pub get_policy: GetPolicy,
}

impl LoaderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn get_policy(mut self, get_policy: GetPolicy) -> Self {
        self.get_policy = get_policy;
        self
    }
}

impl Loader {
    pub fn new() -> Self {
        Self::with_options(LoaderOptions::default())
    }

    pub fn with_options(options: LoaderOptions) -> Self {
        Self {
            sources: HashMap::new(),
            options,
            #[cfg(feature = "stats")]
            stats: RunStats::new(),
        }
    }

    /// Registers a source under a name, replacing any source previously
    /// registered under the same name (including failed sentinels).
    pub fn add_source(&mut self, name: impl Into<String>, source: impl Source + 'static) -> &mut Self {
        self.sources.insert(name.into(), SourceSlot::Ready(Box::new(source)));
        self
    }

    /// Enqueues a single item for batched loading. Fails immediately on
    /// unknown sources and malformed keys.
    pub fn load(
        &mut self,
        source: &str,
        batch: impl Into<BatchKey>,
        item: impl Into<ItemKey>,
    ) -> Result<&mut Self, LoaderError> {
        let batch = batch.into();
        let item = item.into();
        self.with_source(source, |src| src.load(&batch, &item))?;
        Ok(self)
    }

    /// Enqueues each item in turn.
    pub fn load_many<I, T>(
        &mut self,
        source: &str,
        batch: impl Into<BatchKey>,
        items: I,
    ) -> Result<&mut Self, LoaderError>
    where
        I: IntoIterator<Item = T>,
        T: Into<ItemKey>,
    {
        let batch = batch.into();
        self.with_source(source, |src| {
            for item in items {
                src.load(&batch, &item.into())?;
            }
            Ok(())
        })?;
        Ok(self)
    }

    /// Warms the cache with an out-of-band value; no backend call is
    /// made for it on the next run.
    pub fn put(
        &mut self,
        source: &str,
        batch: impl Into<BatchKey>,
        item: impl Into<ItemKey>,
        value: Value,
    ) -> Result<&mut Self, LoaderError> {
        let batch = batch.into();
        let item = item.into();
        self.with_source(source, |src| src.put(&batch, &item, value))?;
        Ok(self)
    }

    /// Whether any registered source has pending batches.
    pub fn pending_batches(&self) -> bool {
        self.sources.values().any(|slot| match slot {
            SourceSlot::Ready(source) => source.pending_batches(),
            SourceSlot::Failed(_) => false,
        })
    }

    /// Materializes every pending batch across all sources.
    ///
    /// Sources declaring `is_async` run on parallel tasks; the rest run
    /// one at a time in the caller's context. Each source runs under
    /// the loader deadline. A source failure (error, panic, or timeout)
    /// replaces that source's slot with an error sentinel and never
    /// affects its siblings. With nothing pending this returns
    /// immediately.
    pub async fn run(&mut self) -> &mut Self {
        if !self.pending_batches() {
            return self;
        }
        let deadline = self.effective_timeout();
        let slots = std::mem::take(&mut self.sources);
        let mut parallel = Vec::new();
        let mut sequential = Vec::new();
        for (name, slot) in slots {
            match slot {
                SourceSlot::Ready(source) if source.pending_batches() => {
                    if source.is_async() {
                        parallel.push((name, source));
                    } else {
                        sequential.push((name, source));
                    }
                }
                idle => {
                    self.sources.insert(name, idle);
                }
            }
        }

        let timer = telemetry::run_start(parallel.len() + sequential.len());
        #[cfg(feature = "stats")]
        self.stats.record_run(parallel.len() + sequential.len());

        let parallel_units: Vec<_> =
            parallel.into_iter().map(|(name, source)| (name, source.run())).collect();
        let sequential_units: Vec<_> =
            sequential.into_iter().map(|(name, source)| (name, source.run())).collect();
        let options = RunnerOptions { timeout: Some(deadline), max_concurrency: None };
        let (parallel_outcomes, sequential_outcomes) = futures::join!(
            runner::run_parallel(parallel_units, options.clone()),
            runner::run_sequential(sequential_units, options),
        );

        for (name, outcome) in parallel_outcomes.into_iter().chain(sequential_outcomes) {
            let slot = match outcome {
                Ok(Ok(source)) => SourceSlot::Ready(source),
                Ok(Err(error)) => SourceSlot::Failed(error),
                Err(unit_error) => SourceSlot::Failed(unit_error.into()),
            };
            #[cfg(feature = "stats")]
            if let SourceSlot::Failed(_) = slot {
                self.stats.record_source_failure();
            }
            self.sources.insert(name, slot);
        }
        telemetry::run_stop(timer);
        self
    }

    /// Reads one materialized result, shaped by the loader's
    /// [`GetPolicy`]. Referencing an unknown source is a call-site
    /// error under every policy.
    pub fn get(
        &self,
        source: &str,
        batch: impl Into<BatchKey>,
        item: impl Into<ItemKey>,
    ) -> Result<Value, GetError> {
        let batch = batch.into();
        let item = item.into();
        let outcome = match self.sources.get(source) {
            None => return Err(GetError::UnknownSource(source.to_owned())),
            Some(SourceSlot::Failed(reason)) => Err(reason.clone()),
            Some(SourceSlot::Ready(src)) => src.fetch(&batch, &item),
        };
        self.options.get_policy.apply(outcome)
    }

    /// Maps [`Loader::get`] over the items; output position `i`
    /// corresponds to input position `i`.
    pub fn get_many<I, T>(
        &self,
        source: &str,
        batch: impl Into<BatchKey>,
        items: I,
    ) -> Vec<Result<Value, GetError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<ItemKey>,
    {
        let batch = batch.into();
        items.into_iter().map(|item| self.get(source, batch.clone(), item)).collect()
    }

    fn with_source<R>(
        &mut self,
        name: &str,
        op: impl FnOnce(&mut Box<dyn Source>) -> Result<R, LoaderError>,
    ) -> Result<R, LoaderError> {
        match self.sources.get_mut(name) {
            None => Err(LoaderError::UnknownSource(name.to_owned())),
            Some(SourceSlot::Failed(reason)) => Err(LoaderError::SourceFailed {
                name: name.to_owned(),
                reason: reason.clone(),
            }),
            Some(SourceSlot::Ready(source)) => op(source),
        }
    }

    fn effective_timeout(&self) -> Duration {
        if let Some(timeout) = self.options.timeout {
            return timeout;
        }
        let slowest = self
            .sources
            .values()
            .filter_map(|slot| match slot {
                SourceSlot::Ready(source) => source.timeout(),
                SourceSlot::Failed(_) => None,
            })
            .max();
        match slowest {
            Some(timeout) => timeout + RUN_TIMEOUT_HEADROOM,
            None => DEFAULT_RUN_TIMEOUT,
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use serde_json::json;

    use super::*;
    use crate::kv::KvSource;
    use crate::source::SourceOptions;

    fn echo_source() -> KvSource {
        KvSource::from_fn(|_batch, keys| async move {
            Ok(keys.into_iter().map(|k| (k.clone(), k.to_value())).collect::<StdHashMap<_, _>>())
        })
    }

    #[tokio::test]
    async fn unknown_source_fails_at_the_call_site() {
        let mut loader = Loader::new();
        let err = loader.load("nope", "batch", 1).unwrap_err();
        assert_eq!(err, LoaderError::UnknownSource("nope".to_owned()));
        assert_eq!(
            loader.get("nope", "batch", 1),
            Err(GetError::UnknownSource("nope".to_owned()))
        );
    }

    #[tokio::test]
    async fn run_without_pending_work_is_identity() {
        let mut loader = Loader::new();
        loader.add_source("numbers", echo_source());
        assert!(!loader.pending_batches());
        loader.run().await;
        assert!(!loader.pending_batches());
    }

    #[tokio::test]
    async fn duplicate_registration_overwrites() {
        let mut loader = Loader::with_options(LoaderOptions::new().get_policy(GetPolicy::Tuples));
        loader.add_source("numbers", echo_source());
        loader.load("numbers", "ints", 1).unwrap();
        loader.add_source("numbers", echo_source());
        // the replacement source has no pending work
        assert!(!loader.pending_batches());
    }

    #[tokio::test]
    async fn effective_timeout_tracks_the_slowest_source() {
        let mut loader = Loader::new();
        assert_eq!(loader.effective_timeout(), DEFAULT_RUN_TIMEOUT);
        loader.add_source(
            "slow",
            echo_source().options(SourceOptions::new().timeout(Duration::from_secs(30))),
        );
        assert_eq!(loader.effective_timeout(), Duration::from_secs(31));
        let mut pinned = Loader::with_options(LoaderOptions::new().timeout(Duration::from_secs(2)));
        pinned.add_source("slow", echo_source());
        assert_eq!(pinned.effective_timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn get_many_preserves_input_order() {
        let mut loader = Loader::new();
        loader.add_source("numbers", echo_source());
        loader.load_many("numbers", "ints", [3, 1, 2]).unwrap();
        loader.run().await;
        let values: Vec<_> = loader
            .get_many("numbers", "ints", [3, 1, 2])
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(values, vec![json!(3), json!(1), json!(2)]);
    }
}
