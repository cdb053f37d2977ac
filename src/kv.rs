use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{BatchQueue, Lookup, ResultCache};
use crate::error::{BatchError, LoadError, LoaderError};
use crate::key::{BatchKey, ItemKey, Term};
use crate::runner::{self, RunnerOptions};
use crate::source::{Source, SourceOptions};
use crate::telemetry;

/// A `BatchFunction` defines the method through which a [`KvSource`]
/// fetches batched data from some resource. It receives the batch key
/// and the de-duplicated set of item keys queued since the last run.
///
/// The function is not required to return a value for every requested
/// key: keys it omits read back as an item-not-found error until they
/// are re-queued. Returning `Err` fails the whole invocation, and the
/// error is broadcast to every queued item of the batch. Extra keys in
/// the returned mapping are merged as if they had been requested.
#[async_trait]
pub trait BatchFunction: Send + Sync {
    async fn load(&self, batch: &Term, keys: &[Term]) -> Result<HashMap<Term, Value>, BatchError>;
}

struct FnBatchFunction<F>(F);

#[async_trait]
impl<F, Fut> BatchFunction for FnBatchFunction<F>
where
    F: Fn(Term, Vec<Term>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HashMap<Term, Value>, BatchError>> + Send + 'static,
{
    async fn load(&self, batch: &Term, keys: &[Term]) -> Result<HashMap<Term, Value>, BatchError> {
        (self.0)(batch.clone(), keys.to_vec()).await
    }
}

/// Generic batch-function source.
///
/// Items queued under the same batch key are de-duplicated and handed
/// to the [`BatchFunction`] in a single invocation per batch per run.
/// Batches run concurrently under the source's `max_concurrency` and
/// `timeout`; one batch failing never poisons its siblings.
pub struct KvSource {
    fetch_fn: Arc<dyn BatchFunction>,
    pending: BatchQueue<Term, ()>,
    results: ResultCache<Term>,
    options: SourceOptions,
}

impl KvSource {
    pub fn new(fetch_fn: impl BatchFunction + 'static) -> Self {
        Self::with_options(fetch_fn, SourceOptions::default())
    }

    pub fn with_options(fetch_fn: impl BatchFunction + 'static, options: SourceOptions) -> Self {
        Self {
            fetch_fn: Arc::new(fetch_fn),
            pending: BatchQueue::new(),
            results: ResultCache::new(),
            options,
        }
    }

    /// Builds a source from an async closure.
    pub fn from_fn<F, Fut>(fetch_fn: F) -> Self
    where
        F: Fn(Term, Vec<Term>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<Term, Value>, BatchError>> + Send + 'static,
    {
        Self::new(FnBatchFunction(fetch_fn))
    }

    pub fn options(mut self, options: SourceOptions) -> Self {
        self.options = options;
        self
    }

    fn batch_term(batch: &BatchKey) -> Result<Term, LoaderError> {
        match batch {
            BatchKey::Term(term) => Ok(term.clone()),
            other => {
                Err(LoaderError::UnsupportedBatch { source_name: "kv", key: other.to_string() })
            }
        }
    }

    fn item_term(batch: &BatchKey, item: &ItemKey) -> Result<Term, LoaderError> {
        match item {
            ItemKey::Term(term) => Ok(term.clone()),
            other => Err(LoaderError::InvalidItemKey {
                batch: batch.to_string(),
                item: other.to_string(),
            }),
        }
    }
}

impl fmt::Debug for KvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvSource")
            .field("pending", &self.pending)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Source for KvSource {
    fn load(&mut self, batch: &BatchKey, item: &ItemKey) -> Result<(), LoaderError> {
        let batch = Self::batch_term(batch)?;
        let key = Self::item_term(&BatchKey::Term(batch.clone()), item)?;
        if !self.results.has_ok(&batch, &key) {
            self.pending.enqueue(batch, key, ());
        }
        Ok(())
    }

    fn put(&mut self, batch: &BatchKey, item: &ItemKey, value: Value) -> Result<(), LoaderError> {
        let batch = Self::batch_term(batch)?;
        let key = Self::item_term(&BatchKey::Term(batch.clone()), item)?;
        self.results.insert(batch, key, Ok(value));
        Ok(())
    }

    async fn run(mut self: Box<Self>) -> Result<Box<dyn Source>, LoadError> {
        let drained = self.pending.drain();
        if drained.is_empty() {
            return Ok(self);
        }
        let runner_options = RunnerOptions {
            timeout: self.options.timeout,
            max_concurrency: Some(self.options.max_concurrency),
        };
        let mut units = Vec::with_capacity(drained.len());
        for (batch, entries) in drained {
            let keys: Vec<Term> = entries.into_iter().map(|(key, ())| key).collect();
            let fetch_fn = Arc::clone(&self.fetch_fn);
            let unit_batch = batch.clone();
            let unit_keys = keys.clone();
            let unit = async move {
                let timer = telemetry::batch_run_start(&unit_batch.to_string(), unit_keys.len());
                let outcome = fetch_fn.load(&unit_batch, &unit_keys).await;
                telemetry::batch_run_stop(timer);
                outcome
            };
            units.push(((batch, keys), unit));
        }
        let outcomes = if self.options.asynchronous {
            runner::run_parallel(units, runner_options).await
        } else {
            runner::run_sequential(units, runner_options).await
        };
        for ((batch, keys), outcome) in outcomes {
            match outcome {
                Ok(Ok(mut loaded)) => {
                    let mut items = HashMap::new();
                    for key in keys {
                        if let Some(value) = loaded.remove(&key) {
                            items.insert(key, Ok(value));
                        }
                    }
                    // unrequested extras returned by the batch function
                    for (key, value) in loaded {
                        items.insert(key, Ok(value));
                    }
                    self.results.merge_loaded(batch, items);
                }
                Ok(Err(error)) => {
                    let reason = LoadError::Batch(error.to_string());
                    let items =
                        keys.into_iter().map(|key| (key, Err(reason.clone()))).collect();
                    self.results.merge_loaded(batch, items);
                }
                Err(unit_error) => {
                    let reason = LoadError::from(unit_error);
                    let items =
                        keys.into_iter().map(|key| (key, Err(reason.clone()))).collect();
                    self.results.merge_loaded(batch, items);
                }
            }
        }
        Ok(self)
    }

    fn fetch(&self, batch: &BatchKey, item: &ItemKey) -> Result<Value, LoadError> {
        let batch_term = Self::batch_term(batch).map_err(|e| LoadError::BatchNotFound(e.to_string()))?;
        let key = Self::item_term(batch, item).map_err(|e| LoadError::BatchNotFound(e.to_string()))?;
        match self.results.lookup(&batch_term, &key) {
            Lookup::Hit(outcome) => outcome,
            Lookup::NoBatch => Err(LoadError::BatchNotFound(batch_term.to_string())),
            Lookup::NoItem => Err(LoadError::ItemNotFound {
                batch: batch_term.to_string(),
                item: key.to_string(),
            }),
        }
    }

    fn pending_batches(&self) -> bool {
        self.pending.pending()
    }

    fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    fn is_async(&self) -> bool {
        self.options.asynchronous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_source() -> KvSource {
        KvSource::from_fn(|_batch, keys| async move {
            Ok(keys.into_iter().map(|k| (k.clone(), k.to_value())).collect())
        })
    }

    #[tokio::test]
    async fn load_then_run_then_fetch() {
        let mut source = echo_source();
        let batch = BatchKey::term("numbers");
        source.load(&batch, &ItemKey::from(1)).unwrap();
        source.load(&batch, &ItemKey::from(2)).unwrap();
        let source = Box::new(source).run().await.unwrap();
        assert_eq!(source.fetch(&batch, &ItemKey::from(1)), Ok(json!(1)));
        assert_eq!(source.fetch(&batch, &ItemKey::from(2)), Ok(json!(2)));
    }

    #[tokio::test]
    async fn fetch_distinguishes_missing_batch_and_item() {
        let mut source = echo_source();
        let batch = BatchKey::term("numbers");
        assert!(matches!(
            source.fetch(&batch, &ItemKey::from(1)),
            Err(LoadError::BatchNotFound(_))
        ));
        source.load(&batch, &ItemKey::from(1)).unwrap();
        let source = Box::new(source).run().await.unwrap();
        assert!(matches!(
            source.fetch(&batch, &ItemKey::from(9)),
            Err(LoadError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn omitted_keys_read_as_item_not_found() {
        let mut source = KvSource::from_fn(|_batch, _keys| async move { Ok(HashMap::new()) });
        let batch = BatchKey::term("sparse");
        source.load(&batch, &ItemKey::from(1)).unwrap();
        let source = Box::new(source).run().await.unwrap();
        assert!(matches!(
            source.fetch(&batch, &ItemKey::from(1)),
            Err(LoadError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn batch_error_broadcasts_to_all_queued_items() {
        let mut source =
            KvSource::from_fn(|_batch, _keys| async move { Err(BatchError::new("down")) });
        let batch = BatchKey::term("users");
        source.load(&batch, &ItemKey::from(1)).unwrap();
        source.load(&batch, &ItemKey::from(2)).unwrap();
        let source = Box::new(source).run().await.unwrap();
        for key in [1, 2] {
            assert_eq!(
                source.fetch(&batch, &ItemKey::from(key)),
                Err(LoadError::Batch("down".to_owned()))
            );
        }
    }

    #[tokio::test]
    async fn rejects_relational_batch_keys() {
        let mut source = echo_source();
        let err = source.load(&BatchKey::assoc("posts"), &ItemKey::from(1)).unwrap_err();
        assert!(matches!(err, LoaderError::UnsupportedBatch { source_name: "kv", .. }));
    }

    #[tokio::test]
    async fn run_without_pending_batches_is_identity() {
        let source = Box::new(echo_source()).run().await.unwrap();
        assert!(!source.pending_batches());
    }
}
