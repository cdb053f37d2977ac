use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{BatchQueue, Lookup, ResultCache};
use crate::error::{LoadError, LoaderError};
use crate::key::{BatchKey, ItemKey, Term};
use crate::source::{Source, SourceOptions};

/// What a [`TestSource`] does when it is run.
#[derive(Debug, Clone)]
pub enum Script {
    /// Resolve every queued item to its own key.
    Echo,
    /// Fail the entire run (the orchestrator replaces the source slot).
    Fail(String),
    /// Panic inside the run.
    Panic(String),
    /// Sleep before echoing, for timeout tests.
    Sleep(Duration),
}

/// Scripted source for exercising orchestrator behavior in tests:
/// records every run's drained batches and counts run invocations.
#[derive(Debug)]
pub struct TestSource {
    script: Script,
    pending: BatchQueue<Term, ()>,
    results: ResultCache<Term>,
    options: SourceOptions,
    runs: Arc<AtomicUsize>,
    history: Arc<Mutex<Vec<Vec<(Term, Vec<Term>)>>>>,
}

impl TestSource {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            pending: BatchQueue::new(),
            results: ResultCache::new(),
            options: SourceOptions::default(),
            runs: Arc::new(AtomicUsize::new(0)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn echo() -> Self {
        Self::new(Script::Echo)
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::new(Script::Fail(reason.into()))
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self::new(Script::Panic(message.into()))
    }

    pub fn sleeping(duration: Duration) -> Self {
        Self::new(Script::Sleep(duration))
    }

    pub fn options(mut self, options: SourceOptions) -> Self {
        self.options = options;
        self
    }

    /// Counter handle surviving the source's moves through `run`.
    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }

    /// Batches drained by each run, in run order.
    pub fn run_history(&self) -> Arc<Mutex<Vec<Vec<(Term, Vec<Term>)>>>> {
        Arc::clone(&self.history)
    }

    fn keys(batch: &BatchKey, item: &ItemKey) -> Result<(Term, Term), LoaderError> {
        let batch_term = match batch {
            BatchKey::Term(term) => term.clone(),
            other => {
                return Err(LoaderError::UnsupportedBatch { source_name: "test", key: other.to_string() })
            }
        };
        let item_term = match item {
            ItemKey::Term(term) => term.clone(),
            other => {
                return Err(LoaderError::InvalidItemKey {
                    batch: batch.to_string(),
                    item: other.to_string(),
                })
            }
        };
        Ok((batch_term, item_term))
    }
}

#[async_trait]
impl Source for TestSource {
    fn load(&mut self, batch: &BatchKey, item: &ItemKey) -> Result<(), LoaderError> {
        let (batch, key) = Self::keys(batch, item)?;
        if !self.results.has_ok(&batch, &key) {
            self.pending.enqueue(batch, key, ());
        }
        Ok(())
    }

    fn put(&mut self, batch: &BatchKey, item: &ItemKey, value: Value) -> Result<(), LoaderError> {
        let (batch, key) = Self::keys(batch, item)?;
        self.results.insert(batch, key, Ok(value));
        Ok(())
    }

    async fn run(mut self: Box<Self>) -> Result<Box<dyn Source>, LoadError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let drained = self.pending.drain();
        if let Ok(mut history) = self.history.lock() {
            history.push(
                drained
                    .iter()
                    .map(|(batch, entries)| {
                        (batch.clone(), entries.iter().map(|(key, ())| key.clone()).collect())
                    })
                    .collect(),
            );
        }
        match &self.script {
            Script::Fail(reason) => return Err(LoadError::SourceFailed(reason.clone())),
            Script::Panic(message) => panic!("{message}"),
            Script::Sleep(duration) => tokio::time::sleep(*duration).await,
            Script::Echo => {}
        }
        for (batch, entries) in drained {
            let items: HashMap<Term, Result<Value, LoadError>> =
                entries.into_iter().map(|(key, ())| (key.clone(), Ok(key.to_value()))).collect();
            self.results.merge_loaded(batch, items);
        }
        Ok(self)
    }

    fn fetch(&self, batch: &BatchKey, item: &ItemKey) -> Result<Value, LoadError> {
        let (batch_term, key) =
            Self::keys(batch, item).map_err(|e| LoadError::BatchNotFound(e.to_string()))?;
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
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn echo_resolves_items_to_their_keys() {
        let mut source = TestSource::echo();
        let counter = source.run_counter();
        let history = source.run_history();
        let batch = BatchKey::term("b");
        source.load(&batch, &ItemKey::from(1)).unwrap();
        source.load(&batch, &ItemKey::from(1)).unwrap();
        source.load(&batch, &ItemKey::from(2)).unwrap();
        let source = Box::new(source).run().await.unwrap();
        assert_eq!(source.fetch(&batch, &ItemKey::from(1)), Ok(json!(1)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let runs = history.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0][0].1, vec![Term::Int(1), Term::Int(2)]);
    }

    #[tokio::test]
    async fn failing_script_fails_the_whole_run() {
        let mut source = TestSource::failing("backend down");
        let batch = BatchKey::term("b");
        source.load(&batch, &ItemKey::from(1)).unwrap();
        let err = Box::new(source).run().await.unwrap_err();
        assert_eq!(err, LoadError::SourceFailed("backend down".to_owned()));
    }
}
