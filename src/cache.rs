use std::collections::HashMap;
use std::hash::Hash;

use serde_json::Value;

use crate::error::LoadError;
use crate::key::Term;

/// Pending batches: per batch, the insertion-ordered and de-duplicated
/// set of queued items. `P` is the per-item payload a source needs at
/// run time (the coerced input, or the full parent record for
/// association batches).
#[derive(Debug, Clone)]
pub(crate) struct BatchQueue<B, P> {
    batches: HashMap<B, Vec<(Term, P)>>,
}

impl<B: Eq + Hash, P> BatchQueue<B, P> {
    pub fn new() -> Self {
        Self { batches: HashMap::new() }
    }

    /// Queues an entry unless the same item key is already pending in
    /// the batch.
    pub fn enqueue(&mut self, batch: B, key: Term, payload: P) {
        let entries = self.batches.entry(batch).or_default();
        if entries.iter().all(|(k, _)| *k != key) {
            entries.push((key, payload));
        }
    }

    pub fn pending(&self) -> bool {
        self.batches.values().any(|entries| !entries.is_empty())
    }

    pub fn drain(&mut self) -> Vec<(B, Vec<(Term, P)>)> {
        self.batches.drain().filter(|(_, entries)| !entries.is_empty()).collect()
    }
}

impl<B: Eq + Hash, P> Default for BatchQueue<B, P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Materialized outcome of one batch.
#[derive(Debug, Clone)]
pub(crate) enum BatchResult {
    Loaded(HashMap<Term, Result<Value, LoadError>>),
    /// The whole batch failed; every item under it reads as this error.
    Failed(LoadError),
}

#[derive(Debug)]
pub(crate) enum Lookup {
    Hit(Result<Value, LoadError>),
    NoBatch,
    NoItem,
}

/// Per-source result table: batch -> item -> outcome.
#[derive(Debug, Clone)]
pub(crate) struct ResultCache<B> {
    results: HashMap<B, BatchResult>,
}

impl<B: Eq + Hash> ResultCache<B> {
    pub fn new() -> Self {
        Self { results: HashMap::new() }
    }

    pub fn lookup(&self, batch: &B, key: &Term) -> Lookup {
        match self.results.get(batch) {
            None => Lookup::NoBatch,
            Some(BatchResult::Failed(error)) => Lookup::Hit(Err(error.clone())),
            Some(BatchResult::Loaded(items)) => match items.get(key) {
                None => Lookup::NoItem,
                Some(outcome) => Lookup::Hit(outcome.clone()),
            },
        }
    }

    /// Whether the item already resolved `{ok, _}`. Error results are
    /// not sticky: they leave the item eligible for re-queueing.
    pub fn has_ok(&self, batch: &B, key: &Term) -> bool {
        matches!(self.lookup(batch, key), Lookup::Hit(Ok(_)))
    }

    /// Writes a single outcome, e.g. a warmed value. A batch-level
    /// failure slot is replaced by a fresh item table.
    pub fn insert(&mut self, batch: B, key: Term, outcome: Result<Value, LoadError>) {
        let slot = self.results.entry(batch).or_insert_with(|| BatchResult::Loaded(HashMap::new()));
        if let BatchResult::Failed(_) = slot {
            *slot = BatchResult::Loaded(HashMap::new());
        }
        if let BatchResult::Loaded(items) = slot {
            items.insert(key, outcome);
        }
    }

    /// Merges a run's item outcomes into the batch. Run results win over
    /// warmed values; items untouched by this run keep their outcome.
    pub fn merge_loaded(&mut self, batch: B, items: HashMap<Term, Result<Value, LoadError>>) {
        let slot = self.results.entry(batch).or_insert_with(|| BatchResult::Loaded(HashMap::new()));
        if let BatchResult::Failed(_) = slot {
            *slot = BatchResult::Loaded(HashMap::new());
        }
        if let BatchResult::Loaded(existing) = slot {
            existing.extend(items);
        }
    }

    /// Records a batch-wide failure, replacing any prior outcomes under
    /// the batch key.
    pub fn fail_batch(&mut self, batch: B, error: LoadError) {
        self.results.insert(batch, BatchResult::Failed(error));
    }
}

impl<B: Eq + Hash> Default for ResultCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_deduplicates_items() {
        let mut queue: BatchQueue<Term, ()> = BatchQueue::new();
        queue.enqueue(Term::from("users"), Term::Int(1), ());
        queue.enqueue(Term::from("users"), Term::Int(1), ());
        queue.enqueue(Term::from("users"), Term::Int(2), ());
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.len(), 2);
        assert!(!queue.pending());
    }

    #[test]
    fn lookup_distinguishes_batch_and_item_misses() {
        let mut cache: ResultCache<Term> = ResultCache::new();
        assert!(matches!(cache.lookup(&Term::from("users"), &Term::Int(1)), Lookup::NoBatch));
        cache.insert(Term::from("users"), Term::Int(2), Ok(json!("x")));
        assert!(matches!(cache.lookup(&Term::from("users"), &Term::Int(1)), Lookup::NoItem));
        assert!(matches!(cache.lookup(&Term::from("users"), &Term::Int(2)), Lookup::Hit(Ok(_))));
    }

    #[test]
    fn run_results_overwrite_warmed_values() {
        let mut cache: ResultCache<Term> = ResultCache::new();
        cache.insert(Term::from("users"), Term::Int(1), Ok(json!("warm")));
        let mut run = HashMap::new();
        run.insert(Term::Int(1), Ok(json!("fresh")));
        cache.merge_loaded(Term::from("users"), run);
        match cache.lookup(&Term::from("users"), &Term::Int(1)) {
            Lookup::Hit(Ok(v)) => assert_eq!(v, json!("fresh")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn batch_failure_fans_out_and_is_not_sticky() {
        let mut cache: ResultCache<Term> = ResultCache::new();
        cache.fail_batch(Term::from("users"), LoadError::Timeout);
        assert!(matches!(
            cache.lookup(&Term::from("users"), &Term::Int(1)),
            Lookup::Hit(Err(LoadError::Timeout))
        ));
        assert!(!cache.has_ok(&Term::from("users"), &Term::Int(1)));
        // a later successful run replaces the failure
        let mut run = HashMap::new();
        run.insert(Term::Int(1), Ok(json!("ok")));
        cache.merge_loaded(Term::from("users"), run);
        assert!(cache.has_ok(&Term::from("users"), &Term::Int(1)));
    }
}
