use thiserror::Error;

/// Outcome errors stored in result tables and surfaced at read time.
///
/// These are `Clone` because a single failure can be read through many
/// item keys (a batch-wide error fans out to every queued item).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("unable to find batch {0}")]
    BatchNotFound(String),
    #[error("unable to find item {item} in batch {batch}")]
    ItemNotFound { batch: String, item: String },
    #[error("timeout")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("batch failed: {0}")]
    Batch(String),
    #[error("source failed: {0}")]
    SourceFailed(String),
    #[error("expected at most one result for {key}, found {count}")]
    MultipleResults { key: String, count: usize },
    #[error("cannot cast {value} to {column_type} for column {column}")]
    Cast { value: String, column: String, column_type: &'static str },
}

/// Call-site misuse. These fail immediately on `load`/`put` rather than
/// being deferred to `run`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    #[error("source {0} is not registered")]
    UnknownSource(String),
    #[error("source {name} failed on a previous run: {reason}")]
    SourceFailed { name: String, reason: LoadError },
    #[error("batch key {key} is not understood by the {source_name} source")]
    UnsupportedBatch { source_name: &'static str, key: String },
    #[error("column {column} is not the primary key of {schema}; cardinality must be explicit")]
    CardinalityRequired { schema: String, column: String },
    #[error("{0} is not a known schema")]
    NotASchema(String),
    #[error("schema {schema} has no association {field}")]
    UnknownField { schema: String, field: String },
    #[error("schema {schema} has no column {column}")]
    UnknownColumn { schema: String, column: String },
    #[error("schema {0} has a composite primary key; item keys must be lists of key values")]
    CompositePrimaryKey(String),
    #[error("expected a record with a primary key, got {0}")]
    NotARecord(String),
    #[error("invalid item key {item} for batch {batch}")]
    InvalidItemKey { batch: String, item: String },
}

/// Read-side error, shaped by the loader's `get_policy`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GetError {
    #[error("source {0} is not registered")]
    UnknownSource(String),
    #[error(transparent)]
    Load(LoadError),
}

/// Panic payload used by the `RaiseOnError` policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("get failed: {0}")]
pub struct GetFailure(pub LoadError);

/// Failure reported by a KV batch function; broadcast to every queued
/// item of the failed batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BatchError(pub String);

impl BatchError {
    pub fn new(reason: impl Into<String>) -> Self {
        BatchError(reason.into())
    }
}

/// Failure reported by the backing relational store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown schema {0}")]
    UnknownSchema(String),
    #[error("query failed: {0}")]
    Query(String),
}
