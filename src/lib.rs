mod cache;
mod error;
mod key;
mod kv;
mod loader;
mod policy;
mod relational;
mod runner;
mod source;
mod telemetry;
mod test_source;

#[cfg(feature = "stats")]
mod run_stats;

pub use error::{BatchError, GetError, GetFailure, LoadError, LoaderError, StoreError};
pub use key::{BatchKey, Cardinality, Direction, ItemKey, OrderBy, QueryParams, Term};
pub use kv::{BatchFunction, KvSource};
pub use loader::{Loader, LoaderOptions};
pub use policy::GetPolicy;
pub use relational::{
    not_loaded, Association, ColumnType, DefaultRunBatch, MemoryStore, Query, QueryFn,
    RelationalSource, RunBatch, SchemaInfo, Store, StoreOptions, NOT_LOADED_KEY, SCHEMA_KEY,
};
pub use runner::UnitError;
pub use source::{Source, SourceOptions, DEFAULT_SOURCE_TIMEOUT};
pub use test_source::{Script, TestSource};
