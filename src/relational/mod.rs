//! Association- and schema-aware batching over a relational store.
//!
//! The source never talks SQL; it drives the consumed [`Store`]
//! contract (schema introspection plus `IN`-batched and lateral
//! fetches) and does cardinality mapping, association traversal, and
//! input coercion itself.

mod memory;
mod query;
mod store;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{BatchQueue, Lookup, ResultCache};
use crate::error::{LoadError, LoaderError};
use crate::key::{BatchKey, Cardinality, ItemKey, QueryParams, Term};
use crate::runner::{self, RunnerOptions};
use crate::source::{Source, SourceOptions};
use crate::telemetry;

pub use memory::MemoryStore;
pub use query::Query;
pub use store::{
    Association, ColumnType, DefaultRunBatch, RunBatch, SchemaInfo, Store, StoreOptions,
};

/// Field marking a record object with its schema.
pub const SCHEMA_KEY: &str = "__schema__";

/// Field marking an association value that was never loaded.
pub const NOT_LOADED_KEY: &str = "__not_loaded__";

/// Placeholder for an unresolved association on a parent record.
/// [`RelationalSource`] refuses to cache it through `put`.
pub fn not_loaded(field: &str) -> Value {
    serde_json::json!({ NOT_LOADED_KEY: field })
}

fn is_not_loaded(value: &Value) -> bool {
    value.as_object().map_or(false, |fields| fields.contains_key(NOT_LOADED_KEY))
}

/// Query shaping callback applied before each batch is dispatched.
pub type QueryFn = dyn Fn(Query, &QueryParams) -> Query + Send + Sync;

/// Canonical batch identity. Built once on ingress so the run path
/// never re-discriminates on batch-key shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NormalizedBatch {
    Query {
        schema: String,
        cardinality: Cardinality,
        column: String,
        params: QueryParams,
        ctx: Option<Term>,
    },
    Assoc {
        schema: String,
        field: String,
        params: QueryParams,
        ctx: Option<Term>,
    },
}

impl NormalizedBatch {
    fn ctx(&self) -> Option<Term> {
        match self {
            NormalizedBatch::Query { ctx, .. } | NormalizedBatch::Assoc { ctx, .. } => ctx.clone(),
        }
    }
}

impl fmt::Display for NormalizedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizedBatch::Query { schema, cardinality: Cardinality::One, column, .. } => {
                write!(f, "one {schema} by {column}")
            }
            NormalizedBatch::Query { schema, cardinality: Cardinality::Many, column, .. } => {
                write!(f, "many {schema} by {column}")
            }
            NormalizedBatch::Assoc { schema, field, .. } => write!(f, "{schema}.{field}"),
        }
    }
}

/// Per-item payload carried from `load` to `run`.
#[derive(Debug, Clone)]
enum Entry {
    /// Coerced input value of a schema query.
    Input(Term),
    /// Full parent record of an association batch.
    Parent(Value),
}

/// Relational source: batches loads against a [`Store`] by association
/// or schema query, with per-batch query customization and cardinality
/// mapping.
pub struct RelationalSource {
    store: Arc<dyn Store>,
    query_fn: Option<Arc<QueryFn>>,
    run_batch: Arc<dyn RunBatch>,
    default_params: QueryParams,
    store_options: StoreOptions,
    ctx: Option<Term>,
    pending: BatchQueue<NormalizedBatch, Entry>,
    results: ResultCache<NormalizedBatch>,
    options: SourceOptions,
}

impl RelationalSource {
    pub fn new(store: impl Store + 'static) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            query_fn: None,
            run_batch: Arc::new(DefaultRunBatch),
            default_params: QueryParams::default(),
            store_options: StoreOptions::default(),
            ctx: None,
            pending: BatchQueue::new(),
            results: ResultCache::new(),
            options: SourceOptions::default(),
        }
    }

    /// Params merged under every batch's own params.
    pub fn default_params(mut self, params: QueryParams) -> Self {
        self.default_params = params;
        self
    }

    pub fn store_options(mut self, options: StoreOptions) -> Self {
        self.store_options = options;
        self
    }

    /// Execution-context token captured into every batch key built by
    /// this source and re-asserted on its store calls.
    pub fn context(mut self, ctx: impl Into<Term>) -> Self {
        self.ctx = Some(ctx.into());
        self
    }

    pub fn query_fn(
        mut self,
        query_fn: impl Fn(Query, &QueryParams) -> Query + Send + Sync + 'static,
    ) -> Self {
        self.query_fn = Some(Arc::new(query_fn));
        self
    }

    /// Replaces the default schema-query loader strategy.
    pub fn run_batch(mut self, run_batch: impl RunBatch + 'static) -> Self {
        self.run_batch = Arc::new(run_batch);
        self
    }

    pub fn options(mut self, options: SourceOptions) -> Self {
        self.options = options;
        self
    }

    fn normalize(
        &self,
        batch: &BatchKey,
        item: &ItemKey,
    ) -> Result<(NormalizedBatch, Term, Entry), LoaderError> {
        match batch {
            BatchKey::Term(_) => Err(LoaderError::UnsupportedBatch {
                source_name: "relational",
                key: batch.to_string(),
            }),
            BatchKey::Assoc { field, params } => self.normalize_assoc(field, params, item),
            BatchKey::Query { schema, cardinality, params } => {
                self.normalize_query(batch, schema, *cardinality, params, item)
            }
        }
    }

    fn normalize_assoc(
        &self,
        field: &str,
        params: &QueryParams,
        item: &ItemKey,
    ) -> Result<(NormalizedBatch, Term, Entry), LoaderError> {
        let record = match item {
            ItemKey::Record(record) => record,
            other => return Err(LoaderError::NotARecord(other.to_string())),
        };
        let fields = record
            .as_object()
            .ok_or_else(|| LoaderError::NotARecord(record.to_string()))?;
        let schema_name = fields
            .get(SCHEMA_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| LoaderError::NotARecord("record carries no schema tag".to_owned()))?;
        let info = self
            .store
            .schema(schema_name)
            .map_err(|_| LoaderError::NotASchema(schema_name.to_owned()))?;
        if !info.associations.contains_key(field) {
            return Err(LoaderError::UnknownField {
                schema: info.name.clone(),
                field: field.to_owned(),
            });
        }
        let key = primary_key_term(&info, fields)?;
        let params = params.merged_over(&self.default_params);
        Ok((
            NormalizedBatch::Assoc {
                schema: info.name,
                field: field.to_owned(),
                params,
                ctx: self.ctx.clone(),
            },
            key,
            Entry::Parent(record.clone()),
        ))
    }

    fn normalize_query(
        &self,
        batch: &BatchKey,
        schema: &str,
        cardinality: Option<Cardinality>,
        params: &QueryParams,
        item: &ItemKey,
    ) -> Result<(NormalizedBatch, Term, Entry), LoaderError> {
        let info = self
            .store
            .schema(schema)
            .map_err(|_| LoaderError::NotASchema(schema.to_owned()))?;
        let (column, value) = match item {
            ItemKey::Term(value) => (single_primary_key(&info)?.to_owned(), value.clone()),
            ItemKey::Column { column, value } => {
                let known = info.columns.contains_key(column)
                    || info.primary_key.iter().any(|pk| pk == column);
                if !known {
                    return Err(LoaderError::UnknownColumn {
                        schema: info.name.clone(),
                        column: column.clone(),
                    });
                }
                (column.clone(), value.clone())
            }
            ItemKey::Record(_) => {
                return Err(LoaderError::InvalidItemKey {
                    batch: batch.to_string(),
                    item: item.to_string(),
                })
            }
        };
        let is_primary = info.primary_key.len() == 1 && info.primary_key[0] == column;
        let cardinality = match (cardinality, is_primary) {
            (Some(cardinality), _) => cardinality,
            (None, true) => Cardinality::One,
            (None, false) => {
                return Err(LoaderError::CardinalityRequired {
                    schema: info.name.clone(),
                    column,
                })
            }
        };
        // best-effort cast so differently-typed forms of one key ("7"
        // and 7) share identity; a value the column type cannot
        // represent keeps its raw identity and fails its batch at run
        // time
        let value = match info.columns.get(&column) {
            Some(column_type) => column_type.coerce(value.clone()).unwrap_or(value),
            None => value,
        };
        let params = params.merged_over(&self.default_params);
        Ok((
            NormalizedBatch::Query {
                schema: info.name,
                cardinality,
                column,
                params,
                ctx: self.ctx.clone(),
            },
            value.clone(),
            Entry::Input(value),
        ))
    }
}

impl fmt::Debug for RelationalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalSource")
            .field("store", &self.store)
            .field("pending", &self.pending)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Source for RelationalSource {
    fn load(&mut self, batch: &BatchKey, item: &ItemKey) -> Result<(), LoaderError> {
        let (batch, key, entry) = self.normalize(batch, item)?;
        if !self.results.has_ok(&batch, &key) {
            self.pending.enqueue(batch, key, entry);
        }
        Ok(())
    }

    fn put(&mut self, batch: &BatchKey, item: &ItemKey, value: Value) -> Result<(), LoaderError> {
        let (batch, key, _) = self.normalize(batch, item)?;
        if is_not_loaded(&value) {
            return Ok(());
        }
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
            let store = Arc::clone(&self.store);
            let query_fn = self.query_fn.clone();
            let run_batch = Arc::clone(&self.run_batch);
            let store_options =
                StoreOptions { ctx: batch.ctx(), extra: self.store_options.extra.clone() };
            let unit_batch = batch.clone();
            let unit = async move {
                let timer = telemetry::batch_run_start(&unit_batch.to_string(), entries.len());
                let outcome =
                    execute_batch(store, query_fn, run_batch, store_options, unit_batch, entries)
                        .await;
                telemetry::batch_run_stop(timer);
                outcome
            };
            units.push((batch, unit));
        }
        let outcomes = if self.options.asynchronous {
            runner::run_parallel(units, runner_options).await
        } else {
            runner::run_sequential(units, runner_options).await
        };
        for (batch, outcome) in outcomes {
            match outcome {
                Ok(Ok(items)) => self.results.merge_loaded(batch, items),
                Ok(Err(error)) => self.results.fail_batch(batch, error),
                Err(unit_error) => self.results.fail_batch(batch, unit_error.into()),
            }
        }
        Ok(self)
    }

    fn fetch(&self, batch: &BatchKey, item: &ItemKey) -> Result<Value, LoadError> {
        let (batch, key, _) = self
            .normalize(batch, item)
            .map_err(|error| LoadError::BatchNotFound(error.to_string()))?;
        match self.results.lookup(&batch, &key) {
            Lookup::Hit(outcome) => outcome,
            Lookup::NoBatch => Err(LoadError::BatchNotFound(batch.to_string())),
            Lookup::NoItem => {
                Err(LoadError::ItemNotFound { batch: batch.to_string(), item: key.to_string() })
            }
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

async fn execute_batch(
    store: Arc<dyn Store>,
    query_fn: Option<Arc<QueryFn>>,
    run_batch: Arc<dyn RunBatch>,
    store_options: StoreOptions,
    batch: NormalizedBatch,
    entries: Vec<(Term, Entry)>,
) -> Result<HashMap<Term, Result<Value, LoadError>>, LoadError> {
    match batch {
        NormalizedBatch::Query { schema, cardinality, column, params, .. } => {
            execute_query_batch(
                store,
                query_fn,
                run_batch,
                store_options,
                schema,
                cardinality,
                column,
                params,
                entries,
            )
            .await
        }
        NormalizedBatch::Assoc { schema, field, params, .. } => {
            execute_assoc_batch(store, query_fn, store_options, schema, field, params, entries)
                .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_query_batch(
    store: Arc<dyn Store>,
    query_fn: Option<Arc<QueryFn>>,
    run_batch: Arc<dyn RunBatch>,
    store_options: StoreOptions,
    schema: String,
    cardinality: Cardinality,
    column: String,
    params: QueryParams,
    entries: Vec<(Term, Entry)>,
) -> Result<HashMap<Term, Result<Value, LoadError>>, LoadError> {
    let info = store.schema(&schema).map_err(|error| LoadError::Batch(error.to_string()))?;
    let inputs: Vec<Term> = entries.into_iter().map(|(key, _)| key).collect();
    let inputs = coerce_inputs(&info, &column, inputs)?;
    let query = shape(Query::from_params(&schema, &params), &query_fn, &params);
    let grouped = run_batch
        .run_batch(&*store, &query, &column, &inputs, &store_options)
        .await
        .map_err(|error| LoadError::Batch(error.to_string()))?;
    let mut by_input: HashMap<Term, Vec<Value>> = grouped.into_iter().collect();
    let mut items = HashMap::with_capacity(inputs.len());
    for input in inputs {
        let rows = by_input.remove(&input).unwrap_or_default();
        let outcome = map_cardinality(cardinality, &input, rows);
        items.insert(input, outcome);
    }
    Ok(items)
}

async fn execute_assoc_batch(
    store: Arc<dyn Store>,
    query_fn: Option<Arc<QueryFn>>,
    store_options: StoreOptions,
    schema: String,
    field: String,
    params: QueryParams,
    entries: Vec<(Term, Entry)>,
) -> Result<HashMap<Term, Result<Value, LoadError>>, LoadError> {
    let info = store.schema(&schema).map_err(|error| LoadError::Batch(error.to_string()))?;
    let links = resolve_links(&*store, &info, &field)?;
    let chain = links.len() > 1;
    let window_pushed = !chain
        && matches!(
            links.first().map(|(_, assoc)| assoc),
            Some(Association::HasMany { .. } | Association::HasOne { .. })
        );

    let mut per_parent: Vec<(Term, Vec<Value>)> = Vec::with_capacity(entries.len());
    for (key, entry) in entries {
        match entry {
            Entry::Parent(record) => per_parent.push((key, vec![record])),
            Entry::Input(_) => {
                return Err(LoadError::Batch("association batch without parent record".to_owned()))
            }
        }
    }

    for (index, (owner_info, assoc)) in links.iter().enumerate() {
        let last = index + 1 == links.len();
        let step_params = if last { params.clone() } else { QueryParams::default() };
        let push_window = last && window_pushed;

        // distinct current rows across parents, insertion-ordered
        let mut seen: HashSet<Term> = HashSet::new();
        let mut owners: Vec<Value> = Vec::new();
        for (_, current) in &per_parent {
            for row in current {
                if let Some(pk) = row_key(owner_info, row) {
                    if seen.insert(pk) {
                        owners.push(row.clone());
                    }
                }
            }
        }

        let children = fetch_children(
            &store,
            &query_fn,
            &store_options,
            owner_info,
            assoc,
            &owners,
            &step_params,
            push_window,
        )
        .await?;

        per_parent = per_parent
            .into_iter()
            .map(|(key, current)| {
                let mut next = Vec::new();
                for row in &current {
                    if let Some(pk) = row_key(owner_info, row) {
                        if let Some(kids) = children.get(&pk) {
                            next.extend(kids.iter().cloned());
                        }
                    }
                }
                (key, next)
            })
            .collect();
    }

    let cardinality = chain_cardinality(&links);
    let final_info = links
        .last()
        .map(|(_, assoc)| assoc_target(assoc))
        .and_then(|target| store.schema(target).ok());

    let mut items = HashMap::with_capacity(per_parent.len());
    for (key, mut rows) in per_parent {
        if chain {
            if let Some(info) = &final_info {
                let mut seen: HashSet<Term> = HashSet::new();
                rows.retain(|row| match row_key(info, row) {
                    Some(pk) => seen.insert(pk),
                    None => true,
                });
            }
        }
        if params.windowed() && !window_pushed {
            let offset = params.offset.unwrap_or(0) as usize;
            let limit = params.limit.map(|l| l as usize).unwrap_or(usize::MAX);
            rows = rows.into_iter().skip(offset).take(limit).collect();
        }
        let outcome = map_cardinality(cardinality, &key, rows);
        items.insert(key, outcome);
    }
    Ok(items)
}

/// Bulk-fetches the children of one association link for a distinct set
/// of owner rows, keyed by owner primary key.
#[allow(clippy::too_many_arguments)]
async fn fetch_children(
    store: &Arc<dyn Store>,
    query_fn: &Option<Arc<QueryFn>>,
    store_options: &StoreOptions,
    owner_info: &SchemaInfo,
    assoc: &Association,
    owners: &[Value],
    params: &QueryParams,
    push_window: bool,
) -> Result<HashMap<Term, Vec<Value>>, LoadError> {
    match assoc {
        Association::BelongsTo { schema, owner_key, related_key } => {
            let related_info =
                store.schema(schema).map_err(|error| LoadError::Batch(error.to_string()))?;
            let inputs =
                coerce_inputs(&related_info, related_key, distinct_field_terms(owners, owner_key))?;
            let query = shape(
                Query::from_params(schema, params).without_window(),
                query_fn,
                params,
            );
            let rows = store
                .all_by(&query, related_key, &inputs, store_options)
                .await
                .map_err(|error| LoadError::Batch(error.to_string()))?;
            let grouped = group_by_column(rows, related_key);
            collect_by_owner(owner_info, owners, owner_key, &grouped)
        }
        Association::HasOne { schema, owner_key, related_key, wheres }
        | Association::HasMany { schema, owner_key, related_key, wheres } => {
            let related_info =
                store.schema(schema).map_err(|error| LoadError::Batch(error.to_string()))?;
            let inputs =
                coerce_inputs(&related_info, related_key, distinct_field_terms(owners, owner_key))?;
            let mut query = Query::from_params(schema, params);
            query.filters.extend(wheres.iter().cloned());
            if !push_window {
                query = query.without_window();
            }
            let query = shape(query, query_fn, params);
            let grouped: HashMap<Term, Vec<Value>> = if push_window && query.windowed() {
                store
                    .lateral_by(&query, related_key, &inputs, store_options)
                    .await
                    .map_err(|error| LoadError::Batch(error.to_string()))?
                    .into_iter()
                    .collect()
            } else {
                let rows = store
                    .all_by(&query, related_key, &inputs, store_options)
                    .await
                    .map_err(|error| LoadError::Batch(error.to_string()))?;
                group_by_column(rows, related_key)
            };
            collect_by_owner(owner_info, owners, owner_key, &grouped)
        }
        Association::ManyToMany {
            schema,
            join_through,
            owner_join_key,
            related_join_key,
            wheres,
            join_wheres,
        } => {
            let target_info =
                store.schema(schema).map_err(|error| LoadError::Batch(error.to_string()))?;
            let target_key = single_primary_key(&target_info)
                .map_err(|error| LoadError::Batch(error.to_string()))?
                .to_owned();

            let mut junction_query = Query::new(join_through.clone());
            junction_query.filters.extend(join_wheres.iter().cloned());
            junction_query.filters.extend(params.join_filters.iter().cloned());

            let owner_keys: Vec<Term> =
                owners.iter().filter_map(|row| row_key(owner_info, row)).collect();
            let junction_rows = store
                .all_by(&junction_query, owner_join_key, &owner_keys, store_options)
                .await
                .map_err(|error| LoadError::Batch(error.to_string()))?;

            let related_ids = coerce_inputs(
                &target_info,
                &target_key,
                distinct_field_terms(&junction_rows, related_join_key),
            )?;
            let mut target_query = Query::from_params(schema, params).without_window();
            target_query.filters.extend(wheres.iter().cloned());
            let target_query = shape(target_query, query_fn, params);
            let target_rows = store
                .all_by(&target_query, &target_key, &related_ids, store_options)
                .await
                .map_err(|error| LoadError::Batch(error.to_string()))?;
            let index: HashMap<Term, Value> = target_rows
                .into_iter()
                .filter_map(|row| row_key(&target_info, &row).map(|pk| (pk, row)))
                .collect();

            let mut by_owner: HashMap<Term, Vec<Value>> = HashMap::new();
            for owner in owners {
                if let Some(pk) = row_key(owner_info, owner) {
                    by_owner.entry(pk).or_default();
                }
            }
            // junction row order drives per-owner child order
            for junction in &junction_rows {
                let owner = Term::from_value(junction.get(owner_join_key).unwrap_or(&Value::Null));
                let related =
                    Term::from_value(junction.get(related_join_key).unwrap_or(&Value::Null));
                if let (Some(owner), Some(related)) = (owner, related) {
                    if let Some(row) = index.get(&related) {
                        by_owner.entry(owner).or_default().push(row.clone());
                    }
                }
            }
            Ok(by_owner)
        }
        Association::Through { .. } => {
            Err(LoadError::Batch("nested through chain was not expanded".to_owned()))
        }
    }
}

/// Expands an association field into a chain of concrete links,
/// flattening `through` references via their owning schemas.
fn resolve_links(
    store: &dyn Store,
    info: &SchemaInfo,
    field: &str,
) -> Result<Vec<(SchemaInfo, Association)>, LoadError> {
    fn go(
        store: &dyn Store,
        info: &SchemaInfo,
        field: &str,
        depth: usize,
        out: &mut Vec<(SchemaInfo, Association)>,
    ) -> Result<(), LoadError> {
        if depth > 8 {
            return Err(LoadError::Batch(format!("association chain through {field} is too deep")));
        }
        let assoc = info.associations.get(field).ok_or_else(|| {
            LoadError::Batch(format!("schema {} has no association {field}", info.name))
        })?;
        match assoc {
            Association::Through { links } => {
                let mut current = info.clone();
                for link in links {
                    go(store, &current, link, depth + 1, out)?;
                    let target = out
                        .last()
                        .map(|(_, assoc)| assoc_target(assoc).to_owned())
                        .unwrap_or_default();
                    current = store
                        .schema(&target)
                        .map_err(|error| LoadError::Batch(error.to_string()))?;
                }
                Ok(())
            }
            other => {
                out.push((info.clone(), other.clone()));
                Ok(())
            }
        }
    }
    let mut links = Vec::new();
    go(store, info, field, 0, &mut links)?;
    Ok(links)
}

fn assoc_target(assoc: &Association) -> &str {
    match assoc {
        Association::BelongsTo { schema, .. }
        | Association::HasOne { schema, .. }
        | Association::HasMany { schema, .. }
        | Association::ManyToMany { schema, .. } => schema,
        Association::Through { .. } => "",
    }
}

fn chain_cardinality(links: &[(SchemaInfo, Association)]) -> Cardinality {
    let all_single = links.iter().all(|(_, assoc)| {
        matches!(assoc, Association::BelongsTo { .. } | Association::HasOne { .. })
    });
    if all_single {
        Cardinality::One
    } else {
        Cardinality::Many
    }
}

fn map_cardinality(
    cardinality: Cardinality,
    key: &Term,
    mut rows: Vec<Value>,
) -> Result<Value, LoadError> {
    match cardinality {
        Cardinality::Many => Ok(Value::Array(rows)),
        Cardinality::One => match rows.len() {
            0 => Ok(Value::Null),
            1 => Ok(rows.remove(0)),
            count => Err(LoadError::MultipleResults { key: key.to_string(), count }),
        },
    }
}

fn shape(query: Query, query_fn: &Option<Arc<QueryFn>>, params: &QueryParams) -> Query {
    match query_fn {
        Some(query_fn) => query_fn(query, params),
        None => query,
    }
}

fn single_primary_key(info: &SchemaInfo) -> Result<&str, LoaderError> {
    match info.primary_key.as_slice() {
        [column] => Ok(column),
        _ => Err(LoaderError::CompositePrimaryKey(info.name.clone())),
    }
}

fn primary_key_term(
    info: &SchemaInfo,
    fields: &serde_json::Map<String, Value>,
) -> Result<Term, LoaderError> {
    let mut parts = Vec::with_capacity(info.primary_key.len());
    for column in &info.primary_key {
        let field = fields.get(column).ok_or_else(|| {
            LoaderError::NotARecord(format!("record is missing primary key column {column}"))
        })?;
        let term = Term::from_value(field).ok_or_else(|| {
            LoaderError::NotARecord(format!("primary key column {column} is not a scalar"))
        })?;
        parts.push(term);
    }
    if parts.len() == 1 {
        Ok(parts.remove(0))
    } else {
        Ok(Term::List(parts))
    }
}

/// Primary key of a row, if the row carries all key columns.
fn row_key(info: &SchemaInfo, row: &Value) -> Option<Term> {
    let fields = row.as_object()?;
    let mut parts = Vec::with_capacity(info.primary_key.len());
    for column in &info.primary_key {
        parts.push(Term::from_value(fields.get(column)?)?);
    }
    if parts.len() == 1 {
        parts.pop()
    } else {
        Some(Term::List(parts))
    }
}

/// Casts every batch input through the declared type of the lookup
/// column before the query is dispatched. A cast failure is fatal for
/// the whole batch.
fn coerce_inputs(info: &SchemaInfo, column: &str, inputs: Vec<Term>) -> Result<Vec<Term>, LoadError> {
    let column_type = match info.columns.get(column) {
        Some(column_type) => *column_type,
        None => return Ok(inputs),
    };
    inputs
        .into_iter()
        .map(|input| {
            column_type.coerce(input.clone()).ok_or_else(|| LoadError::Cast {
                value: input.to_string(),
                column: column.to_owned(),
                column_type: column_type.name(),
            })
        })
        .collect()
}

/// Distinct non-null values of a field across rows, insertion-ordered.
fn distinct_field_terms(rows: &[Value], field: &str) -> Vec<Term> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for row in rows {
        if let Some(term) = Term::from_value(row.get(field).unwrap_or(&Value::Null)) {
            if term != Term::Null && seen.insert(term.clone()) {
                terms.push(term);
            }
        }
    }
    terms
}

fn group_by_column(rows: Vec<Value>, column: &str) -> HashMap<Term, Vec<Value>> {
    let mut grouped: HashMap<Term, Vec<Value>> = HashMap::new();
    for row in rows {
        if let Some(term) = Term::from_value(row.get(column).unwrap_or(&Value::Null)) {
            grouped.entry(term).or_default().push(row);
        }
    }
    grouped
}

/// Children per owner primary key: each owner's rows are the group
/// matching its join-column value.
fn collect_by_owner(
    owner_info: &SchemaInfo,
    owners: &[Value],
    owner_key: &str,
    grouped: &HashMap<Term, Vec<Value>>,
) -> Result<HashMap<Term, Vec<Value>>, LoadError> {
    let mut by_owner = HashMap::with_capacity(owners.len());
    for owner in owners {
        let pk = row_key(owner_info, owner).ok_or_else(|| {
            LoadError::Batch(format!("row of {} is missing its primary key", owner_info.name))
        })?;
        let join_value = Term::from_value(owner.get(owner_key).unwrap_or(&Value::Null));
        let rows = match join_value {
            Some(Term::Null) | None => Vec::new(),
            Some(value) => grouped.get(&value).cloned().unwrap_or_default(),
        };
        by_owner.insert(pk, rows);
    }
    Ok(by_owner)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.define(
            SchemaInfo::new("User")
                .column("name", ColumnType::Str)
                .has_many("posts", "Post", "user_id"),
        );
        store.define(SchemaInfo::new("Post").column("user_id", ColumnType::Int));
        store
    }

    fn source() -> RelationalSource {
        RelationalSource::new(store())
    }

    #[test]
    fn shorthand_on_primary_key_implies_cardinality_one() {
        let source = source();
        let (batch, key, _) = source
            .normalize(&BatchKey::schema("User"), &ItemKey::from(1))
            .unwrap();
        match batch {
            NormalizedBatch::Query { cardinality, column, .. } => {
                assert_eq!(cardinality, Cardinality::One);
                assert_eq!(column, "id");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(key, Term::Int(1));
    }

    #[test]
    fn shorthand_on_other_columns_requires_cardinality() {
        let source = source();
        let err = source
            .normalize(&BatchKey::schema("Post"), &ItemKey::col("user_id", 7))
            .unwrap_err();
        assert!(matches!(err, LoaderError::CardinalityRequired { .. }));
    }

    #[test]
    fn keys_are_cast_for_identity_where_possible() {
        let source = source();
        let (_, key, _) = source
            .normalize(&BatchKey::schema("User"), &ItemKey::from("7"))
            .unwrap();
        assert_eq!(key, Term::Int(7));
        // an uncastable value keeps its raw identity; the cast failure
        // surfaces at run time, fatally for its batch
        let (_, key, _) = source
            .normalize(&BatchKey::schema("User"), &ItemKey::from("seven"))
            .unwrap();
        assert_eq!(key, Term::from("seven"));
    }

    #[tokio::test]
    async fn cast_failures_are_fatal_for_the_batch() {
        let mut store = store();
        store.insert("User", json!({"id": 7, "name": "ada"})).unwrap();
        let mut source = RelationalSource::new(store);
        let batch = BatchKey::schema("User");
        source.load(&batch, &ItemKey::from(7)).unwrap();
        source.load(&batch, &ItemKey::from("seven")).unwrap();
        let source = Box::new(source).run().await.unwrap();
        // the uncastable key poisons the whole batch, siblings included
        assert!(matches!(
            source.fetch(&batch, &ItemKey::from(7)),
            Err(LoadError::Cast { .. })
        ));
        assert!(matches!(
            source.fetch(&batch, &ItemKey::from("seven")),
            Err(LoadError::Cast { .. })
        ));
    }

    #[test]
    fn association_items_must_be_tagged_records() {
        let mut source = source();
        let record = json!({"__schema__": "User", "id": 1});
        assert!(source.load(&BatchKey::assoc("posts"), &ItemKey::record(record)).is_ok());
        let err = source
            .load(&BatchKey::assoc("posts"), &ItemKey::from(1))
            .unwrap_err();
        assert!(matches!(err, LoaderError::NotARecord(_)));
        let untagged = json!({"id": 1});
        let err = source
            .load(&BatchKey::assoc("posts"), &ItemKey::record(untagged))
            .unwrap_err();
        assert!(matches!(err, LoaderError::NotARecord(_)));
    }

    #[test]
    fn unknown_association_fails_at_the_call_site() {
        let mut source = source();
        let record = json!({"__schema__": "User", "id": 1});
        let err = source
            .load(&BatchKey::assoc("nonsense"), &ItemKey::record(record))
            .unwrap_err();
        assert!(matches!(err, LoaderError::UnknownField { .. }));
    }

    #[test]
    fn kv_batch_keys_are_rejected() {
        let mut source = source();
        let err = source.load(&BatchKey::term("users"), &ItemKey::from(1)).unwrap_err();
        assert!(matches!(err, LoaderError::UnsupportedBatch { source_name: "relational", .. }));
    }

    #[test]
    fn put_refuses_the_not_loaded_placeholder() {
        let mut source = source();
        let record = json!({"__schema__": "User", "id": 1});
        let batch = BatchKey::assoc("posts");
        source.put(&batch, &ItemKey::record(record.clone()), not_loaded("posts")).unwrap();
        assert!(matches!(
            source.fetch(&batch, &ItemKey::record(record)),
            Err(LoadError::BatchNotFound(_))
        ));
    }

    #[test]
    fn differing_params_split_batches() {
        let mut source = source();
        let record = json!({"__schema__": "User", "id": 1});
        let limited = BatchKey::assoc("posts").params(QueryParams::new().limit(1));
        source.load(&BatchKey::assoc("posts"), &ItemKey::record(record.clone())).unwrap();
        source.load(&limited, &ItemKey::record(record)).unwrap();
        assert_eq!(source.pending.drain().len(), 2);
    }
}
