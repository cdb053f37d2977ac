use std::fmt;

use serde_json::Value;

/// Scalar key value used for batch identifiers, item keys, and query
/// parameters.
///
/// Keys index pending-batch and result tables, so they need `Eq`, `Ord`
/// and `Hash`; floating point values are deliberately not representable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Composite key, e.g. the primary key of a schema with more than
    /// one key column.
    List(Vec<Term>),
}

impl Term {
    pub fn to_value(&self) -> Value {
        match self {
            Term::Null => Value::Null,
            Term::Bool(b) => Value::Bool(*b),
            Term::Int(i) => Value::from(*i),
            Term::Str(s) => Value::String(s.clone()),
            Term::List(items) => Value::Array(items.iter().map(Term::to_value).collect()),
        }
    }

    /// Converts a JSON scalar back into a key. Fractional numbers and
    /// objects have no key representation.
    pub fn from_value(value: &Value) -> Option<Term> {
        match value {
            Value::Null => Some(Term::Null),
            Value::Bool(b) => Some(Term::Bool(*b)),
            Value::Number(n) => n.as_i64().map(Term::Int),
            Value::String(s) => Some(Term::Str(s.clone())),
            Value::Array(items) => {
                items.iter().map(Term::from_value).collect::<Option<Vec<_>>>().map(Term::List)
            }
            Value::Object(_) => None,
        }
    }

    /// Whether this key identifies the given row field value.
    pub fn matches(&self, value: &Value) -> bool {
        self.to_value() == *value
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Null => f.write_str("nil"),
            Term::Bool(b) => write!(f, "{b}"),
            Term::Int(i) => write!(f, "{i}"),
            Term::Str(s) => write!(f, "{s:?}"),
            Term::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Int(value)
    }
}

impl From<i32> for Term {
    fn from(value: i32) -> Self {
        Term::Int(value as i64)
    }
}

impl From<bool> for Term {
    fn from(value: bool) -> Self {
        Term::Bool(value)
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::Str(value.to_owned())
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Term::Str(value)
    }
}

impl From<Vec<Term>> for Term {
    fn from(value: Vec<Term>) -> Self {
        Term::List(value)
    }
}

/// Expected result shape of a relational batch: a single record or a
/// list of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

/// Per-call query parameters. Part of batch identity: two loads with
/// different params land in different batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryParams {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub order_by: Vec<OrderBy>,
    /// Equality filters on the target queryable.
    pub filters: Vec<(String, Term)>,
    /// Equality filters on the junction entity of a many-to-many link.
    pub join_filters: Vec<(String, Term)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy { column: column.into(), direction: Direction::Asc });
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy { column: column.into(), direction: Direction::Desc });
        self
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Term>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn join_filter(mut self, column: impl Into<String>, value: impl Into<Term>) -> Self {
        self.join_filters.push((column.into(), value.into()));
        self
    }

    /// Merges these params over source defaults. Per-call values win
    /// field-wise; filters are overridden per column. The result is
    /// normalized (sorted filters) so that equal merges hash equally.
    pub(crate) fn merged_over(&self, defaults: &QueryParams) -> QueryParams {
        let mut filters = defaults.filters.clone();
        for (column, value) in &self.filters {
            filters.retain(|(c, _)| c != column);
            filters.push((column.clone(), value.clone()));
        }
        filters.sort();
        let mut join_filters = defaults.join_filters.clone();
        for (column, value) in &self.join_filters {
            join_filters.retain(|(c, _)| c != column);
            join_filters.push((column.clone(), value.clone()));
        }
        join_filters.sort();
        QueryParams {
            limit: self.limit.or(defaults.limit),
            offset: self.offset.or(defaults.offset),
            order_by: if self.order_by.is_empty() {
                defaults.order_by.clone()
            } else {
                self.order_by.clone()
            },
            filters,
            join_filters,
        }
    }

    pub(crate) fn windowed(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }
}

/// Selects the bulk fetch strategy a load request is grouped under.
///
/// `Term` is the opaque batch identifier of key/value sources. The
/// other variants are interpreted by the relational source: a declared
/// association on the item's schema, or a schema query with an explicit
/// or implied cardinality. The shorthand form (`cardinality: None`) is
/// admissible only when the item key resolves to the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchKey {
    Term(Term),
    Assoc { field: String, params: QueryParams },
    Query { schema: String, cardinality: Option<Cardinality>, params: QueryParams },
}

impl BatchKey {
    pub fn term(value: impl Into<Term>) -> Self {
        BatchKey::Term(value.into())
    }

    /// Batch on a declared association of the parent record's schema.
    pub fn assoc(field: impl Into<String>) -> Self {
        BatchKey::Assoc { field: field.into(), params: QueryParams::default() }
    }

    /// Batch expecting a single record per item key.
    pub fn one(schema: impl Into<String>) -> Self {
        BatchKey::Query {
            schema: schema.into(),
            cardinality: Some(Cardinality::One),
            params: QueryParams::default(),
        }
    }

    /// Batch expecting a list of records per item key.
    pub fn many(schema: impl Into<String>) -> Self {
        BatchKey::Query {
            schema: schema.into(),
            cardinality: Some(Cardinality::Many),
            params: QueryParams::default(),
        }
    }

    /// Shorthand schema batch; equivalent to [`BatchKey::one`] when the
    /// item key resolves to the primary key.
    pub fn schema(schema: impl Into<String>) -> Self {
        BatchKey::Query { schema: schema.into(), cardinality: None, params: QueryParams::default() }
    }

    pub fn params(mut self, new_params: QueryParams) -> Self {
        match &mut self {
            BatchKey::Term(_) => {}
            BatchKey::Assoc { params, .. } | BatchKey::Query { params, .. } => {
                *params = new_params;
            }
        }
        self
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKey::Term(t) => write!(f, "{t}"),
            BatchKey::Assoc { field, .. } => write!(f, "assoc {field}"),
            BatchKey::Query { schema, cardinality: Some(Cardinality::One), .. } => {
                write!(f, "one {schema}")
            }
            BatchKey::Query { schema, cardinality: Some(Cardinality::Many), .. } => {
                write!(f, "many {schema}")
            }
            BatchKey::Query { schema, cardinality: None, .. } => write!(f, "{schema}"),
        }
    }
}

impl From<&str> for BatchKey {
    fn from(value: &str) -> Self {
        BatchKey::term(value)
    }
}

impl From<Term> for BatchKey {
    fn from(value: Term) -> Self {
        BatchKey::Term(value)
    }
}

/// Per-item lookup value within a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKey {
    /// Plain value; resolves to the primary key for schema batches.
    Term(Term),
    /// Explicit `(column, value)` pair. Non-primary-key columns require
    /// an explicit batch cardinality.
    Column { column: String, value: Term },
    /// Full parent record; only meaningful for association batches.
    Record(Value),
}

impl ItemKey {
    pub fn col(column: impl Into<String>, value: impl Into<Term>) -> Self {
        ItemKey::Column { column: column.into(), value: value.into() }
    }

    pub fn record(record: Value) -> Self {
        ItemKey::Record(record)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Term(t) => write!(f, "{t}"),
            ItemKey::Column { column, value } => write!(f, "{column}={value}"),
            ItemKey::Record(_) => f.write_str("record"),
        }
    }
}

impl From<Term> for ItemKey {
    fn from(value: Term) -> Self {
        ItemKey::Term(value)
    }
}

impl From<i64> for ItemKey {
    fn from(value: i64) -> Self {
        ItemKey::Term(Term::Int(value))
    }
}

impl From<i32> for ItemKey {
    fn from(value: i32) -> Self {
        ItemKey::Term(Term::Int(value as i64))
    }
}

impl From<&str> for ItemKey {
    fn from(value: &str) -> Self {
        ItemKey::Term(Term::from(value))
    }
}

impl From<String> for ItemKey {
    fn from(value: String) -> Self {
        ItemKey::Term(Term::Str(value))
    }
}

impl From<Value> for ItemKey {
    fn from(value: Value) -> Self {
        ItemKey::Record(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_merge_prefers_call_site() {
        let defaults = QueryParams::new().limit(10).filter("tenant", 1).order_asc("id");
        let params = QueryParams::new().limit(1).filter("tenant", 2);
        let merged = params.merged_over(&defaults);
        assert_eq!(merged.limit, Some(1));
        assert_eq!(merged.filters, vec![("tenant".to_owned(), Term::Int(2))]);
        // order_by falls back to the default when the call site is silent
        assert_eq!(merged.order_by.len(), 1);
    }

    #[test]
    fn params_merge_is_order_insensitive() {
        let defaults = QueryParams::default();
        let a = QueryParams::new().filter("a", 1).filter("b", 2).merged_over(&defaults);
        let b = QueryParams::new().filter("b", 2).filter("a", 1).merged_over(&defaults);
        assert_eq!(a, b);
    }

    #[test]
    fn term_round_trips_through_json() {
        let term = Term::List(vec![Term::Int(1), Term::Str("x".into())]);
        assert_eq!(Term::from_value(&term.to_value()), Some(term));
        assert_eq!(Term::from_value(&serde_json::json!(1.5)), None);
    }

    #[test]
    fn term_matches_row_fields() {
        assert!(Term::Int(7).matches(&serde_json::json!(7)));
        assert!(!Term::Int(7).matches(&serde_json::json!("7")));
    }
}
