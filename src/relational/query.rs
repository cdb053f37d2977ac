use crate::key::{Direction, OrderBy, QueryParams, Term};

/// Query handed to the store: the target queryable plus the shaping
/// folded in from batch params (and the user's `query_fn`, if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub schema: String,
    /// Equality filters on the target.
    pub filters: Vec<(String, Term)>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Query {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub(crate) fn from_params(schema: &str, params: &QueryParams) -> Self {
        Self {
            schema: schema.to_owned(),
            filters: params.filters.clone(),
            order_by: params.order_by.clone(),
            limit: params.limit,
            offset: params.offset,
        }
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Term>) -> Self {
        self.filters.push((column.into(), value.into()));
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

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a limit or offset is set, which forces the per-input
    /// lateral strategy.
    pub fn windowed(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// Drops the window, for strategies that apply it per input
    /// elsewhere.
    pub(crate) fn without_window(mut self) -> Self {
        self.limit = None;
        self.offset = None;
        self
    }
}
