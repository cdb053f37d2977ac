use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::key::{Direction, OrderBy, Term};

use super::query::Query;
use super::store::{SchemaInfo, Store, StoreOptions};
use super::SCHEMA_KEY;

/// In-memory reference [`Store`]: schemas plus row tables of
/// `serde_json` objects. Meant for tests, demos, and cache warming
/// pipelines that have no real store behind them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    schemas: HashMap<String, SchemaInfo>,
    tables: HashMap<String, Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema and its (empty) row table.
    pub fn define(&mut self, schema: SchemaInfo) -> &mut Self {
        self.tables.entry(schema.name.clone()).or_default();
        self.schemas.insert(schema.name.clone(), schema);
        self
    }

    /// Inserts a row, stamping it with the schema tag parent-record
    /// item keys rely on.
    pub fn insert(&mut self, schema: &str, row: Value) -> Result<Value, StoreError> {
        if !self.schemas.contains_key(schema) {
            return Err(StoreError::UnknownSchema(schema.to_owned()));
        }
        let mut row = match row {
            Value::Object(fields) => fields,
            other => return Err(StoreError::Query(format!("row must be an object, got {other}"))),
        };
        row.insert(SCHEMA_KEY.to_owned(), Value::String(schema.to_owned()));
        let row = Value::Object(row);
        self.tables.entry(schema.to_owned()).or_default().push(row.clone());
        Ok(row)
    }

    fn rows(&self, schema: &str) -> Result<&[Value], StoreError> {
        self.tables
            .get(schema)
            .map(Vec::as_slice)
            .ok_or_else(|| StoreError::UnknownSchema(schema.to_owned()))
    }

    fn select(&self, query: &Query, column: &str, input: &Term) -> Result<Vec<Value>, StoreError> {
        let mut rows: Vec<Value> = self
            .rows(&query.schema)?
            .iter()
            .filter(|row| input.matches(row.get(column).unwrap_or(&Value::Null)))
            .filter(|row| matches_filters(row, &query.filters))
            .cloned()
            .collect();
        order_rows(&mut rows, &query.order_by);
        Ok(window(rows, query.limit, query.offset))
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn schema(&self, name: &str) -> Result<SchemaInfo, StoreError> {
        self.schemas.get(name).cloned().ok_or_else(|| StoreError::UnknownSchema(name.to_owned()))
    }

    async fn all_by(
        &self,
        query: &Query,
        column: &str,
        inputs: &[Term],
        _options: &StoreOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let mut rows: Vec<Value> = self
            .rows(&query.schema)?
            .iter()
            .filter(|row| {
                let field = row.get(column).unwrap_or(&Value::Null);
                inputs.iter().any(|input| input.matches(field))
            })
            .filter(|row| matches_filters(row, &query.filters))
            .cloned()
            .collect();
        order_rows(&mut rows, &query.order_by);
        Ok(window(rows, query.limit, query.offset))
    }

    async fn lateral_by(
        &self,
        query: &Query,
        column: &str,
        inputs: &[Term],
        _options: &StoreOptions,
    ) -> Result<Vec<(Term, Vec<Value>)>, StoreError> {
        inputs
            .iter()
            .map(|input| self.select(query, column, input).map(|rows| (input.clone(), rows)))
            .collect()
    }
}

fn matches_filters(row: &Value, filters: &[(String, Term)]) -> bool {
    filters.iter().all(|(column, value)| value.matches(row.get(column).unwrap_or(&Value::Null)))
}

fn order_rows(rows: &mut [Value], order_by: &[OrderBy]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for order in order_by {
            let left = a.get(&order.column).unwrap_or(&Value::Null);
            let right = b.get(&order.column).unwrap_or(&Value::Null);
            let ordering = match order.direction {
                Direction::Asc => cmp_values(left, right),
                Direction::Desc => cmp_values(right, left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn window(rows: Vec<Value>, limit: Option<u64>, offset: Option<u64>) -> Vec<Value> {
    let offset = offset.unwrap_or(0) as usize;
    let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    rows.into_iter().skip(offset).take(limit).collect()
}

/// Total order over JSON scalars: null < bool < number < string; other
/// shapes compare by their rendering.
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::store::ColumnType;
    use super::*;

    fn store_with_posts() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.define(
            SchemaInfo::new("Post")
                .column("user_id", ColumnType::Int)
                .column("title", ColumnType::Str),
        );
        store.insert("Post", json!({"id": 1, "user_id": 7, "title": "b"})).unwrap();
        store.insert("Post", json!({"id": 2, "user_id": 7, "title": "a"})).unwrap();
        store.insert("Post", json!({"id": 3, "user_id": 8, "title": "c"})).unwrap();
        store
    }

    #[tokio::test]
    async fn all_by_filters_on_the_lookup_column() {
        let store = store_with_posts();
        let query = Query::new("Post");
        let rows = store
            .all_by(&query, "user_id", &[Term::Int(7)], &StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn all_by_applies_order_and_window_globally() {
        let store = store_with_posts();
        let query = Query::new("Post").order_asc("title").limit(2);
        let rows = store
            .all_by(&query, "user_id", &[Term::Int(7), Term::Int(8)], &StoreOptions::default())
            .await
            .unwrap();
        let titles: Vec<_> = rows.iter().map(|r| r["title"].clone()).collect();
        assert_eq!(titles, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn lateral_by_applies_window_per_input() {
        let store = store_with_posts();
        let query = Query::new("Post").order_asc("id").limit(1);
        let grouped = store
            .lateral_by(&query, "user_id", &[Term::Int(7), Term::Int(8)], &StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].1.len(), 1);
        assert_eq!(grouped[0].1[0]["id"], json!(1));
        assert_eq!(grouped[1].1.len(), 1);
    }

    #[tokio::test]
    async fn rows_are_stamped_with_their_schema() {
        let store = store_with_posts();
        let query = Query::new("Post");
        let rows = store
            .all_by(&query, "id", &[Term::Int(1)], &StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(rows[0]["__schema__"], json!("Post"));
    }
}
