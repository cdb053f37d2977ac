use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::key::Term;

use super::query::Query;

/// Column types the source coerces item-key inputs through before
/// dispatching a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Integer surrogate key.
    Id,
    Int,
    Str,
    Bool,
}

impl ColumnType {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ColumnType::Id => "id",
            ColumnType::Int => "integer",
            ColumnType::Str => "string",
            ColumnType::Bool => "boolean",
        }
    }

    /// Casts a key through the column type. `None` means the value has
    /// no representation in the type.
    pub(crate) fn coerce(self, term: Term) -> Option<Term> {
        match (self, term) {
            (ColumnType::Id | ColumnType::Int, Term::Int(i)) => Some(Term::Int(i)),
            (ColumnType::Id | ColumnType::Int, Term::Str(s)) => {
                s.trim().parse::<i64>().ok().map(Term::Int)
            }
            (ColumnType::Str, Term::Str(s)) => Some(Term::Str(s)),
            (ColumnType::Str, Term::Int(i)) => Some(Term::Str(i.to_string())),
            (ColumnType::Bool, Term::Bool(b)) => Some(Term::Bool(b)),
            (ColumnType::Bool, Term::Str(s)) => match s.as_str() {
                "true" => Some(Term::Bool(true)),
                "false" => Some(Term::Bool(false)),
                _ => None,
            },
            (_, Term::Null) => Some(Term::Null),
            _ => None,
        }
    }
}

/// Declared association between two schemas.
///
/// `owner_key`/`related_key` name the join columns on the owning and
/// related side. `wheres` are fixed equality filters on the related
/// queryable; `join_wheres` filter the junction entity of a
/// many-to-many link.
#[derive(Debug, Clone)]
pub enum Association {
    BelongsTo {
        schema: String,
        /// Foreign-key column on the owning record.
        owner_key: String,
        related_key: String,
    },
    HasOne {
        schema: String,
        owner_key: String,
        related_key: String,
        wheres: Vec<(String, Term)>,
    },
    HasMany {
        schema: String,
        owner_key: String,
        related_key: String,
        wheres: Vec<(String, Term)>,
    },
    ManyToMany {
        schema: String,
        join_through: String,
        /// Junction column referencing the owning record.
        owner_join_key: String,
        /// Junction column referencing the related record.
        related_join_key: String,
        wheres: Vec<(String, Term)>,
        join_wheres: Vec<(String, Term)>,
    },
    /// `has_many ... through ...`: a chain of association fields
    /// traversed link by link.
    Through { links: Vec<String> },
}

/// Schema metadata consumed during key normalization and batch runs.
#[derive(Debug, Clone)]
pub struct SchemaInfo {
    pub name: String,
    pub primary_key: Vec<String>,
    pub columns: BTreeMap<String, ColumnType>,
    pub associations: BTreeMap<String, Association>,
}

impl SchemaInfo {
    /// Fresh schema with an `id` primary key.
    pub fn new(name: impl Into<String>) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_owned(), ColumnType::Id);
        Self {
            name: name.into(),
            primary_key: vec!["id".to_owned()],
            columns,
            associations: BTreeMap::new(),
        }
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    pub fn belongs_to(
        self,
        field: impl Into<String>,
        schema: impl Into<String>,
        owner_key: impl Into<String>,
    ) -> Self {
        let assoc = Association::BelongsTo {
            schema: schema.into(),
            owner_key: owner_key.into(),
            related_key: "id".to_owned(),
        };
        self.assoc(field, assoc)
    }

    pub fn has_one(
        self,
        field: impl Into<String>,
        schema: impl Into<String>,
        related_key: impl Into<String>,
    ) -> Self {
        let assoc = Association::HasOne {
            schema: schema.into(),
            owner_key: "id".to_owned(),
            related_key: related_key.into(),
            wheres: Vec::new(),
        };
        self.assoc(field, assoc)
    }

    pub fn has_many(
        self,
        field: impl Into<String>,
        schema: impl Into<String>,
        related_key: impl Into<String>,
    ) -> Self {
        let assoc = Association::HasMany {
            schema: schema.into(),
            owner_key: "id".to_owned(),
            related_key: related_key.into(),
            wheres: Vec::new(),
        };
        self.assoc(field, assoc)
    }

    pub fn many_to_many(
        self,
        field: impl Into<String>,
        schema: impl Into<String>,
        join_through: impl Into<String>,
        owner_join_key: impl Into<String>,
        related_join_key: impl Into<String>,
    ) -> Self {
        let assoc = Association::ManyToMany {
            schema: schema.into(),
            join_through: join_through.into(),
            owner_join_key: owner_join_key.into(),
            related_join_key: related_join_key.into(),
            wheres: Vec::new(),
            join_wheres: Vec::new(),
        };
        self.assoc(field, assoc)
    }

    pub fn through(self, field: impl Into<String>, links: &[&str]) -> Self {
        let assoc = Association::Through { links: links.iter().map(|l| (*l).to_owned()).collect() };
        self.assoc(field, assoc)
    }

    /// Registers an association verbatim, for shapes the convenience
    /// builders do not cover (fixed `where` filters and the like).
    pub fn assoc(mut self, field: impl Into<String>, assoc: Association) -> Self {
        self.associations.insert(field.into(), assoc);
        self
    }
}

/// Opaque options forwarded to every store call. `ctx` is the execution
/// context token captured when the batch key was normalized and
/// re-asserted at run time (e.g. for connection pinning).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOptions {
    pub ctx: Option<Term>,
    pub extra: Vec<(String, Term)>,
}

/// Consumed contract of the backing relational store. The source never
/// builds SQL itself; it expresses every batch through these two fetch
/// shapes plus schema introspection.
#[async_trait]
pub trait Store: fmt::Debug + Send + Sync {
    fn schema(&self, name: &str) -> Result<SchemaInfo, StoreError>;

    /// Rows of the query's target where `column IN inputs`, with the
    /// query's filters, order, and window applied globally.
    async fn all_by(
        &self,
        query: &Query,
        column: &str,
        inputs: &[Term],
        options: &StoreOptions,
    ) -> Result<Vec<Value>, StoreError>;

    /// Per-input subquery: the query's window applies per input rather
    /// than globally. The returned pairs preserve input order.
    async fn lateral_by(
        &self,
        query: &Query,
        column: &str,
        inputs: &[Term],
        options: &StoreOptions,
    ) -> Result<Vec<(Term, Vec<Value>)>, StoreError>;
}

/// User override of the default schema-query batch loader. Must be pure
/// with respect to loader state.
#[async_trait]
pub trait RunBatch: Send + Sync {
    /// Returns, for each input (in input order), the ordered list of
    /// matching rows.
    async fn run_batch(
        &self,
        store: &dyn Store,
        query: &Query,
        column: &str,
        inputs: &[Term],
        options: &StoreOptions,
    ) -> Result<Vec<(Term, Vec<Value>)>, StoreError>;
}

/// Default loader strategy: `IN`-batched fetch grouped by the lookup
/// column, or the lateral variant when the query carries a window so
/// limits apply per input rather than globally.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRunBatch;

#[async_trait]
impl RunBatch for DefaultRunBatch {
    async fn run_batch(
        &self,
        store: &dyn Store,
        query: &Query,
        column: &str,
        inputs: &[Term],
        options: &StoreOptions,
    ) -> Result<Vec<(Term, Vec<Value>)>, StoreError> {
        if query.windowed() {
            return store.lateral_by(query, column, inputs, options).await;
        }
        let rows = store.all_by(query, column, inputs, options).await?;
        let mut grouped: Vec<(Term, Vec<Value>)> =
            inputs.iter().map(|input| (input.clone(), Vec::new())).collect();
        for row in rows {
            let field = row.get(column).cloned().unwrap_or(Value::Null);
            if let Some(position) = grouped.iter().position(|(input, _)| input.matches(&field)) {
                grouped[position].1.push(row);
            }
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_casts_strings_to_ids() {
        assert_eq!(ColumnType::Id.coerce(Term::from("7")), Some(Term::Int(7)));
        assert_eq!(ColumnType::Id.coerce(Term::from("abc")), None);
        assert_eq!(ColumnType::Str.coerce(Term::Int(7)), Some(Term::from("7")));
        assert_eq!(ColumnType::Bool.coerce(Term::from("true")), Some(Term::Bool(true)));
    }

    #[test]
    fn schema_builder_registers_columns_and_associations() {
        let schema = SchemaInfo::new("User")
            .column("name", ColumnType::Str)
            .has_many("posts", "Post", "user_id");
        assert_eq!(schema.primary_key, vec!["id".to_owned()]);
        assert!(schema.columns.contains_key("name"));
        assert!(matches!(schema.associations.get("posts"), Some(Association::HasMany { .. })));
    }
}
