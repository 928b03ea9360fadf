//! Schema graph: tables, columns, and declared relations.
//!
//! The graph is built once at process start and treated as immutable
//! thereafter; compilation and planning only ever read it, so no
//! coordination is needed between concurrent callers.

use crate::error::{OrmError, OrmResult};
use crate::fragment::Decoder;
use crate::value::SqlValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Semantic column type. Drives value decoding, not storage DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Json,
    Uuid,
    Timestamp,
    Date,
}

/// A runtime value generator (e.g. `updated_at` touch functions).
#[derive(Clone)]
pub struct Generator(Arc<dyn Fn() -> SqlValue + Send + Sync>);

impl Generator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> SqlValue + Send + Sync + 'static,
    {
        Generator(Arc::new(f))
    }

    pub fn produce(&self) -> SqlValue {
        (self.0)()
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Generator").field(&"<fn>").finish()
    }
}

/// Where an implicit column value comes from.
#[derive(Debug, Clone)]
pub enum ValueSource {
    /// A static value.
    Value(SqlValue),
    /// A raw SQL expression (e.g. `now()`).
    Expr(String),
    /// A value produced at statement-build time.
    Generated(Generator),
}

/// A column declaration.
#[derive(Debug, Clone)]
pub struct Column {
    /// Logical (schema) name, used as the output key.
    pub name: String,
    /// Physical name in the database; differs from `name` under a casing
    /// strategy.
    pub sql_name: String,
    pub ty: ColumnType,
    /// Identity/auto-increment columns are excluded from insert column lists
    /// unless a value is supplied explicitly.
    pub insert_disabled: bool,
    pub default: Option<ValueSource>,
    pub on_update: Option<ValueSource>,
    pub decoder: Option<Decoder>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        let name = name.into();
        Self {
            sql_name: name.clone(),
            name,
            ty,
            insert_disabled: false,
            default: None,
            on_update: None,
            decoder: None,
        }
    }

    /// Set a physical name different from the logical one.
    pub fn sql_name(mut self, sql_name: impl Into<String>) -> Self {
        self.sql_name = sql_name.into();
        self
    }

    /// Mark as identity/auto-increment (insert-disabled).
    pub fn identity(mut self) -> Self {
        self.insert_disabled = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<SqlValue>) -> Self {
        self.default = Some(ValueSource::Value(value.into()));
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(ValueSource::Expr(expr.into()));
        self
    }

    pub fn default_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> SqlValue + Send + Sync + 'static,
    {
        self.default = Some(ValueSource::Generated(Generator::new(f)));
        self
    }

    pub fn on_update_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> SqlValue + Send + Sync + 'static,
    {
        self.on_update = Some(ValueSource::Generated(Generator::new(f)));
        self
    }

    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Some(decoder);
        self
    }
}

/// A table declaration: ordered columns under an optional schema.
#[derive(Debug, Clone)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Finish building; tables are shared read-only from here on.
    pub fn build(self) -> Arc<Table> {
        Arc::new(self)
    }

    /// Look a column up by logical name.
    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `schema.table` path for identifier quoting.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(s) => format!("{s}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Relation cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    One,
    Many,
}

/// A declared association between two tables' column sets, used for eager
/// loading. `fields` are columns on the source table, matched by equality
/// against `references` on the target table.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub source: String,
    pub target: String,
    pub fields: Vec<String>,
    pub references: Vec<String>,
}

impl Relation {
    pub fn one(
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::One,
            source: source.into(),
            target: target.into(),
            fields: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn many(
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::Many,
            source: source.into(),
            target: target.into(),
            fields: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Add one field↔reference column pair.
    pub fn on(mut self, field: impl Into<String>, reference: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self.references.push(reference.into());
        self
    }
}

/// The full schema graph. Cyclic schemas are legal; query nesting is bounded
/// by the selection spec's literal `with` depth, not by the graph.
#[derive(Debug, Default)]
pub struct Schema {
    tables: BTreeMap<String, Arc<Table>>,
    relations: BTreeMap<String, Vec<Relation>>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn table(&self, name: &str) -> OrmResult<&Arc<Table>> {
        self.tables
            .get(name)
            .ok_or_else(|| OrmError::validation(format!("unknown table '{name}'")))
    }

    pub fn relations_of(&self, table: &str) -> &[Relation] {
        self.relations.get(table).map_or(&[], Vec::as_slice)
    }

    pub fn relation(&self, table: &str, name: &str) -> Option<&Relation> {
        self.relations_of(table).iter().find(|r| r.name == name)
    }
}

/// Builds and validates a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: Vec<Arc<Table>>,
    relations: Vec<Relation>,
}

impl SchemaBuilder {
    pub fn table(mut self, table: Arc<Table>) -> Self {
        self.tables.push(table);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Validate endpoints and column pairs, then freeze the graph.
    pub fn build(self) -> OrmResult<Schema> {
        let mut schema = Schema::default();
        for table in self.tables {
            if schema.tables.contains_key(&table.name) {
                return Err(OrmError::validation(format!(
                    "duplicate table '{}'",
                    table.name
                )));
            }
            schema.tables.insert(table.name.clone(), table);
        }

        for rel in self.relations {
            let source = schema.table(&rel.source)?.clone();
            let target = schema.table(&rel.target)?.clone();
            if rel.fields.is_empty() || rel.fields.len() != rel.references.len() {
                return Err(OrmError::validation(format!(
                    "relation '{}' on '{}' must pair at least one field with a reference",
                    rel.name, rel.source
                )));
            }
            for field in &rel.fields {
                if source.column_by_name(field).is_none() {
                    return Err(OrmError::validation(format!(
                        "relation '{}': column '{}' not declared on '{}'",
                        rel.name, field, rel.source
                    )));
                }
            }
            for reference in &rel.references {
                if target.column_by_name(reference).is_none() {
                    return Err(OrmError::validation(format!(
                        "relation '{}': column '{}' not declared on '{}'",
                        rel.name, reference, rel.target
                    )));
                }
            }
            let slot = schema.relations.entry(rel.source.clone()).or_default();
            if slot.iter().any(|r| r.name == rel.name) {
                return Err(OrmError::validation(format!(
                    "duplicate relation '{}' on '{}'",
                    rel.name, rel.source
                )));
            }
            slot.push(rel);
        }

        Ok(schema)
    }
}
