//! Plain-data statement configurations.
//!
//! These are the compiler's input contract: statement builders collect user
//! configuration into these shapes and hand them over by value at
//! compile/execute time. No behavior lives here.

use crate::expr::{Expr, OrderBy, Predicate};
use crate::fragment::Fragment;
use crate::schema::Table;
use crate::value::SqlValue;
use std::sync::Arc;

/// The base relation of a SELECT, or a join target.
#[derive(Debug, Clone)]
pub enum FromTarget {
    /// A bare table.
    Table(Arc<Table>),
    /// A table under an alias (`schema.table alias`).
    AliasedTable { table: Arc<Table>, alias: String },
    /// A derived table.
    Subquery {
        select: Box<SelectConfig>,
        alias: String,
    },
    /// Raw SQL (views, table functions).
    Raw {
        fragment: Fragment,
        alias: Option<String>,
    },
}

impl FromTarget {
    /// The name this target contributes to the query's reference scope.
    pub fn scope_name(&self) -> Option<&str> {
        match self {
            FromTarget::Table(t) => Some(&t.name),
            FromTarget::AliasedTable { alias, .. } => Some(alias),
            FromTarget::Subquery { alias, .. } => Some(alias),
            FromTarget::Raw { alias, .. } => alias.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Inner => "inner",
            JoinKind::Left => "left",
            JoinKind::Right => "right",
            JoinKind::Full => "full",
        }
    }
}

/// One join entry, emitted in input order.
#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    pub target: FromTarget,
    pub on: Predicate,
    pub lateral: bool,
}

/// A `with`-declared subquery.
#[derive(Debug, Clone)]
pub struct Cte {
    pub alias: String,
    pub select: SelectConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Intersect,
    Except,
}

impl SetOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetOp::Union => "union",
            SetOp::Intersect => "intersect",
            SetOp::Except => "except",
        }
    }
}

/// One folded set operation. The operation's own `order_by`/pagination apply
/// to the combined rowset, not to the right operand.
#[derive(Debug, Clone)]
pub struct SetOperation {
    pub op: SetOp,
    pub all: bool,
    pub select: SelectConfig,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Which row image an output column reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Image {
    Inserted,
    Deleted,
}

impl Image {
    pub fn as_str(&self) -> &'static str {
        match self {
            Image::Inserted => "inserted",
            Image::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputColumn {
    pub image: Image,
    pub column: String,
}

/// An output/returning clause: the affected rows (pre- or post-image)
/// requested from an insert/update/delete.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub columns: Vec<OutputColumn>,
}

impl Output {
    pub fn inserted<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|c| OutputColumn {
                    image: Image::Inserted,
                    column: c.into(),
                })
                .collect(),
        }
    }

    pub fn deleted<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|c| OutputColumn {
                    image: Image::Deleted,
                    column: c.into(),
                })
                .collect(),
        }
    }

    pub fn and(mut self, other: Output) -> Self {
        self.columns.extend(other.columns);
        self
    }
}

/// Trailing JSON-producing clause on a SELECT.
#[derive(Debug, Clone, Copy)]
pub struct ForJson {
    /// Emit a single object rather than an array.
    pub single: bool,
}

/// SELECT statement configuration.
#[derive(Debug, Clone)]
pub struct SelectConfig {
    pub with: Vec<Cte>,
    /// Ordered field list: output key → expression.
    pub fields: Vec<(String, Expr)>,
    pub from: FromTarget,
    pub joins: Vec<Join>,
    pub where_clause: Option<Predicate>,
    pub group_by: Vec<Expr>,
    pub having: Option<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub distinct: bool,
    pub set_ops: Vec<SetOperation>,
    pub for_json: Option<ForJson>,
}

impl SelectConfig {
    pub fn new(from: FromTarget) -> Self {
        Self {
            with: Vec::new(),
            fields: Vec::new(),
            from,
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            set_ops: Vec::new(),
            for_json: None,
        }
    }

    /// Field keys in declaration order, used for set-operation shape checks.
    pub fn field_keys(&self) -> Vec<&str> {
        self.fields.iter().map(|(k, _)| k.as_str()).collect()
    }
}

/// A column value in insert/update SET position.
#[derive(Debug, Clone)]
pub enum InsertValue {
    Value(SqlValue),
    Expr(Fragment),
}

#[derive(Debug, Clone)]
pub enum ConflictAction {
    DoNothing,
    DoUpdate(Vec<(String, InsertValue)>),
}

/// Upsert clause for dialects that support it.
#[derive(Debug, Clone)]
pub struct OnConflict {
    pub target: Vec<String>,
    pub action: ConflictAction,
}

/// INSERT statement configuration. Each row maps column names to values;
/// missing columns fall back to the column's default machinery.
#[derive(Debug, Clone)]
pub struct InsertConfig {
    pub table: Arc<Table>,
    pub rows: Vec<Vec<(String, InsertValue)>>,
    pub on_conflict: Option<OnConflict>,
    pub output: Option<Output>,
}

/// UPDATE statement configuration. Later `set` entries for the same column
/// win; unknown keys are ignored.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub table: Arc<Table>,
    pub set: Vec<(String, InsertValue)>,
    pub where_clause: Option<Predicate>,
    pub output: Option<Output>,
}

/// DELETE statement configuration.
#[derive(Debug, Clone)]
pub struct DeleteConfig {
    pub table: Arc<Table>,
    pub where_clause: Option<Predicate>,
    pub output: Option<Output>,
}
