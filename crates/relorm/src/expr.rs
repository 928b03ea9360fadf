//! Expression and predicate trees.
//!
//! Closed tagged variants with exhaustive matching in the compiler — no
//! runtime type identification. Column references carry their owning table
//! (or alias) by name, which is what the compiler validates against the
//! query's FROM/JOIN set, and what [`rebind`](Expr::rebind) rewrites when the
//! planner aliases a recursion level.

use crate::config::SelectConfig;
use crate::fragment::Fragment;
use crate::value::SqlValue;

/// A scalar SQL expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A column reference, qualified by its owning table or alias.
    Column { table: String, name: String },
    /// A literal value, bound as a parameter.
    Literal(SqlValue),
    /// Raw SQL text, emitted as-is.
    Raw(String),
    /// A scalar subquery.
    Subquery(Box<SelectConfig>),
    /// An aliased expression (`expr as alias`).
    Aliased { expr: Box<Expr>, alias: String },
}

impl Expr {
    pub fn col(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn lit(value: impl Into<SqlValue>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Expr::Raw(sql.into())
    }

    pub fn subquery(select: SelectConfig) -> Self {
        Expr::Subquery(Box::new(select))
    }

    pub fn alias(self, alias: impl Into<String>) -> Self {
        Expr::Aliased {
            expr: Box::new(self),
            alias: alias.into(),
        }
    }

    /// Rewrite every column reference owned by `table` to point at `alias`.
    ///
    /// Applied once per planner recursion level so that nested and
    /// self-joining relations don't collide.
    pub fn rebind(&self, table: &str, alias: &str) -> Expr {
        match self {
            Expr::Column { table: t, name } if t == table => Expr::Column {
                table: alias.to_string(),
                name: name.clone(),
            },
            Expr::Aliased { expr, alias: a } => Expr::Aliased {
                expr: Box::new(expr.rebind(table, alias)),
                alias: a.clone(),
            },
            other => other.clone(),
        }
    }

    /// Visit every column reference in this expression.
    ///
    /// Subqueries are skipped: they are validated in their own scope.
    pub fn for_each_column(&self, f: &mut dyn FnMut(&str, &str)) {
        match self {
            Expr::Column { table, name } => f(table, name),
            Expr::Aliased { expr, .. } => expr.for_each_column(f),
            Expr::Literal(_) | Expr::Raw(_) | Expr::Subquery(_) => {}
        }
    }
}

/// Comparison operators for [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Like => "like",
        }
    }
}

/// A boolean predicate tree for WHERE/HAVING/ON clauses.
#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        left: Expr,
        op: CompareOp,
        right: Expr,
    },
    IsNull {
        expr: Expr,
        negated: bool,
    },
    InList {
        expr: Expr,
        values: Vec<SqlValue>,
        negated: bool,
    },
    Between {
        expr: Expr,
        low: SqlValue,
        high: SqlValue,
        negated: bool,
    },
    /// A raw fragment, spliced verbatim (parameters included).
    Raw(Fragment),
    /// Always true (used for empty NOT IN lists).
    True,
    /// Always false (used for empty IN lists).
    False,
}

macro_rules! compare_ctor {
    ($($fn_name:ident => $op:ident),+ $(,)?) => {
        $(
            pub fn $fn_name(left: Expr, value: impl Into<SqlValue>) -> Self {
                Predicate::Compare {
                    left,
                    op: CompareOp::$op,
                    right: Expr::Literal(value.into()),
                }
            }
        )+
    };
}

impl Predicate {
    compare_ctor! {
        eq => Eq,
        ne => Ne,
        gt => Gt,
        gte => Gte,
        lt => Lt,
        lte => Lte,
        like => Like,
    }

    pub fn and(preds: Vec<Predicate>) -> Self {
        Predicate::And(preds)
    }

    pub fn or(preds: Vec<Predicate>) -> Self {
        Predicate::Or(preds)
    }

    pub fn not(pred: Predicate) -> Self {
        Predicate::Not(Box::new(pred))
    }

    /// Column-to-column equality (join predicates).
    pub fn eq_col(left: Expr, right: Expr) -> Self {
        Predicate::Compare {
            left,
            op: CompareOp::Eq,
            right,
        }
    }

    pub fn is_null(expr: Expr) -> Self {
        Predicate::IsNull {
            expr,
            negated: false,
        }
    }

    pub fn is_not_null(expr: Expr) -> Self {
        Predicate::IsNull {
            expr,
            negated: true,
        }
    }

    /// `expr in (values…)`; an empty list folds to a constant-false
    /// predicate, never invalid SQL.
    pub fn in_list<T: Into<SqlValue>>(expr: Expr, values: Vec<T>) -> Self {
        if values.is_empty() {
            return Predicate::False;
        }
        Predicate::InList {
            expr,
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// `expr not in (values…)`; an empty list folds to constant-true.
    pub fn not_in<T: Into<SqlValue>>(expr: Expr, values: Vec<T>) -> Self {
        if values.is_empty() {
            return Predicate::True;
        }
        Predicate::InList {
            expr,
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn between(expr: Expr, low: impl Into<SqlValue>, high: impl Into<SqlValue>) -> Self {
        Predicate::Between {
            expr,
            low: low.into(),
            high: high.into(),
            negated: false,
        }
    }

    pub fn raw(fragment: Fragment) -> Self {
        Predicate::Raw(fragment)
    }

    /// Rewrite column references owned by `table` to `alias`, recursively.
    pub fn rebind(&self, table: &str, alias: &str) -> Predicate {
        match self {
            Predicate::And(ps) => {
                Predicate::And(ps.iter().map(|p| p.rebind(table, alias)).collect())
            }
            Predicate::Or(ps) => {
                Predicate::Or(ps.iter().map(|p| p.rebind(table, alias)).collect())
            }
            Predicate::Not(p) => Predicate::Not(Box::new(p.rebind(table, alias))),
            Predicate::Compare { left, op, right } => Predicate::Compare {
                left: left.rebind(table, alias),
                op: *op,
                right: right.rebind(table, alias),
            },
            Predicate::IsNull { expr, negated } => Predicate::IsNull {
                expr: expr.rebind(table, alias),
                negated: *negated,
            },
            Predicate::InList {
                expr,
                values,
                negated,
            } => Predicate::InList {
                expr: expr.rebind(table, alias),
                values: values.clone(),
                negated: *negated,
            },
            Predicate::Between {
                expr,
                low,
                high,
                negated,
            } => Predicate::Between {
                expr: expr.rebind(table, alias),
                low: low.clone(),
                high: high.clone(),
                negated: *negated,
            },
            other => other.clone(),
        }
    }

    /// Visit every column reference in this predicate.
    pub fn for_each_column(&self, f: &mut dyn FnMut(&str, &str)) {
        match self {
            Predicate::And(ps) | Predicate::Or(ps) => {
                for p in ps {
                    p.for_each_column(f);
                }
            }
            Predicate::Not(p) => p.for_each_column(f),
            Predicate::Compare { left, right, .. } => {
                left.for_each_column(f);
                right.for_each_column(f);
            }
            Predicate::IsNull { expr, .. }
            | Predicate::InList { expr, .. }
            | Predicate::Between { expr, .. } => expr.for_each_column(f),
            Predicate::Raw(_) | Predicate::True | Predicate::False => {}
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// One ORDER BY term.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: Direction::Asc,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: Direction::Desc,
        }
    }

    pub fn rebind(&self, table: &str, alias: &str) -> OrderBy {
        OrderBy {
            expr: self.expr.rebind(table, alias),
            direction: self.direction,
        }
    }
}
