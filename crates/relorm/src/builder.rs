//! Fluent statement builders.
//!
//! Builders only collect configuration; compilation happens once, when the
//! finished builder is handed to a [`Compiler`]. Every method consumes and
//! returns the builder, so a config can't be mutated after it was built.

use crate::compiler::Compiler;
use crate::config::{
    Cte, DeleteConfig, ForJson, FromTarget, InsertConfig, InsertValue, Join, JoinKind, OnConflict,
    Output, SelectConfig, SetOp, SetOperation, UpdateConfig,
};
use crate::error::{OrmError, OrmResult};
use crate::expr::{Expr, OrderBy, Predicate};
use crate::fragment::{Compiled, Fragment};
use crate::schema::Table;
use crate::value::SqlValue;
use std::sync::Arc;

/// SELECT builder.
#[derive(Debug, Clone)]
pub struct Select {
    config: SelectConfig,
}

impl Select {
    pub fn from(table: Arc<Table>) -> Self {
        Self {
            config: SelectConfig::new(FromTarget::Table(table)),
        }
    }

    pub fn from_alias(table: Arc<Table>, alias: impl Into<String>) -> Self {
        Self {
            config: SelectConfig::new(FromTarget::AliasedTable {
                table,
                alias: alias.into(),
            }),
        }
    }

    pub fn from_subquery(select: Select, alias: impl Into<String>) -> Self {
        Self {
            config: SelectConfig::new(FromTarget::Subquery {
                select: Box::new(select.config),
                alias: alias.into(),
            }),
        }
    }

    /// Add one output field under an explicit key.
    pub fn field(mut self, key: impl Into<String>, expr: Expr) -> Self {
        self.config.fields.push((key.into(), expr));
        self
    }

    /// Add plain columns of the base relation, keyed by their own names.
    pub fn columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let base = self
            .config
            .from
            .scope_name()
            .unwrap_or_default()
            .to_string();
        for name in names {
            let name = name.into();
            self.config
                .fields
                .push((name.clone(), Expr::col(&base, name)));
        }
        self
    }

    pub fn distinct(mut self) -> Self {
        self.config.distinct = true;
        self
    }

    pub fn with(mut self, alias: impl Into<String>, select: Select) -> Self {
        self.config.with.push(Cte {
            alias: alias.into(),
            select: select.config,
        });
        self
    }

    pub fn join(mut self, kind: JoinKind, target: FromTarget, on: Predicate) -> Self {
        self.config.joins.push(Join {
            kind,
            target,
            on,
            lateral: false,
        });
        self
    }

    pub fn inner_join(self, table: Arc<Table>, on: Predicate) -> Self {
        self.join(JoinKind::Inner, FromTarget::Table(table), on)
    }

    pub fn left_join(self, table: Arc<Table>, on: Predicate) -> Self {
        self.join(JoinKind::Left, FromTarget::Table(table), on)
    }

    /// Add a WHERE condition; repeated calls AND together.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.config.where_clause = Some(match self.config.where_clause.take() {
            Some(existing) => Predicate::And(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.config.group_by.push(expr);
        self
    }

    pub fn having(mut self, predicate: Predicate) -> Self {
        self.config.having = Some(match self.config.having.take() {
            Some(existing) => Predicate::And(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    /// Append an ORDER BY term. After a set operation, ordering applies to
    /// the combined rowset.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        match self.config.set_ops.last_mut() {
            Some(last) => last.order_by.push(order),
            None => self.config.order_by.push(order),
        }
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        match self.config.set_ops.last_mut() {
            Some(last) => last.limit = Some(limit),
            None => self.config.limit = Some(limit),
        }
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        match self.config.set_ops.last_mut() {
            Some(last) => last.offset = Some(offset),
            None => self.config.offset = Some(offset),
        }
        self
    }

    pub fn for_json(mut self, single: bool) -> Self {
        self.config.for_json = Some(ForJson { single });
        self
    }

    pub fn build(self) -> SelectConfig {
        self.config
    }

    pub fn compile(self, compiler: &Compiler) -> OrmResult<Compiled> {
        let fragment = compiler.build_select(&self.config)?;
        Ok(compiler.to_text(&fragment))
    }
}

fn combine(op: SetOp, all: bool, selects: Vec<Select>) -> OrmResult<Select> {
    let mut iter = selects.into_iter();
    let Some(mut first) = iter.next() else {
        return Err(OrmError::EmptySetOperatorList);
    };
    for select in iter {
        first.config.set_ops.push(SetOperation {
            op,
            all,
            select: select.config,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        });
    }
    Ok(first)
}

/// `union` of the given selects, in order. An empty list is an error, never
/// silently a no-op.
pub fn union(selects: Vec<Select>) -> OrmResult<Select> {
    combine(SetOp::Union, false, selects)
}

pub fn union_all(selects: Vec<Select>) -> OrmResult<Select> {
    combine(SetOp::Union, true, selects)
}

pub fn intersect(selects: Vec<Select>) -> OrmResult<Select> {
    combine(SetOp::Intersect, false, selects)
}

pub fn except(selects: Vec<Select>) -> OrmResult<Select> {
    combine(SetOp::Except, false, selects)
}

/// INSERT builder.
#[derive(Debug, Clone)]
pub struct Insert {
    config: InsertConfig,
}

impl Insert {
    pub fn into(table: Arc<Table>) -> Self {
        Self {
            config: InsertConfig {
                table,
                rows: Vec::new(),
                on_conflict: None,
                output: None,
            },
        }
    }

    /// Add one row of plain values.
    pub fn values<I, S, V>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<SqlValue>,
    {
        self.config.rows.push(
            cells
                .into_iter()
                .map(|(k, v)| (k.into(), InsertValue::Value(v.into())))
                .collect(),
        );
        self
    }

    /// Add one row mixing values and raw expressions.
    pub fn row(mut self, cells: Vec<(String, InsertValue)>) -> Self {
        self.config.rows.push(cells);
        self
    }

    pub fn on_conflict(mut self, on_conflict: OnConflict) -> Self {
        self.config.on_conflict = Some(on_conflict);
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.config.output = Some(output);
        self
    }

    pub fn build(self) -> InsertConfig {
        self.config
    }

    pub fn compile(self, compiler: &Compiler) -> OrmResult<Compiled> {
        let fragment = compiler.build_insert(&self.config)?;
        Ok(compiler.to_text(&fragment))
    }
}

/// UPDATE builder.
#[derive(Debug, Clone)]
pub struct Update {
    config: UpdateConfig,
}

impl Update {
    pub fn table(table: Arc<Table>) -> Self {
        Self {
            config: UpdateConfig {
                table,
                set: Vec::new(),
                where_clause: None,
                output: None,
            },
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.config
            .set
            .push((column.into(), InsertValue::Value(value.into())));
        self
    }

    pub fn set_expr(mut self, column: impl Into<String>, expr: Fragment) -> Self {
        self.config
            .set
            .push((column.into(), InsertValue::Expr(expr)));
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.config.where_clause = Some(match self.config.where_clause.take() {
            Some(existing) => Predicate::And(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.config.output = Some(output);
        self
    }

    pub fn build(self) -> UpdateConfig {
        self.config
    }

    pub fn compile(self, compiler: &Compiler) -> OrmResult<Compiled> {
        let fragment = compiler.build_update(&self.config)?;
        Ok(compiler.to_text(&fragment))
    }
}

/// DELETE builder.
#[derive(Debug, Clone)]
pub struct Delete {
    config: DeleteConfig,
}

impl Delete {
    pub fn from(table: Arc<Table>) -> Self {
        Self {
            config: DeleteConfig {
                table,
                where_clause: None,
                output: None,
            },
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.config.where_clause = Some(match self.config.where_clause.take() {
            Some(existing) => Predicate::And(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.config.output = Some(output);
        self
    }

    pub fn build(self) -> DeleteConfig {
        self.config
    }

    pub fn compile(self, compiler: &Compiler) -> OrmResult<Compiled> {
        let fragment = compiler.build_delete(&self.config)?;
        Ok(compiler.to_text(&fragment))
    }
}
