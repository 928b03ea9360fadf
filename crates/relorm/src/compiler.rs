//! The dialect compiler: statement configs in, fragments out.
//!
//! Each `build_*` function is a pure translation from a config to a
//! [`Fragment`]; no I/O happens here and every failure is raised before any
//! text is produced. Dialect differences are confined to what [`Dialect`]
//! exposes — quoting, placeholders, pagination, returning style.

use crate::config::{
    ConflictAction, DeleteConfig, ForJson, FromTarget, InsertConfig, InsertValue, Output,
    SelectConfig, SetOperation, UpdateConfig,
};
use crate::dialect::{Dialect, PaginationStyle, ReturningStyle};
use crate::error::{OrmError, OrmResult};
use crate::expr::{Expr, OrderBy, Predicate};
use crate::fragment::{Compiled, Fragment};
use crate::schema::{Table, ValueSource};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Per-dialect statement compiler.
#[derive(Debug, Clone)]
pub struct Compiler {
    dialect: Arc<dyn Dialect>,
}

/// Name resolution context for one SELECT level: the relations visible to
/// column references, plus any names inherited from an enclosing query
/// (correlated subqueries).
struct Scope {
    /// Every name a column qualifier may legally use at this level.
    names: Vec<String>,
    /// The base relation's name, for the unqualified-rendering shortcut.
    base: Option<String>,
    /// Tables reachable by scope name, for logical→physical column mapping.
    tables: BTreeMap<String, Arc<Table>>,
    /// Whether column references at this level must carry their qualifier.
    qualify: bool,
}

impl Scope {
    fn of(config: &SelectConfig, outer: &[String]) -> Scope {
        let mut names = Vec::new();
        let mut tables = BTreeMap::new();
        let mut register = |target: &FromTarget, names: &mut Vec<String>| {
            if let Some(name) = target.scope_name() {
                names.push(name.to_string());
            }
            match target {
                FromTarget::Table(t) => {
                    tables.insert(t.name.clone(), t.clone());
                }
                FromTarget::AliasedTable { table, alias } => {
                    tables.insert(alias.clone(), table.clone());
                }
                _ => {}
            }
        };
        register(&config.from, &mut names);
        for join in &config.joins {
            register(&join.target, &mut names);
        }
        for cte in &config.with {
            names.push(cte.alias.clone());
        }
        let base = config.from.scope_name().map(str::to_string);
        let qualify = !config.joins.is_empty() || !matches!(config.from, FromTarget::Table(_));
        names.extend(outer.iter().cloned());
        Scope {
            names,
            base,
            tables,
            qualify,
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Physical column name for a (scope-name, logical-name) pair; falls back
    /// to the logical name when the relation isn't a declared table.
    fn physical(&self, table: &str, column: &str) -> String {
        self.tables
            .get(table)
            .and_then(|t| t.column_by_name(column))
            .map(|c| c.sql_name.clone())
            .unwrap_or_else(|| column.to_string())
    }
}

impl Compiler {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        &*self.dialect
    }

    /// Render a fragment to final text plus its ordered parameter list.
    pub fn to_text(&self, fragment: &Fragment) -> Compiled {
        fragment.to_text(&*self.dialect)
    }

    /// Compile a SELECT config, folding any set operations.
    pub fn build_select(&self, config: &SelectConfig) -> OrmResult<Fragment> {
        self.select_fragment(config, &[])
    }

    fn select_fragment(&self, config: &SelectConfig, outer: &[String]) -> OrmResult<Fragment> {
        if config.set_ops.is_empty() {
            return self.plain_select(config, outer);
        }
        debug!(
            operands = config.set_ops.len() + 1,
            "compiling set operation"
        );

        let left_keys: Vec<String> = config
            .field_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut out = Fragment::raw("(");
        out.append(self.plain_select(config, outer)?);
        out.push(")");
        for op in &config.set_ops {
            let right_keys: Vec<&str> = op.select.field_keys();
            if left_keys != right_keys {
                return Err(OrmError::MismatchedSetOperatorShape {
                    left: left_keys.join(", "),
                    right: right_keys.join(", "),
                });
            }
            out.push(" ");
            out.push(op.op.as_str());
            if op.all {
                out.push(" all");
            }
            out.push(" (");
            out.append(self.select_fragment(&op.select, outer)?);
            out.push(")");
        }

        // The last operator's own ordering and pagination apply once, to the
        // combined rowset.
        if let Some(last) = config.set_ops.last() {
            if !last.order_by.is_empty() {
                out.push(" order by ");
                let terms = last
                    .order_by
                    .iter()
                    .map(|o| self.bare_order_term(o))
                    .collect();
                out.append(Fragment::join(terms, &Fragment::raw(", ")));
            }
            out.append(self.combined_pagination(last));
        }
        Ok(out)
    }

    fn plain_select(&self, config: &SelectConfig, outer: &[String]) -> OrmResult<Fragment> {
        let scope = Scope::of(config, outer);
        self.validate_select(config, &scope)?;
        if config.fields.is_empty() {
            return Err(OrmError::EmptyProjection {
                table: scope.base.clone().unwrap_or_else(|| "<derived>".into()),
            });
        }
        debug!(table = scope.base.as_deref().unwrap_or("<derived>"), fields = config.fields.len(), "compiling select");

        let mut out = Fragment::empty();
        if !config.with.is_empty() {
            out.push("with ");
            let mut ctes = Vec::with_capacity(config.with.len());
            for cte in &config.with {
                let mut f = Fragment::empty();
                f.push_ident(&cte.alias);
                f.push(" as (");
                f.append(self.select_fragment(&cte.select, &scope.names)?);
                f.push(")");
                ctes.push(f);
            }
            out.append(Fragment::join(ctes, &Fragment::raw(", ")));
            out.push(" ");
        }

        out.push("select ");
        if config.distinct {
            out.push("distinct ");
        }
        let top = self.dialect.pagination() == PaginationStyle::TopOffsetFetch
            && config.limit.is_some()
            && config.offset.is_none();
        if top {
            if let Some(limit) = config.limit {
                let _ = write!(self.text_sink(&mut out), "top ({limit}) ");
            }
        }

        let mut fields = Vec::with_capacity(config.fields.len());
        for (key, expr) in &config.fields {
            fields.push(self.field_fragment(key, expr, &scope)?);
        }
        // A single-column select surfaces that column's decoder on the whole
        // statement, so Session::query can apply it to the returned rows.
        let column_decoder = match fields.as_slice() {
            [only] => only.decoder().cloned(),
            _ => None,
        };
        out.append(Fragment::join(fields, &Fragment::raw(", ")));

        out.push(" from ");
        out.append(self.from_fragment(&config.from, &scope)?);

        for join in &config.joins {
            out.push(" ");
            out.push(join.kind.as_str());
            out.push(" join ");
            if join.lateral {
                out.push("lateral ");
            }
            out.append(self.from_fragment(&join.target, &scope)?);
            out.push(" on ");
            out.append(self.predicate_fragment(&join.on, &scope)?);
        }

        if let Some(pred) = &config.where_clause {
            out.push(" where ");
            out.append(self.predicate_fragment(pred, &scope)?);
        }
        if !config.group_by.is_empty() {
            out.push(" group by ");
            let terms = config
                .group_by
                .iter()
                .map(|e| self.expr_fragment(e, &scope))
                .collect::<OrmResult<Vec<_>>>()?;
            out.append(Fragment::join(terms, &Fragment::raw(", ")));
        }
        if let Some(pred) = &config.having {
            out.push(" having ");
            out.append(self.predicate_fragment(pred, &scope)?);
        }
        if !config.order_by.is_empty() {
            out.push(" order by ");
            let terms = config
                .order_by
                .iter()
                .map(|o| self.order_term(o, &scope))
                .collect::<OrmResult<Vec<_>>>()?;
            out.append(Fragment::join(terms, &Fragment::raw(", ")));
        }

        self.pagination_suffix(&mut out, config.limit, config.offset);

        if let Some(ForJson { single }) = config.for_json {
            match self.dialect.for_json_clause(single) {
                Some(clause) => {
                    out.push(clause);
                }
                None => {
                    return Err(OrmError::validation(format!(
                        "dialect '{}' has no json-producing clause",
                        self.dialect.name()
                    )));
                }
            }
        }
        Ok(match column_decoder {
            Some(decoder) => out.with_decoder(decoder),
            None => out,
        })
    }

    // Appends raw text to the fragment through the `write!` machinery.
    fn text_sink<'a>(&self, out: &'a mut Fragment) -> TextSink<'a> {
        TextSink(out)
    }

    fn pagination_suffix(&self, out: &mut Fragment, limit: Option<i64>, offset: Option<i64>) {
        match self.dialect.pagination() {
            PaginationStyle::LimitOffset => {
                if let Some(limit) = limit {
                    let _ = write!(self.text_sink(out), " limit {limit}");
                }
                if let Some(offset) = offset {
                    let _ = write!(self.text_sink(out), " offset {offset}");
                }
            }
            // A limit without an offset was already emitted as a `top (n)`
            // select prefix; set-operation tails go through
            // combined_pagination instead.
            PaginationStyle::TopOffsetFetch => {
                if let Some(offset) = offset {
                    let _ = write!(self.text_sink(out), " offset {offset} rows");
                    if let Some(limit) = limit {
                        let _ = write!(self.text_sink(out), " fetch next {limit} rows only");
                    }
                }
            }
        }
    }

    fn combined_pagination(&self, op: &SetOperation) -> Fragment {
        let mut out = Fragment::empty();
        match self.dialect.pagination() {
            PaginationStyle::LimitOffset => {
                if let Some(limit) = op.limit {
                    let _ = write!(self.text_sink(&mut out), " limit {limit}");
                }
                if let Some(offset) = op.offset {
                    let _ = write!(self.text_sink(&mut out), " offset {offset}");
                }
            }
            PaginationStyle::TopOffsetFetch => {
                if op.limit.is_some() || op.offset.is_some() {
                    let offset = op.offset.unwrap_or(0);
                    let _ = write!(self.text_sink(&mut out), " offset {offset} rows");
                    if let Some(limit) = op.limit {
                        let _ =
                            write!(self.text_sink(&mut out), " fetch next {limit} rows only");
                    }
                }
            }
        }
        out
    }

    /// An order-by term attached to a set operation: the combined rowset has
    /// no single owning table, so column references drop their qualifier.
    fn bare_order_term(&self, order: &OrderBy) -> Fragment {
        let mut f = Fragment::empty();
        match &order.expr {
            Expr::Column { name, .. } => {
                f.push_ident(name);
            }
            Expr::Raw(sql) => {
                f.push(sql);
            }
            Expr::Literal(v) => {
                f.push_param(v.clone());
            }
            Expr::Aliased { alias, .. } => {
                f.push_ident(alias);
            }
            Expr::Subquery(_) => {
                f.push("1");
            }
        }
        f.push(" ");
        f.push(order.direction.as_str());
        f
    }

    fn order_term(&self, order: &OrderBy, scope: &Scope) -> OrmResult<Fragment> {
        let mut f = self.expr_fragment(&order.expr, scope)?;
        f.push(" ");
        f.push(order.direction.as_str());
        Ok(f)
    }

    fn validate_select(&self, config: &SelectConfig, scope: &Scope) -> OrmResult<()> {
        let mut dangling: Option<(String, String)> = None;
        {
            let mut check = |table: &str, column: &str| {
                if dangling.is_none() && !scope.contains(table) {
                    dangling = Some((column.to_string(), table.to_string()));
                }
            };
            for (_, expr) in &config.fields {
                expr.for_each_column(&mut check);
            }
            for join in &config.joins {
                join.on.for_each_column(&mut check);
            }
            if let Some(pred) = &config.where_clause {
                pred.for_each_column(&mut check);
            }
            for expr in &config.group_by {
                expr.for_each_column(&mut check);
            }
            if let Some(pred) = &config.having {
                pred.for_each_column(&mut check);
            }
            for order in &config.order_by {
                order.expr.for_each_column(&mut check);
            }
        }
        match dangling {
            Some((field, table)) => Err(OrmError::DanglingColumnReference { field, table }),
            None => Ok(()),
        }
    }

    fn from_fragment(&self, target: &FromTarget, scope: &Scope) -> OrmResult<Fragment> {
        let mut f = Fragment::empty();
        match target {
            FromTarget::Table(t) => {
                f.push_ident(&t.qualified_name());
            }
            FromTarget::AliasedTable { table, alias } => {
                f.push_ident(&table.qualified_name());
                f.push(" ");
                f.push_ident(alias);
            }
            FromTarget::Subquery { select, alias } => {
                f.push("(");
                f.append(self.select_fragment(select, &scope.names)?);
                f.push(") ");
                f.push_ident(alias);
            }
            FromTarget::Raw { fragment, alias } => {
                f.append(fragment.clone());
                if let Some(alias) = alias {
                    f.push(" ");
                    f.push_ident(alias);
                }
            }
        }
        Ok(f)
    }

    fn field_fragment(&self, key: &str, expr: &Expr, scope: &Scope) -> OrmResult<Fragment> {
        match expr {
            Expr::Column { table, name } => {
                let physical = scope.physical(table, name);
                let mut f = Fragment::empty();
                self.push_column(&mut f, table, &physical, scope);
                // Re-expose the logical name whenever the rendered column
                // wouldn't already read as the output key.
                if physical != key {
                    f.push(" as ");
                    f.push_ident(key);
                }
                let decoder = scope
                    .tables
                    .get(table)
                    .and_then(|t| t.column_by_name(name))
                    .and_then(|c| c.decoder.clone());
                Ok(match decoder {
                    Some(decoder) => f.with_decoder(decoder),
                    None => f,
                })
            }
            Expr::Subquery(select) => {
                let mut f = Fragment::raw("(");
                f.append(self.select_fragment(select, &scope.names)?);
                f.push(") as ");
                f.push_ident(key);
                // Single-column passthrough: surface the inner column's
                // decoder on the outer field.
                if select.fields.len() == 1 {
                    if let Some(decoder) = self.inner_decoder(select) {
                        f = f.with_decoder(decoder);
                    }
                }
                Ok(f)
            }
            Expr::Aliased { expr, alias } => {
                let mut f = self.expr_fragment(expr, scope)?;
                f.push(" as ");
                f.push_ident(alias);
                Ok(f)
            }
            other => {
                let mut f = self.expr_fragment(other, scope)?;
                f.push(" as ");
                f.push_ident(key);
                Ok(f)
            }
        }
    }

    fn inner_decoder(&self, select: &SelectConfig) -> Option<crate::fragment::Decoder> {
        let (key, expr) = select.fields.first()?;
        let name = match expr {
            Expr::Column { name, .. } => name,
            _ => key,
        };
        let table = match &select.from {
            FromTarget::Table(t) => t,
            FromTarget::AliasedTable { table, .. } => table,
            _ => return None,
        };
        table.column_by_name(name).and_then(|c| c.decoder.clone())
    }

    fn expr_fragment(&self, expr: &Expr, scope: &Scope) -> OrmResult<Fragment> {
        let mut f = Fragment::empty();
        match expr {
            Expr::Column { table, name } => {
                let physical = scope.physical(table, name);
                self.push_column(&mut f, table, &physical, scope);
            }
            Expr::Literal(v) => {
                f.push_param(v.clone());
            }
            Expr::Raw(sql) => {
                f.push(sql);
            }
            Expr::Subquery(select) => {
                f.push("(");
                f.append(self.select_fragment(select, &scope.names)?);
                f.push(")");
            }
            Expr::Aliased { expr, alias } => {
                f.append(self.expr_fragment(expr, scope)?);
                f.push(" as ");
                f.push_ident(alias);
            }
        }
        Ok(f)
    }

    fn push_column(&self, f: &mut Fragment, table: &str, physical: &str, scope: &Scope) {
        let owned_by_base = scope.base.as_deref() == Some(table);
        if scope.qualify || !owned_by_base {
            f.push_ident(&format!("{table}.{physical}"));
        } else {
            f.push_ident(physical);
        }
    }

    fn predicate_fragment(&self, pred: &Predicate, scope: &Scope) -> OrmResult<Fragment> {
        let mut f = Fragment::empty();
        match pred {
            Predicate::And(ps) | Predicate::Or(ps) => {
                let sep = if matches!(pred, Predicate::And(_)) {
                    " and "
                } else {
                    " or "
                };
                let rendered = ps
                    .iter()
                    .map(|p| self.predicate_fragment(p, scope))
                    .collect::<OrmResult<Vec<_>>>()?;
                match rendered.len() {
                    0 => f.push("1=1"),
                    1 => {
                        let mut it = rendered;
                        f.append(it.remove(0))
                    }
                    _ => {
                        f.push("(");
                        f.append(Fragment::join(rendered, &Fragment::raw(sep)));
                        f.push(")")
                    }
                };
            }
            Predicate::Not(p) => {
                f.push("not (");
                f.append(self.predicate_fragment(p, scope)?);
                f.push(")");
            }
            Predicate::Compare { left, op, right } => {
                f.append(self.expr_fragment(left, scope)?);
                f.push(" ");
                f.push(op.as_str());
                f.push(" ");
                f.append(self.expr_fragment(right, scope)?);
            }
            Predicate::IsNull { expr, negated } => {
                f.append(self.expr_fragment(expr, scope)?);
                f.push(if *negated { " is not null" } else { " is null" });
            }
            Predicate::InList {
                expr,
                values,
                negated,
            } => {
                f.append(self.expr_fragment(expr, scope)?);
                f.push(if *negated { " not in (" } else { " in (" });
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.push(", ");
                    }
                    f.push_param(v.clone());
                }
                f.push(")");
            }
            Predicate::Between {
                expr,
                low,
                high,
                negated,
            } => {
                f.append(self.expr_fragment(expr, scope)?);
                f.push(if *negated { " not between " } else { " between " });
                f.push_param(low.clone());
                f.push(" and ");
                f.push_param(high.clone());
            }
            Predicate::Raw(fragment) => {
                f.append(fragment.clone());
            }
            Predicate::True => {
                f.push("1=1");
            }
            Predicate::False => {
                f.push("1=0");
            }
        }
        Ok(f)
    }

    /// Compile an INSERT config.
    ///
    /// Column order is the table's declared order minus insert-disabled
    /// columns, unless some row supplies an explicit value for one. Missing
    /// cells fall back to the column's default machinery, then the `default`
    /// keyword.
    pub fn build_insert(&self, config: &InsertConfig) -> OrmResult<Fragment> {
        if config.rows.is_empty() {
            return Err(OrmError::validation(format!(
                "insert into '{}' requires at least one row",
                config.table.name
            )));
        }
        let supplied = |name: &str| {
            config
                .rows
                .iter()
                .any(|row| row.iter().any(|(k, _)| k == name))
        };
        let columns: Vec<_> = config
            .table
            .columns
            .iter()
            .filter(|c| !c.insert_disabled || supplied(&c.name))
            .collect();
        if columns.is_empty() {
            return Err(OrmError::validation(format!(
                "insert into '{}' resolves to zero columns",
                config.table.name
            )));
        }
        debug!(table = %config.table.name, rows = config.rows.len(), "compiling insert");

        let mut out = Fragment::raw("insert into ");
        out.push_ident(&config.table.qualified_name());
        out.push(" (");
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                out.push(", ");
            }
            out.push_ident(&col.sql_name);
        }
        out.push(")");

        if let Some(output) = &config.output {
            if self.dialect.returning() == ReturningStyle::Output {
                out.push(" ");
                out.append(self.output_clause(output));
            }
        }

        out.push(" values ");
        for (ri, row) in config.rows.iter().enumerate() {
            if ri > 0 {
                out.push(", ");
            }
            out.push("(");
            for (ci, col) in columns.iter().enumerate() {
                if ci > 0 {
                    out.push(", ");
                }
                let cell = row
                    .iter()
                    .rev()
                    .find(|(k, _)| k == &col.name)
                    .map(|(_, v)| v);
                match cell {
                    Some(InsertValue::Value(v)) => {
                        out.push_param(v.clone());
                    }
                    Some(InsertValue::Expr(f)) => {
                        out.append(f.clone());
                    }
                    None => self.push_implicit(&mut out, col),
                }
            }
            out.push(")");
        }

        if let Some(on_conflict) = &config.on_conflict {
            if !self.dialect.supports_on_conflict() {
                return Err(OrmError::validation(format!(
                    "dialect '{}' does not support 'on conflict'",
                    self.dialect.name()
                )));
            }
            out.push(" on conflict (");
            for (i, col) in on_conflict.target.iter().enumerate() {
                if i > 0 {
                    out.push(", ");
                }
                out.push_ident(col);
            }
            out.push(")");
            match &on_conflict.action {
                ConflictAction::DoNothing => {
                    out.push(" do nothing");
                }
                ConflictAction::DoUpdate(set) => {
                    out.push(" do update set ");
                    for (i, (name, value)) in set.iter().enumerate() {
                        if i > 0 {
                            out.push(", ");
                        }
                        out.push_ident(name);
                        out.push(" = ");
                        match value {
                            InsertValue::Value(v) => {
                                out.push_param(v.clone());
                            }
                            InsertValue::Expr(f) => {
                                out.append(f.clone());
                            }
                        }
                    }
                }
            }
        }

        if let Some(output) = &config.output {
            if self.dialect.returning() == ReturningStyle::Returning {
                out.push(" ");
                out.append(self.output_clause(output));
            }
        }
        Ok(out)
    }

    fn push_implicit(&self, out: &mut Fragment, col: &crate::schema::Column) {
        let source = col.default.as_ref().or(col.on_update.as_ref());
        match source {
            Some(ValueSource::Value(v)) => {
                out.push_param(v.clone());
            }
            Some(ValueSource::Expr(sql)) => {
                out.push(sql);
            }
            Some(ValueSource::Generated(g)) => {
                out.push_param(g.produce());
            }
            None => {
                out.push("default");
            }
        }
    }

    /// Compile an UPDATE config. Unknown SET keys are dropped; a later entry
    /// for the same column wins; columns carrying an on-update generator are
    /// touched automatically when the caller didn't set them.
    pub fn build_update(&self, config: &UpdateConfig) -> OrmResult<Fragment> {
        let mut set: Vec<(&str, InsertValue)> = Vec::new();
        for (name, value) in &config.set {
            let Some(col) = config.table.column_by_name(name) else {
                continue;
            };
            match set.iter_mut().find(|(n, _)| *n == col.name) {
                Some(slot) => slot.1 = value.clone(),
                None => set.push((&col.name, value.clone())),
            }
        }
        for col in &config.table.columns {
            if set.iter().any(|(n, _)| *n == col.name) {
                continue;
            }
            if let Some(source) = &col.on_update {
                let value = match source {
                    ValueSource::Value(v) => InsertValue::Value(v.clone()),
                    ValueSource::Expr(sql) => InsertValue::Expr(Fragment::raw(sql.clone())),
                    ValueSource::Generated(g) => InsertValue::Value(g.produce()),
                };
                set.push((&col.name, value));
            }
        }
        if set.is_empty() {
            return Err(OrmError::validation(format!(
                "update of '{}' sets no columns",
                config.table.name
            )));
        }
        debug!(table = %config.table.name, columns = set.len(), "compiling update");

        let mut out = Fragment::raw("update ");
        out.push_ident(&config.table.qualified_name());
        out.push(" set ");
        for (i, (name, value)) in set.iter().enumerate() {
            if i > 0 {
                out.push(", ");
            }
            let physical = config
                .table
                .column_by_name(name)
                .map(|c| c.sql_name.as_str())
                .unwrap_or(name);
            out.push_ident(physical);
            out.push(" = ");
            match value {
                InsertValue::Value(v) => {
                    out.push_param(v.clone());
                }
                InsertValue::Expr(f) => {
                    out.append(f.clone());
                }
            }
        }

        if let Some(output) = &config.output {
            if self.dialect.returning() == ReturningStyle::Output {
                out.push(" ");
                out.append(self.output_clause(output));
            }
        }
        if let Some(pred) = &config.where_clause {
            out.push(" where ");
            out.append(self.table_predicate(pred, &config.table)?);
        }
        if let Some(output) = &config.output {
            if self.dialect.returning() == ReturningStyle::Returning {
                out.push(" ");
                out.append(self.output_clause(output));
            }
        }
        Ok(out)
    }

    /// Compile a DELETE config.
    pub fn build_delete(&self, config: &DeleteConfig) -> OrmResult<Fragment> {
        debug!(table = %config.table.name, "compiling delete");
        let mut out = Fragment::raw("delete from ");
        out.push_ident(&config.table.qualified_name());
        if let Some(output) = &config.output {
            if self.dialect.returning() == ReturningStyle::Output {
                out.push(" ");
                out.append(self.output_clause(output));
            }
        }
        if let Some(pred) = &config.where_clause {
            out.push(" where ");
            out.append(self.table_predicate(pred, &config.table)?);
        }
        if let Some(output) = &config.output {
            if self.dialect.returning() == ReturningStyle::Returning {
                out.push(" ");
                out.append(self.output_clause(output));
            }
        }
        Ok(out)
    }

    /// Predicate rendering for single-table statements (update/delete), with
    /// the same dangling-reference check as SELECT.
    fn table_predicate(&self, pred: &Predicate, table: &Arc<Table>) -> OrmResult<Fragment> {
        let scope = Scope {
            names: vec![table.name.clone()],
            base: Some(table.name.clone()),
            tables: BTreeMap::from([(table.name.clone(), table.clone())]),
            qualify: false,
        };
        let mut dangling: Option<(String, String)> = None;
        pred.for_each_column(&mut |t, c| {
            if dangling.is_none() && !scope.contains(t) {
                dangling = Some((c.to_string(), t.to_string()));
            }
        });
        if let Some((field, table)) = dangling {
            return Err(OrmError::DanglingColumnReference { field, table });
        }
        self.predicate_fragment(pred, &scope)
    }

    fn output_clause(&self, output: &Output) -> Fragment {
        let mut f = Fragment::empty();
        match self.dialect.returning() {
            ReturningStyle::Output => {
                f.push("output ");
                for (i, col) in output.columns.iter().enumerate() {
                    if i > 0 {
                        f.push(", ");
                    }
                    f.push(col.image.as_str());
                    f.push(".");
                    f.push_ident(&col.column);
                }
            }
            ReturningStyle::Returning => {
                f.push("returning ");
                for (i, col) in output.columns.iter().enumerate() {
                    if i > 0 {
                        f.push(", ");
                    }
                    f.push_ident(&col.column);
                }
            }
        }
        f
    }
}

/// `fmt::Write` adapter targeting a fragment's trailing text token.
struct TextSink<'a>(&'a mut Fragment);

impl std::fmt::Write for TextSink<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.push(s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cte, Image, Join, JoinKind, OnConflict, OutputColumn, SetOp};
    use crate::dialect::{MsSql, Postgres};
    use crate::schema::{Column, ColumnType};
    use crate::value::SqlValue;

    fn users() -> Arc<Table> {
        Table::new("users")
            .column(Column::new("id", ColumnType::Int).identity())
            .column(Column::new("name", ColumnType::Text))
            .build()
    }

    fn posts() -> Arc<Table> {
        Table::new("posts")
            .column(Column::new("id", ColumnType::Int).identity())
            .column(Column::new("author_id", ColumnType::Int))
            .column(Column::new("title", ColumnType::Text))
            .build()
    }

    fn mssql() -> Compiler {
        Compiler::new(Arc::new(MsSql))
    }

    fn pg() -> Compiler {
        Compiler::new(Arc::new(Postgres))
    }

    fn users_select() -> SelectConfig {
        let mut cfg = SelectConfig::new(FromTarget::Table(users()));
        cfg.fields = vec![
            ("id".into(), Expr::col("users", "id")),
            ("name".into(), Expr::col("users", "name")),
        ];
        cfg
    }

    #[test]
    fn select_with_where_binds_params_in_order() {
        let mut cfg = users_select();
        cfg.where_clause = Some(Predicate::eq(Expr::col("users", "id"), 1_i64));

        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "select [id], [name] from [users] where [id] = @par0"
        );
        assert_eq!(c.params, vec![SqlValue::Int(1)]);
    }

    #[test]
    fn joins_force_qualified_columns() {
        let mut cfg = users_select();
        cfg.fields.push(("title".into(), Expr::col("posts", "title")));
        cfg.joins.push(Join {
            kind: JoinKind::Left,
            target: FromTarget::Table(posts()),
            on: Predicate::eq_col(Expr::col("posts", "author_id"), Expr::col("users", "id")),
            lateral: false,
        });

        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "select [users].[id], [users].[name], [posts].[title] from [users] \
             left join [posts] on [posts].[author_id] = [users].[id]"
        );
    }

    #[test]
    fn dangling_reference_is_rejected_before_text() {
        let mut cfg = users_select();
        cfg.where_clause = Some(Predicate::eq(Expr::col("posts", "id"), 1_i64));

        let err = mssql().build_select(&cfg).unwrap_err();
        assert!(matches!(
            err,
            OrmError::DanglingColumnReference { ref table, .. } if table == "posts"
        ));
    }

    #[test]
    fn empty_projection_is_rejected() {
        let cfg = SelectConfig::new(FromTarget::Table(users()));
        let err = mssql().build_select(&cfg).unwrap_err();
        assert!(matches!(err, OrmError::EmptyProjection { ref table } if table == "users"));
    }

    #[test]
    fn top_prefix_when_only_limit_is_set() {
        let mut cfg = users_select();
        cfg.limit = Some(10);
        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(c.text, "select top (10) [id], [name] from [users]");
    }

    #[test]
    fn offset_fetch_when_offset_is_set() {
        let mut cfg = users_select();
        cfg.order_by = vec![OrderBy::asc(Expr::col("users", "id"))];
        cfg.limit = Some(10);
        cfg.offset = Some(5);
        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "select [id], [name] from [users] order by [id] asc \
             offset 5 rows fetch next 10 rows only"
        );
    }

    #[test]
    fn offset_without_limit_renders_no_fetch_clause() {
        let mut cfg = users_select();
        cfg.order_by = vec![OrderBy::asc(Expr::col("users", "id"))];
        cfg.offset = Some(5);
        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "select [id], [name] from [users] order by [id] asc offset 5 rows"
        );
    }

    #[test]
    fn postgres_uses_limit_offset() {
        let mut cfg = users_select();
        cfg.limit = Some(10);
        cfg.offset = Some(5);
        let c = pg().build_select(&cfg).map(|f| f.to_text(&Postgres)).unwrap();
        assert_eq!(
            c.text,
            r#"select "id", "name" from "users" limit 10 offset 5"#
        );
    }

    #[test]
    fn ctes_precede_the_select() {
        let mut cfg = users_select();
        cfg.with.push(Cte {
            alias: "recent".into(),
            select: users_select(),
        });
        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "with [recent] as (select [id], [name] from [users]) \
             select [id], [name] from [users]"
        );
    }

    #[test]
    fn set_operation_folds_left_associatively() {
        let mut cfg = users_select();
        cfg.set_ops.push(SetOperation {
            op: SetOp::Union,
            all: true,
            select: users_select(),
            order_by: vec![OrderBy::desc(Expr::col("users", "id"))],
            limit: Some(3),
            offset: None,
        });

        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "(select [id], [name] from [users]) union all \
             (select [id], [name] from [users]) \
             order by [id] desc offset 0 rows fetch next 3 rows only"
        );
    }

    #[test]
    fn set_operation_rejects_mismatched_shapes() {
        let mut right = users_select();
        right.fields.reverse();
        let mut cfg = users_select();
        cfg.set_ops.push(SetOperation {
            op: SetOp::Union,
            all: false,
            select: right,
            order_by: vec![],
            limit: None,
            offset: None,
        });

        let err = mssql().build_select(&cfg).unwrap_err();
        assert!(matches!(err, OrmError::MismatchedSetOperatorShape { .. }));
    }

    #[test]
    fn insert_skips_identity_columns() {
        let cfg = InsertConfig {
            table: users(),
            rows: vec![vec![("name".into(), InsertValue::Value("John".into()))]],
            on_conflict: None,
            output: None,
        };
        let c = mssql().build_insert(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(c.text, "insert into [users] ([name]) values (@par0)");
        assert_eq!(c.params, vec![SqlValue::Text("John".into())]);
    }

    #[test]
    fn insert_missing_cell_becomes_default_keyword() {
        let table = Table::new("events")
            .column(Column::new("kind", ColumnType::Text))
            .column(Column::new("payload", ColumnType::Json))
            .build();
        let cfg = InsertConfig {
            table,
            rows: vec![vec![("kind".into(), InsertValue::Value("ping".into()))]],
            on_conflict: None,
            output: None,
        };
        let c = mssql().build_insert(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "insert into [events] ([kind], [payload]) values (@par0, default)"
        );
    }

    #[test]
    fn insert_output_sits_between_columns_and_values() {
        let cfg = InsertConfig {
            table: users(),
            rows: vec![vec![("name".into(), InsertValue::Value("John".into()))]],
            on_conflict: None,
            output: Some(Output::inserted(["id"])),
        };
        let c = mssql().build_insert(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "insert into [users] ([name]) output inserted.[id] values (@par0)"
        );
    }

    #[test]
    fn insert_returning_on_postgres() {
        let cfg = InsertConfig {
            table: users(),
            rows: vec![vec![("name".into(), InsertValue::Value("John".into()))]],
            on_conflict: None,
            output: Some(Output::inserted(["id"])),
        };
        let c = pg().build_insert(&cfg).map(|f| f.to_text(&Postgres)).unwrap();
        assert_eq!(
            c.text,
            r#"insert into "users" ("name") values ($1) returning "id""#
        );
    }

    #[test]
    fn on_conflict_requires_dialect_support() {
        let cfg = InsertConfig {
            table: users(),
            rows: vec![vec![("name".into(), InsertValue::Value("John".into()))]],
            on_conflict: Some(OnConflict {
                target: vec!["name".into()],
                action: ConflictAction::DoNothing,
            }),
            output: None,
        };
        assert!(mssql().build_insert(&cfg).is_err());

        let c = pg().build_insert(&cfg).map(|f| f.to_text(&Postgres)).unwrap();
        assert_eq!(
            c.text,
            r#"insert into "users" ("name") values ($1) on conflict ("name") do nothing"#
        );
    }

    #[test]
    fn update_later_set_entry_wins_and_unknown_keys_drop() {
        let cfg = UpdateConfig {
            table: users(),
            set: vec![
                ("name".into(), InsertValue::Value("a".into())),
                ("nope".into(), InsertValue::Value("x".into())),
                ("name".into(), InsertValue::Value("b".into())),
            ],
            where_clause: Some(Predicate::eq(Expr::col("users", "id"), 7_i64)),
            output: None,
        };
        let c = mssql().build_update(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "update [users] set [name] = @par0 where [id] = @par1"
        );
        assert_eq!(
            c.params,
            vec![SqlValue::Text("b".into()), SqlValue::Int(7)]
        );
    }

    #[test]
    fn update_touches_on_update_generators() {
        let table = Table::new("docs")
            .column(Column::new("id", ColumnType::Int).identity())
            .column(Column::new("body", ColumnType::Text))
            .column(Column::new("rev", ColumnType::Int).on_update_fn(|| SqlValue::Int(42)))
            .build();
        let cfg = UpdateConfig {
            table,
            set: vec![("body".into(), InsertValue::Value("x".into()))],
            where_clause: None,
            output: None,
        };
        let c = mssql().build_update(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(c.text, "update [docs] set [body] = @par0, [rev] = @par1");
        assert_eq!(c.params[1], SqlValue::Int(42));
    }

    #[test]
    fn delete_with_output_and_where() {
        let cfg = DeleteConfig {
            table: users(),
            where_clause: Some(Predicate::eq(Expr::col("users", "id"), 1_i64)),
            output: Some(Output {
                columns: vec![OutputColumn {
                    image: Image::Deleted,
                    column: "name".into(),
                }],
            }),
        };
        let c = mssql().build_delete(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "delete from [users] output deleted.[name] where [id] = @par0"
        );
    }

    #[test]
    fn update_where_rejects_foreign_columns() {
        let cfg = UpdateConfig {
            table: users(),
            set: vec![("name".into(), InsertValue::Value("a".into()))],
            where_clause: Some(Predicate::eq(Expr::col("posts", "id"), 1_i64)),
            output: None,
        };
        assert!(matches!(
            mssql().build_update(&cfg).unwrap_err(),
            OrmError::DanglingColumnReference { .. }
        ));
    }

    #[test]
    fn single_column_select_surfaces_the_column_decoder() {
        use crate::fragment::Decoder;

        let counters = Table::new("counters")
            .column(
                Column::new("value", ColumnType::Int)
                    .with_decoder(Decoder::new(|v| Ok(v))),
            )
            .build();

        // Directly, as the only projected column.
        let mut cfg = SelectConfig::new(FromTarget::Table(counters.clone()));
        cfg.fields = vec![("value".into(), Expr::col("counters", "value"))];
        let f = mssql().build_select(&cfg).unwrap();
        assert!(f.decoder().is_some());

        // Through a single-column subquery field.
        let mut inner = SelectConfig::new(FromTarget::Table(counters));
        inner.fields = vec![("value".into(), Expr::col("counters", "value"))];
        let mut outer = SelectConfig::new(FromTarget::Table(users()));
        outer.fields = vec![("value".into(), Expr::subquery(inner))];
        let f = mssql().build_select(&outer).unwrap();
        assert!(f.decoder().is_some());

        // Not with more than one column in the projection.
        let mut cfg = users_select();
        cfg.fields
            .push(("value".into(), Expr::col("users", "id")));
        let f = mssql().build_select(&cfg).unwrap();
        assert!(f.decoder().is_none());
    }

    #[test]
    fn in_list_renders_one_placeholder_per_value() {
        let mut cfg = users_select();
        cfg.where_clause = Some(Predicate::in_list(
            Expr::col("users", "id"),
            vec![1_i64, 2, 3],
        ));
        let c = mssql().build_select(&cfg).map(|f| f.to_text(&MsSql)).unwrap();
        assert_eq!(
            c.text,
            "select [id], [name] from [users] where [id] in (@par0, @par1, @par2)"
        );
        assert_eq!(c.params.len(), 3);
    }
}
