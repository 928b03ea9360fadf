//! SQL dialects.
//!
//! A [`Dialect`] carries the textual rules that distinguish one target engine
//! from another: identifier quoting, parameter placeholder syntax,
//! string-literal escaping, pagination syntax, and the returning-clause style.
//! Everything else in the compiler is dialect-independent.

use std::fmt::Write;

/// How a dialect paginates a SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStyle {
    /// `limit n offset m` suffix.
    LimitOffset,
    /// `top (n)` prefix when only a limit is requested; `offset n rows
    /// [fetch next m rows only]` suffix when an offset is present.
    TopOffsetFetch,
}

/// How a dialect returns affected rows from insert/update/delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturningStyle {
    /// Inline `output inserted.x, deleted.y` clause.
    Output,
    /// Trailing `returning x, y` clause.
    Returning,
}

/// Textual rules for one target SQL engine.
pub trait Dialect: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Quote one identifier segment (no dots) into `out`.
    fn quote_ident(&self, name: &str, out: &mut String);

    /// Append the placeholder for the parameter at `index` (0-based).
    fn placeholder(&self, index: usize, out: &mut String);

    /// Escape a string literal (content only, no surrounding quotes).
    fn escape_string(&self, s: &str) -> String;

    fn pagination(&self) -> PaginationStyle;

    fn returning(&self) -> ReturningStyle;

    /// Whether `insert ... on conflict` is supported.
    fn supports_on_conflict(&self) -> bool {
        false
    }

    /// The clause turning a subquery into a single JSON value, if the engine
    /// has one. `single` requests object (not array) output.
    fn for_json_clause(&self, single: bool) -> Option<&'static str> {
        let _ = single;
        None
    }

    fn begin_stmt(&self) -> &'static str;

    fn commit_stmt(&self) -> &'static str {
        "commit"
    }

    fn rollback_stmt(&self) -> &'static str {
        "rollback"
    }

    fn savepoint_stmt(&self, name: &str) -> String {
        format!("savepoint {name}")
    }

    /// `None` when the engine has no release statement (savepoints are then
    /// discarded at commit).
    fn release_savepoint_stmt(&self, name: &str) -> Option<String> {
        Some(format!("release savepoint {name}"))
    }

    fn rollback_savepoint_stmt(&self, name: &str) -> String {
        format!("rollback to savepoint {name}")
    }

    /// Quote a possibly dotted path (`schema.table`, `alias.column`).
    fn quote_path(&self, path: &str, out: &mut String) {
        for (i, seg) in path.split('.').enumerate() {
            if i > 0 {
                out.push('.');
            }
            self.quote_ident(seg, out);
        }
    }
}

/// SQL Server style: `[ident]` quoting, `@par0` placeholders,
/// `top` / `offset ... fetch` pagination, inline `output` clause,
/// `for json path` nesting.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsSql;

impl Dialect for MsSql {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn quote_ident(&self, name: &str, out: &mut String) {
        out.push('[');
        for c in name.chars() {
            if c == ']' {
                out.push(']');
            }
            out.push(c);
        }
        out.push(']');
    }

    fn placeholder(&self, index: usize, out: &mut String) {
        let _ = write!(out, "@par{index}");
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }

    fn pagination(&self) -> PaginationStyle {
        PaginationStyle::TopOffsetFetch
    }

    fn returning(&self) -> ReturningStyle {
        ReturningStyle::Output
    }

    fn for_json_clause(&self, single: bool) -> Option<&'static str> {
        if single {
            Some(" for json path, without_array_wrapper")
        } else {
            Some(" for json path")
        }
    }

    fn begin_stmt(&self) -> &'static str {
        "begin transaction"
    }

    fn savepoint_stmt(&self, name: &str) -> String {
        format!("save transaction {name}")
    }

    fn release_savepoint_stmt(&self, _name: &str) -> Option<String> {
        None
    }

    fn rollback_savepoint_stmt(&self, name: &str) -> String {
        format!("rollback transaction {name}")
    }
}

/// PostgreSQL style: `"ident"` quoting, `$1` placeholders, `limit`/`offset`
/// pagination, trailing `returning` clause, `on conflict` upserts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_ident(&self, name: &str, out: &mut String) {
        out.push('"');
        for c in name.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
    }

    fn placeholder(&self, index: usize, out: &mut String) {
        let _ = write!(out, "${}", index + 1);
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }

    fn pagination(&self) -> PaginationStyle {
        PaginationStyle::LimitOffset
    }

    fn returning(&self) -> ReturningStyle {
        ReturningStyle::Returning
    }

    fn supports_on_conflict(&self) -> bool {
        true
    }

    fn begin_stmt(&self) -> &'static str {
        "begin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mssql_quoting_escapes_closing_bracket() {
        let mut out = String::new();
        MsSql.quote_ident("we]ird", &mut out);
        assert_eq!(out, "[we]]ird]");
    }

    #[test]
    fn mssql_placeholders_are_zero_based() {
        let mut out = String::new();
        MsSql.placeholder(0, &mut out);
        MsSql.placeholder(1, &mut out);
        assert_eq!(out, "@par0@par1");
    }

    #[test]
    fn postgres_placeholders_are_one_based() {
        let mut out = String::new();
        Postgres.placeholder(0, &mut out);
        assert_eq!(out, "$1");
    }

    #[test]
    fn dotted_paths_quote_each_segment() {
        let mut out = String::new();
        MsSql.quote_path("app.users", &mut out);
        assert_eq!(out, "[app].[users]");

        let mut out = String::new();
        Postgres.quote_path("app.users", &mut out);
        assert_eq!(out, r#""app"."users""#);
    }

    #[test]
    fn string_escaping_doubles_quotes() {
        assert_eq!(MsSql.escape_string("O'Brien"), "O''Brien");
    }
}
