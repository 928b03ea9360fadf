//! SQL fragments: immutable token streams with position-stable parameters.
//!
//! A [`Fragment`] stores SQL pieces and bound parameters as one ordered token
//! list. Placeholder numbering is never done by string manipulation: the
//! indices are assigned in a single left-to-right traversal at render time
//! ([`Fragment::to_text`]), so composing fragments can never reorder or
//! collapse parameters.
//!
//! # Example
//!
//! ```ignore
//! use relorm::{Fragment, MsSql};
//!
//! let mut q = Fragment::raw("select ");
//! q.push_ident("id");
//! q.push(" from ");
//! q.push_ident("users");
//! q.push(" where ");
//! q.push_ident("id");
//! q.push(" = ");
//! q.push_param(1_i64);
//!
//! let compiled = q.to_text(&MsSql);
//! assert_eq!(compiled.text, "select [id] from [users] where [id] = @par0");
//! ```

use crate::dialect::Dialect;
use crate::error::{OrmError, OrmResult};
use crate::value::SqlValue;
use serde::Serialize;
use std::sync::Arc;

/// A value transform applied to a single returned column.
#[derive(Clone)]
pub struct Decoder(Arc<dyn Fn(SqlValue) -> OrmResult<SqlValue> + Send + Sync>);

impl Decoder {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(SqlValue) -> OrmResult<SqlValue> + Send + Sync + 'static,
    {
        Decoder(Arc::new(f))
    }

    pub fn apply(&self, value: SqlValue) -> OrmResult<SqlValue> {
        (self.0)(value)
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Decoder").field(&"<fn>").finish()
    }
}

/// One element of a fragment's token stream.
#[derive(Debug, Clone)]
pub enum Token {
    /// Raw SQL text, emitted as-is.
    Text(String),
    /// An identifier path, quoted per dialect at render time.
    Ident(String),
    /// A string literal, escaped per dialect at render time.
    Literal(String),
    /// A bound parameter; each one owns exactly one placeholder slot.
    Param(SqlValue),
    /// A nested fragment, spliced in place.
    Nested(Fragment),
}

/// An immutable ordered token sequence representing part or all of a SQL
/// statement, prior to final text rendering.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    tokens: Vec<Token>,
    decoder: Option<Decoder>,
}

/// Final statement text plus its ordered parameter list.
///
/// Serializable, for statement snapshots and structured query logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Compiled {
    pub text: String,
    pub params: Vec<SqlValue>,
}

/// An interpolation argument: either a bare value (auto-wrapped as a
/// parameter) or a sub-fragment (spliced as nested).
#[derive(Debug, Clone)]
pub enum Arg {
    Value(SqlValue),
    Fragment(Fragment),
}

impl From<SqlValue> for Arg {
    fn from(v: SqlValue) -> Self {
        Arg::Value(v)
    }
}

impl From<Fragment> for Arg {
    fn from(f: Fragment) -> Self {
        Arg::Fragment(f)
    }
}

macro_rules! impl_arg_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(v: $ty) -> Self {
                    Arg::Value(SqlValue::from(v))
                }
            }
        )+
    };
}

impl_arg_from!(bool, i16, i32, i64, f32, f64, &str, String, uuid::Uuid);

impl Fragment {
    /// Create an empty fragment (zero tokens).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a fragment from raw SQL text.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            tokens: vec![Token::Text(sql.into())],
            decoder: None,
        }
    }

    /// Create a fragment holding one identifier path.
    pub fn ident(path: impl Into<String>) -> Self {
        Self {
            tokens: vec![Token::Ident(path.into())],
            decoder: None,
        }
    }

    /// Create a fragment holding one bound parameter.
    pub fn param(value: impl Into<SqlValue>) -> Self {
        Self {
            tokens: vec![Token::Param(value.into())],
            decoder: None,
        }
    }

    /// Create a fragment holding one string literal.
    pub fn literal(s: impl Into<String>) -> Self {
        Self {
            tokens: vec![Token::Literal(s.into())],
            decoder: None,
        }
    }

    /// Attach a result decoder for when this fragment stands for one output
    /// column.
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn decoder(&self) -> Option<&Decoder> {
        self.decoder.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Append raw SQL, merging with a trailing text token.
    pub fn push(&mut self, sql: &str) -> &mut Self {
        if sql.is_empty() {
            return self;
        }
        match self.tokens.last_mut() {
            Some(Token::Text(last)) => last.push_str(sql),
            _ => self.tokens.push(Token::Text(sql.to_string())),
        }
        self
    }

    /// Append an identifier path.
    pub fn push_ident(&mut self, path: &str) -> &mut Self {
        self.tokens.push(Token::Ident(path.to_string()));
        self
    }

    /// Append a bound parameter.
    pub fn push_param(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.tokens.push(Token::Param(value.into()));
        self
    }

    /// Append a string literal.
    pub fn push_literal(&mut self, s: &str) -> &mut Self {
        self.tokens.push(Token::Literal(s.to_string()));
        self
    }

    /// Append another fragment, consuming it.
    ///
    /// This is the builder-internal mutation point; externally fragments are
    /// treated as immutable values.
    pub fn append(&mut self, more: Fragment) -> &mut Self {
        if !more.is_empty() {
            self.tokens.push(Token::Nested(more));
        }
        self
    }

    /// Build a fragment from a template-like sequence of text parts and
    /// interpolated arguments.
    ///
    /// `parts.len()` must equal `values.len() + 1`; the resulting token order
    /// is `Text, value, Text, value, …, Text`.
    pub fn interpolate(parts: &[&str], values: Vec<Arg>) -> OrmResult<Fragment> {
        if parts.len() != values.len() + 1 {
            return Err(OrmError::validation(format!(
                "interpolate: {} parts cannot hold {} values",
                parts.len(),
                values.len()
            )));
        }
        let mut out = Fragment::empty();
        let mut values = values.into_iter();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                match values.next() {
                    Some(Arg::Value(v)) => {
                        out.tokens.push(Token::Param(v));
                    }
                    Some(Arg::Fragment(f)) => {
                        out.append(f);
                    }
                    None => unreachable!(),
                }
            }
            out.push(part);
        }
        Ok(out)
    }

    /// Concatenate fragments with a separator between each pair.
    ///
    /// An empty input yields an empty fragment, not an error.
    pub fn join(fragments: Vec<Fragment>, separator: &Fragment) -> Fragment {
        let mut out = Fragment::empty();
        for (i, f) in fragments.into_iter().enumerate() {
            if i > 0 {
                out.append(separator.clone());
            }
            out.append(f);
        }
        out
    }

    /// Render to final text plus the ordered parameter list.
    ///
    /// The single traversal point: identifier quoting, placeholder numbering,
    /// and literal escaping all happen here. Pure and idempotent — calling
    /// twice yields identical output.
    pub fn to_text(&self, dialect: &dyn Dialect) -> Compiled {
        let mut text = String::new();
        let mut params = Vec::new();
        self.render(dialect, &mut text, &mut params);
        Compiled { text, params }
    }

    fn render(&self, dialect: &dyn Dialect, text: &mut String, params: &mut Vec<SqlValue>) {
        for token in &self.tokens {
            match token {
                Token::Text(s) => text.push_str(s),
                Token::Ident(path) => dialect.quote_path(path, text),
                Token::Literal(s) => {
                    text.push('\'');
                    text.push_str(&dialect.escape_string(s));
                    text.push('\'');
                }
                Token::Param(value) => {
                    dialect.placeholder(params.len(), text);
                    params.push(value.clone());
                }
                Token::Nested(f) => f.render(dialect, text, params),
            }
        }
    }

    /// The fragment's own parameters in token order, without rendering text.
    pub fn params(&self) -> Vec<&SqlValue> {
        let mut out = Vec::new();
        self.collect_params(&mut out);
        out
    }

    fn collect_params<'a>(&'a self, out: &mut Vec<&'a SqlValue>) {
        for token in &self.tokens {
            match token {
                Token::Param(v) => out.push(v),
                Token::Nested(f) => f.collect_params(out),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MsSql, Postgres};

    fn where_id(v: i64) -> Fragment {
        let mut f = Fragment::empty();
        f.push_ident("id").push(" = ").push_param(v);
        f
    }

    #[test]
    fn placeholders_follow_token_order() {
        let mut q = Fragment::raw("select * from ");
        q.push_ident("users");
        q.push(" where ");
        q.push_ident("a");
        q.push(" = ");
        q.push_param(1_i64);
        q.push(" and ");
        q.push_ident("b");
        q.push(" = ");
        q.push_param("x");

        let c = q.to_text(&MsSql);
        assert_eq!(
            c.text,
            "select * from [users] where [a] = @par0 and [b] = @par1"
        );
        assert_eq!(c.params, vec![SqlValue::Int(1), SqlValue::Text("x".into())]);
    }

    #[test]
    fn join_preserves_param_order() {
        let a = where_id(1);
        let b = where_id(2);
        let expected: Vec<SqlValue> = a
            .params()
            .into_iter()
            .chain(b.params())
            .cloned()
            .collect();

        let joined = Fragment::join(vec![a, b], &Fragment::raw(" and "));
        let got: Vec<SqlValue> = joined.params().into_iter().cloned().collect();
        assert_eq!(got, expected);

        let c = joined.to_text(&MsSql);
        assert_eq!(c.text, "[id] = @par0 and [id] = @par1");
    }

    #[test]
    fn join_of_nothing_is_empty() {
        let joined = Fragment::join(vec![], &Fragment::raw(", "));
        assert!(joined.is_empty());
        assert_eq!(joined.to_text(&MsSql).text, "");
    }

    #[test]
    fn to_text_is_idempotent() {
        let mut q = Fragment::raw("update ");
        q.push_ident("users");
        q.push(" set ");
        q.push_ident("name");
        q.push(" = ");
        q.push_param("alice");

        let first = q.to_text(&Postgres);
        let second = q.to_text(&Postgres);
        assert_eq!(first, second);
        assert_eq!(first.text, r#"update "users" set "name" = $1"#);
    }

    #[test]
    fn interpolate_alternates_text_and_values() {
        let f = Fragment::interpolate(
            &["select * from t where a = ", " and b in (", ")"],
            vec![Arg::from(5_i64), Arg::Fragment(Fragment::param(7_i64))],
        )
        .unwrap();
        let c = f.to_text(&Postgres);
        assert_eq!(c.text, "select * from t where a = $1 and b in ($2)");
        assert_eq!(c.params, vec![SqlValue::Int(5), SqlValue::Int(7)]);
    }

    #[test]
    fn interpolate_rejects_slot_mismatch() {
        assert!(Fragment::interpolate(&["a", "b"], vec![]).is_err());
    }

    #[test]
    fn null_param_still_occupies_a_slot() {
        let mut q = Fragment::raw("insert into t values (");
        q.push_param(SqlValue::Null);
        q.push(", ");
        q.push_param(2_i64);
        q.push(")");

        let c = q.to_text(&MsSql);
        assert_eq!(c.text, "insert into t values (@par0, @par1)");
        assert_eq!(c.params, vec![SqlValue::Null, SqlValue::Int(2)]);
    }

    #[test]
    fn compiled_statements_serialize_as_plain_json() {
        let mut q = Fragment::raw("select * from t where a = ");
        q.push_param(1_i64);
        q.push(" and b = ");
        q.push_param("x");

        let snapshot = serde_json::to_value(q.to_text(&MsSql)).unwrap();
        assert_eq!(
            snapshot,
            serde_json::json!({
                "text": "select * from t where a = @par0 and b = @par1",
                "params": [1, "x"],
            })
        );
    }

    #[test]
    fn literals_are_escaped_at_render_time() {
        let mut q = Fragment::raw("select ");
        q.push_literal("O'Brien");
        assert_eq!(q.to_text(&MsSql).text, "select 'O''Brien'");
    }
}
