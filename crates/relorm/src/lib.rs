//! # relorm
//!
//! A dialect-aware SQL statement compiler and relational query planner.
//!
//! ## Layers
//!
//! - **Fragments**: immutable token streams (text, identifiers, bound
//!   parameters, nested fragments) rendered to dialect-correct text with
//!   position-stable placeholders
//! - **Compiler**: pure `config → fragment` translation for select / insert /
//!   update / delete, with joins, CTEs, set operations, pagination, and
//!   output/returning clauses
//! - **Planner**: eager-loading over a declared schema graph, expanding
//!   `with` requests into correlated JSON subqueries plus a selection map
//!   that folds rows back into nested objects
//! - **Session**: the async boundary — an [`Executor`] driver behind a
//!   serialized statement stream, with `transaction!` / `savepoint!` macros
//!
//! ## Example
//!
//! ```ignore
//! use relorm::{Compiler, Expr, MsSql, Predicate, Select};
//! use std::sync::Arc;
//!
//! let compiler = Compiler::new(Arc::new(MsSql));
//! let stmt = Select::from(users)
//!     .columns(["id", "name"])
//!     .filter(Predicate::eq(Expr::col("users", "id"), 1_i64))
//!     .compile(&compiler)?;
//! assert_eq!(stmt.text, "select [id], [name] from [users] where [id] = @par0");
//! ```

pub mod builder;
pub mod compiler;
pub mod config;
pub mod dialect;
pub mod error;
pub mod expr;
pub mod fragment;
pub mod migrate;
pub mod planner;
pub mod schema;
pub mod session;
pub mod value;

pub use builder::{Delete, Insert, Select, Update, except, intersect, union, union_all};
pub use compiler::Compiler;
pub use config::{
    ConflictAction, Cte, DeleteConfig, ForJson, FromTarget, Image, InsertConfig, InsertValue,
    Join, JoinKind, OnConflict, Output, OutputColumn, SelectConfig, SetOp, SetOperation,
    UpdateConfig,
};
pub use dialect::{Dialect, MsSql, PaginationStyle, Postgres, ReturningStyle};
pub use error::{OrmError, OrmResult};
pub use expr::{CompareOp, Direction, Expr, OrderBy, Predicate};
pub use fragment::{Arg, Compiled, Decoder, Fragment, Token};
pub use migrate::{MigrationFile, Migrator, content_hash, scan_dir};
pub use planner::{Extra, Plan, Planner, SelectionNode, SelectionSpec, WithSpec, reduce_rows};
pub use schema::{
    Column, ColumnType, Generator, Relation, RelationKind, Schema, SchemaBuilder, Table,
    ValueSource,
};
pub use session::{Executor, Row, Session, TxOutcome, rollback};
pub use value::SqlValue;

#[cfg(feature = "postgres")]
pub mod pg;
#[cfg(feature = "postgres")]
pub use pg::PgExecutor;
