//! Sessions: the asynchronous boundary below the compiler.
//!
//! A [`Session`] pairs a driver-side [`Executor`] with a [`Compiler`] and
//! serializes every statement it issues onto that one executor, in order.
//! Transactions and savepoints are plain statements generated by the dialect,
//! wrapped by the [`transaction!`](crate::transaction) and
//! [`savepoint!`](crate::savepoint) macros.

use crate::compiler::Compiler;
use crate::error::{OrmError, OrmResult};
use crate::fragment::{Compiled, Fragment};
use crate::planner::{Plan, reduce_rows};
use crate::value::SqlValue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// One result row: column names aligned with decoded values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
    }

    pub fn value(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A driver capable of running compiled statements.
///
/// Statements issued through one executor must run in issue order; later
/// statements may depend on earlier side effects.
pub trait Executor: Send {
    fn query(&mut self, stmt: &Compiled) -> impl Future<Output = OrmResult<Vec<Row>>> + Send;

    fn execute(&mut self, stmt: &Compiled) -> impl Future<Output = OrmResult<u64>> + Send;

    /// Run raw SQL verbatim, possibly several statements (migrations).
    fn batch(&mut self, sql: &str) -> impl Future<Output = OrmResult<()>> + Send;
}

/// How a transaction block finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome<T> {
    Committed(T),
    /// The block asked for a rollback via [`rollback`]; not an error.
    RolledBack,
}

impl<T> TxOutcome<T> {
    pub fn committed(self) -> Option<T> {
        match self {
            TxOutcome::Committed(v) => Some(v),
            TxOutcome::RolledBack => None,
        }
    }
}

/// The rollback control signal for use inside `transaction!` blocks.
pub fn rollback<T>() -> OrmResult<T> {
    Err(OrmError::TransactionRollback)
}

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

#[doc(hidden)]
pub fn __next_savepoint_name() -> String {
    let n = SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("relorm_sp_{n}")
}

/// One logical connection: an executor plus the compiler that feeds it.
#[derive(Debug)]
pub struct Session<E> {
    executor: E,
    compiler: Compiler,
}

impl<E: Executor> Session<E> {
    pub fn new(executor: E, compiler: Compiler) -> Self {
        Self { executor, compiler }
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub async fn query(&mut self, fragment: &Fragment) -> OrmResult<Vec<Row>> {
        let stmt = self.compiler.to_text(fragment);
        debug!(text = %stmt.text, params = stmt.params.len(), "query");
        let mut rows = self.executor.query(&stmt).await?;
        // A fragment carrying a decoder stands for one output column; apply
        // it to that column of every returned row.
        if let Some(decoder) = fragment.decoder() {
            for row in &mut rows {
                if let Some(value) = row.values.first_mut() {
                    *value = decoder.apply(std::mem::replace(value, SqlValue::Null))?;
                }
            }
        }
        Ok(rows)
    }

    pub async fn execute(&mut self, fragment: &Fragment) -> OrmResult<u64> {
        let stmt = self.compiler.to_text(fragment);
        debug!(text = %stmt.text, params = stmt.params.len(), "execute");
        self.executor.execute(&stmt).await
    }

    /// Run a planned relational query and fold the rows into nested objects.
    pub async fn query_plan(&mut self, plan: &Plan) -> OrmResult<Vec<serde_json::Value>> {
        debug!(text = %plan.compiled.text, "query plan");
        let rows = self.executor.query(&plan.compiled).await?;
        reduce_rows(&plan.selection, &rows)
    }

    async fn run_control(&mut self, sql: String) -> OrmResult<()> {
        let stmt = Compiled {
            text: sql,
            params: Vec::new(),
        };
        self.executor.execute(&stmt).await?;
        Ok(())
    }

    pub async fn begin(&mut self) -> OrmResult<()> {
        let sql = self.compiler.dialect().begin_stmt().to_string();
        self.run_control(sql).await
    }

    pub async fn commit(&mut self) -> OrmResult<()> {
        let sql = self.compiler.dialect().commit_stmt().to_string();
        self.run_control(sql).await
    }

    pub async fn rollback(&mut self) -> OrmResult<()> {
        let sql = self.compiler.dialect().rollback_stmt().to_string();
        self.run_control(sql).await
    }

    pub async fn savepoint(&mut self, name: &str) -> OrmResult<()> {
        let sql = self.compiler.dialect().savepoint_stmt(name);
        self.run_control(sql).await
    }

    pub async fn release_savepoint(&mut self, name: &str) -> OrmResult<()> {
        match self.compiler.dialect().release_savepoint_stmt(name) {
            Some(sql) => self.run_control(sql).await,
            None => Ok(()),
        }
    }

    pub async fn rollback_to_savepoint(&mut self, name: &str) -> OrmResult<()> {
        let sql = self.compiler.dialect().rollback_savepoint_stmt(name);
        self.run_control(sql).await
    }
}

/// Runs the given block inside a transaction on `$session`.
///
/// - Issues the dialect's begin statement.
/// - Commits on `Ok(_)` and yields `TxOutcome::Committed`.
/// - A [`rollback()`](rollback) signal from the block rolls back and yields
///   `TxOutcome::RolledBack` — a normal outcome, not an error.
/// - Any other error rolls back and propagates.
///
/// The block must evaluate to `relorm::OrmResult<T>`.
#[macro_export]
macro_rules! transaction {
    ($session:expr, $body:block) => {{
        ($session).begin().await?;
        let __relorm_tx_body_result: $crate::OrmResult<_> = async { $body }.await;
        match __relorm_tx_body_result {
            Ok(value) => {
                ($session).commit().await?;
                Ok($crate::TxOutcome::Committed(value))
            }
            Err(error) if error.is_rollback() => {
                ($session).rollback().await?;
                Ok($crate::TxOutcome::RolledBack)
            }
            Err(error) => match ($session).rollback().await {
                Ok(()) => Err(error),
                Err(rollback_err) => Err($crate::OrmError::Other(format!(
                    "{error} (rollback failed: {rollback_err})"
                ))),
            },
        }
    }};
}

/// Runs the given block inside a savepoint within an open transaction.
///
/// - Creates a savepoint on `$session` (named, or generated when omitted).
/// - Releases it on `Ok(_)`.
/// - Rolls back to it on a rollback signal, yielding `TxOutcome::RolledBack`
///   while the outer transaction stays usable.
/// - Any other error rolls back to the savepoint and propagates.
#[macro_export]
macro_rules! savepoint {
    // Named savepoint
    ($session:expr, $name:expr, $body:block) => {{
        let __relorm_sp_name: &str = $name;
        ($session).savepoint(__relorm_sp_name).await?;
        let __relorm_sp_body_result: $crate::OrmResult<_> = async { $body }.await;
        match __relorm_sp_body_result {
            Ok(value) => {
                ($session).release_savepoint(__relorm_sp_name).await?;
                Ok($crate::TxOutcome::Committed(value))
            }
            Err(error) if error.is_rollback() => {
                ($session).rollback_to_savepoint(__relorm_sp_name).await?;
                Ok($crate::TxOutcome::RolledBack)
            }
            Err(error) => match ($session).rollback_to_savepoint(__relorm_sp_name).await {
                Ok(()) => Err(error),
                Err(rollback_err) => Err($crate::OrmError::Other(format!(
                    "{error} (savepoint rollback failed: {rollback_err})"
                ))),
            },
        }
    }};
    // Anonymous savepoint
    ($session:expr, $body:block) => {{
        let __relorm_sp_name = $crate::session::__next_savepoint_name();
        $crate::savepoint!($session, &__relorm_sp_name, $body)
    }};
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedExecutor;
    use super::*;
    use crate::dialect::MsSql;
    use std::sync::Arc;

    fn session() -> Session<ScriptedExecutor> {
        Session::new(
            ScriptedExecutor::default(),
            Compiler::new(Arc::new(MsSql)),
        )
    }

    async fn committed_tx(session: &mut Session<ScriptedExecutor>) -> OrmResult<TxOutcome<i64>> {
        transaction!(session, { Ok(7_i64) })
    }

    async fn rolled_back_tx(session: &mut Session<ScriptedExecutor>) -> OrmResult<TxOutcome<i64>> {
        transaction!(session, {
            if true {
                return rollback();
            }
            Ok(0_i64)
        })
    }

    #[tokio::test]
    async fn transaction_commits_on_ok() {
        let mut s = session();
        let outcome = committed_tx(&mut s).await.unwrap();
        assert_eq!(outcome, TxOutcome::Committed(7));
        assert_eq!(
            s.executor_mut().statements,
            vec!["begin transaction", "commit"]
        );
    }

    #[tokio::test]
    async fn rollback_signal_is_a_normal_outcome() {
        let mut s = session();
        let outcome = rolled_back_tx(&mut s).await.unwrap();
        assert_eq!(outcome, TxOutcome::RolledBack);
        assert_eq!(
            s.executor_mut().statements,
            vec!["begin transaction", "rollback"]
        );
    }

    async fn failing_tx(session: &mut Session<ScriptedExecutor>) -> OrmResult<TxOutcome<i64>> {
        transaction!(session, {
            Err::<i64, _>(OrmError::Driver("constraint violation".into()))
        })
    }

    #[tokio::test]
    async fn other_errors_roll_back_and_propagate() {
        let mut s = session();
        let err = failing_tx(&mut s).await.unwrap_err();
        assert!(matches!(err, OrmError::Driver(_)));
        assert_eq!(
            s.executor_mut().statements,
            vec!["begin transaction", "rollback"]
        );
    }

    async fn tx_with_savepoint(
        session: &mut Session<ScriptedExecutor>,
    ) -> OrmResult<TxOutcome<i64>> {
        transaction!(session, {
            let inner: TxOutcome<()> = savepoint!(session, "sp_inner", { rollback() })?;
            assert_eq!(inner, TxOutcome::RolledBack);
            Ok(1_i64)
        })
    }

    #[tokio::test]
    async fn savepoint_rollback_keeps_outer_transaction_alive() {
        let mut s = session();
        let outcome = tx_with_savepoint(&mut s).await.unwrap();
        assert_eq!(outcome, TxOutcome::Committed(1));
        assert_eq!(
            s.executor_mut().statements,
            vec![
                "begin transaction",
                "save transaction sp_inner",
                "rollback transaction sp_inner",
                "commit",
            ]
        );
    }

    #[tokio::test]
    async fn statements_run_in_issue_order() {
        let mut s = session();
        let mut f = Fragment::raw("select 1");
        f.push(" as ");
        f.push_ident("one");
        s.query(&f).await.unwrap();
        s.execute(&Fragment::raw("delete from t")).await.unwrap();
        assert_eq!(
            s.executor_mut().statements,
            vec!["select 1 as [one]", "delete from t"]
        );
    }

    #[tokio::test]
    async fn query_applies_a_single_column_fragment_decoder() {
        use crate::fragment::Decoder;

        let rows = vec![vec![
            Row::new(vec!["n".into()], vec![SqlValue::Int(2)]),
            Row::new(vec!["n".into()], vec![SqlValue::Int(3)]),
        ]];
        let mut s = Session::new(
            ScriptedExecutor::with_rows(rows),
            Compiler::new(Arc::new(MsSql)),
        );

        let fragment = Fragment::raw("select n from t").with_decoder(Decoder::new(|v| match v {
            SqlValue::Int(n) => Ok(SqlValue::Int(n * 10)),
            other => Ok(other),
        }));
        let rows = s.query(&fragment).await.unwrap();
        assert_eq!(rows[0].value(0), Some(&SqlValue::Int(20)));
        assert_eq!(rows[1].value(0), Some(&SqlValue::Int(30)));
    }

    #[tokio::test]
    async fn anonymous_savepoint_names_are_unique() {
        let a = __next_savepoint_name();
        let b = __next_savepoint_name();
        assert_ne!(a, b);
    }
}
