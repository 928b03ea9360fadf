//! tokio-postgres [`Executor`] adapter.
//!
//! The caller owns connection setup (and drives the connection future);
//! this module only maps [`SqlValue`] onto the driver's binary protocol in
//! both directions.

use crate::error::{OrmError, OrmResult};
use crate::fragment::Compiled;
use crate::session::{Executor, Row};
use crate::value::SqlValue;
use bytes::BytesMut;
use tokio_postgres::Client;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tracing::trace;

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) if *ty == Type::INT2 => (*v as i16).to_sql(ty, out),
            SqlValue::Int(v) if *ty == Type::INT4 => (*v as i32).to_sql(ty, out),
            SqlValue::Int(v) => v.to_sql(ty, out),
            SqlValue::Float(v) if *ty == Type::FLOAT4 => (*v as f32).to_sql(ty, out),
            SqlValue::Float(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) if *ty == Type::TIMESTAMP => {
                v.naive_utc().to_sql(ty, out)
            }
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Acceptance is per-value, checked in to_sql above.
        true
    }

    to_sql_checked!();
}

fn from_db_error(error: tokio_postgres::Error) -> OrmError {
    OrmError::Driver(error.to_string())
}

fn decode_cell(row: &tokio_postgres::Row, index: usize) -> OrmResult<SqlValue> {
    let column = row.columns()[index].name();
    let ty = row.columns()[index].type_();
    let err = |e: tokio_postgres::Error| OrmError::decode(column, e.to_string());

    macro_rules! cell {
        ($ty:ty, $wrap:expr) => {
            row.try_get::<_, Option<$ty>>(index)
                .map_err(err)?
                .map($wrap)
                .unwrap_or(SqlValue::Null)
        };
    }

    Ok(if *ty == Type::BOOL {
        cell!(bool, SqlValue::Bool)
    } else if *ty == Type::INT2 {
        cell!(i16, |v| SqlValue::Int(v.into()))
    } else if *ty == Type::INT4 {
        cell!(i32, |v| SqlValue::Int(v.into()))
    } else if *ty == Type::INT8 {
        cell!(i64, SqlValue::Int)
    } else if *ty == Type::FLOAT4 {
        cell!(f32, |v| SqlValue::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        cell!(f64, SqlValue::Float)
    } else if *ty == Type::BYTEA {
        cell!(Vec<u8>, SqlValue::Bytes)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        cell!(serde_json::Value, SqlValue::Json)
    } else if *ty == Type::UUID {
        cell!(uuid::Uuid, SqlValue::Uuid)
    } else if *ty == Type::TIMESTAMPTZ {
        cell!(chrono::DateTime<chrono::Utc>, SqlValue::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        cell!(chrono::NaiveDateTime, |v| SqlValue::Timestamp(v.and_utc()))
    } else if *ty == Type::DATE {
        cell!(chrono::NaiveDate, SqlValue::Date)
    } else {
        cell!(String, SqlValue::Text)
    })
}

fn decode_row(row: &tokio_postgres::Row) -> OrmResult<Row> {
    let columns = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = (0..row.len())
        .map(|i| decode_cell(row, i))
        .collect::<OrmResult<Vec<_>>>()?;
    Ok(Row::new(columns, values))
}

/// [`Executor`] over one `tokio_postgres::Client`.
pub struct PgExecutor {
    client: Client,
}

impl std::fmt::Debug for PgExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgExecutor").finish_non_exhaustive()
    }
}

impl PgExecutor {
    /// Wrap an already-connected client. The caller keeps driving the
    /// connection future.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Executor for PgExecutor {
    async fn query(&mut self, stmt: &Compiled) -> OrmResult<Vec<Row>> {
        trace!(text = %stmt.text, "pg query");
        let params: Vec<&(dyn ToSql + Sync)> = stmt
            .params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(&stmt.text, &params)
            .await
            .map_err(from_db_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, stmt: &Compiled) -> OrmResult<u64> {
        trace!(text = %stmt.text, "pg execute");
        let params: Vec<&(dyn ToSql + Sync)> = stmt
            .params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();
        self.client
            .execute(&stmt.text, &params)
            .await
            .map_err(from_db_error)
    }

    async fn batch(&mut self, sql: &str) -> OrmResult<()> {
        trace!("pg batch");
        self.client.batch_execute(sql).await.map_err(from_db_error)
    }
}
