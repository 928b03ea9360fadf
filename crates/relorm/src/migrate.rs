//! Migration bookkeeping.
//!
//! Applied migrations are recorded in a `migrations` table
//! `(id, hash, created_at)`. Local migrations are plain `.sql` files applied
//! in filename order; each pending file runs verbatim inside its own
//! transaction, followed by its bookkeeping row.

use crate::builder::{Insert, Select};
use crate::error::{OrmError, OrmResult};
use crate::expr::{Expr, OrderBy};
use crate::fragment::Fragment;
use crate::schema::{Column, ColumnType, Table};
use crate::session::{Executor, Session};
use crate::transaction;
use crate::value::SqlValue;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const TABLE: &str = "migrations";

/// One local migration: the file stem, its content hash, and the raw SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub id: String,
    pub hash: String,
    pub sql: String,
}

/// FNV-1a 64, rendered as fixed-width hex. Stable across runs and platforms,
/// which is all the bookkeeping hash needs.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

/// Read every `.sql` file in `dir`, sorted by filename. The filename stem is
/// the migration id, so ids sort the same way the files apply.
pub fn scan_dir(dir: &Path) -> OrmResult<Vec<MigrationFile>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| OrmError::Migration(format!("cannot read '{}': {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| OrmError::Migration(e.to_string()))?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "sql") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let sql = std::fs::read_to_string(&path)
            .map_err(|e| OrmError::Migration(format!("cannot read '{}': {e}", path.display())))?;
        files.push(MigrationFile {
            id: stem.to_string(),
            hash: content_hash(sql.as_bytes()),
            sql,
        });
    }
    files.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(files)
}

/// Applies pending migrations and maintains the bookkeeping table.
#[derive(Debug, Clone, Default)]
pub struct Migrator {
    schema: Option<String>,
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the bookkeeping table in a dedicated schema.
    pub fn in_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
        }
    }

    fn table(&self) -> Arc<Table> {
        let mut table = Table::new(TABLE)
            .column(Column::new("id", ColumnType::Text))
            .column(Column::new("hash", ColumnType::Text))
            .column(Column::new("created_at", ColumnType::Timestamp));
        if let Some(schema) = &self.schema {
            table = table.in_schema(schema.clone());
        }
        table.build()
    }

    async fn ensure_table<E: Executor>(&self, session: &mut Session<E>) -> OrmResult<()> {
        if let Some(schema) = &self.schema {
            let mut f = Fragment::raw("create schema if not exists ");
            f.push_ident(schema);
            session.execute(&f).await?;
        }
        let mut f = Fragment::raw("create table if not exists ");
        f.push_ident(&self.table().qualified_name());
        f.push(" (");
        f.push_ident("id");
        f.push(" text primary key, ");
        f.push_ident("hash");
        f.push(" text not null, ");
        f.push_ident("created_at");
        f.push(" timestamp not null)");
        session.execute(&f).await?;
        Ok(())
    }

    /// The id of the most recently applied migration, if any.
    pub async fn latest<E: Executor>(
        &self,
        session: &mut Session<E>,
    ) -> OrmResult<Option<String>> {
        let config = Select::from(self.table())
            .columns(["id", "hash"])
            .order_by(OrderBy::desc(Expr::col(TABLE, "id")))
            .limit(1)
            .build();
        let fragment = session.compiler().build_select(&config)?;
        let rows = session.query(&fragment).await?;
        match rows.first().and_then(|r| r.get("id")) {
            Some(SqlValue::Text(id)) => Ok(Some(id.clone())),
            Some(other) => Err(OrmError::decode(
                "id",
                format!("expected text migration id, got {other:?}"),
            )),
            None => Ok(None),
        }
    }

    fn record(&self, file: &MigrationFile) -> Insert {
        Insert::into(self.table()).values([
            ("id", SqlValue::from(file.id.as_str())),
            ("hash", SqlValue::from(file.hash.as_str())),
            ("created_at", SqlValue::Timestamp(chrono::Utc::now())),
        ])
    }

    /// Apply every migration newer than the latest bookkeeping row, each in
    /// its own transaction together with its bookkeeping insert.
    pub async fn run<E: Executor>(
        &self,
        session: &mut Session<E>,
        files: &[MigrationFile],
    ) -> OrmResult<usize> {
        self.ensure_table(session).await?;
        let latest = self.latest(session).await?;
        let mut applied = 0;
        for file in files {
            if latest.as_deref().is_some_and(|l| file.id.as_str() <= l) {
                debug!(id = %file.id, "already applied, skipping");
                continue;
            }
            let record = self
                .record(file)
                .build();
            let insert = session.compiler().build_insert(&record)?;
            let outcome: crate::TxOutcome<()> = transaction!(session, {
                session.executor_mut().batch(&file.sql).await?;
                session.execute(&insert).await?;
                Ok(())
            })?;
            debug_assert!(matches!(outcome, crate::TxOutcome::Committed(())));
            info!(id = %file.id, "applied migration");
            applied += 1;
        }
        Ok(applied)
    }

    /// Seed the bookkeeping table against an existing database: record the
    /// single local migration as applied, without running its SQL.
    ///
    /// Fails fast, mutating nothing, when the database already has
    /// bookkeeping rows or more than one local file exists.
    pub async fn init<E: Executor>(
        &self,
        session: &mut Session<E>,
        files: &[MigrationFile],
    ) -> OrmResult<()> {
        let [file] = files else {
            return Err(OrmError::Migration(format!(
                "init requires exactly one local migration file, found {}",
                files.len()
            )));
        };
        self.ensure_table(session).await?;
        if self.latest(session).await?.is_some() {
            return Err(OrmError::Migration(
                "database already has migration bookkeeping rows".into(),
            ));
        }
        let record = self.record(file).build();
        let insert = session.compiler().build_insert(&record)?;
        session.execute(&insert).await?;
        info!(id = %file.id, "seeded migration bookkeeping");
        Ok(())
    }
}
