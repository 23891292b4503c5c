//! Schema migrations.
//!
//! Every statement in [`super::schema`] is one migration, applied inside its
//! own transaction and recorded in a `_migrations` table, so an interrupted
//! run resumes at the first unapplied statement.

use std::collections::HashSet;

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::schema;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Applies the embedded schema statements exactly once each.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Brings the schema up to date.
    ///
    /// Idempotent: statements whose names are already recorded are skipped,
    /// so re-running against a migrated database is a no-op.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_tracking_table().await?;
        let applied = self.applied_names().await?;

        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let name = format!("schema_v1_part_{}", idx);
            if applied.contains(&name) {
                continue;
            }
            self.apply(&name, statement).await?;
            info!(migration = %name, "applied migration");
        }

        Ok(())
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn applied_names(&self) -> Result<HashSet<String>, MigrationError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM _migrations")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// A statement and its bookkeeping row commit atomically: a failed
    /// statement leaves no record and is retried on the next run.
    async fn apply(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
