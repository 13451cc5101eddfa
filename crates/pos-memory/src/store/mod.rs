//! SQLite-backed persistent store.
//!
//! Split into focused submodules:
//! - `users`: user records
//! - `snapshots`: the serialized avatar ledger on each user record
//! - `tasks`: task CRUD and the completion transition

mod snapshots;
mod tasks;
mod users;

pub use tasks::{NewTask, Task, TaskPriority, TaskStatus};
pub use users::{NewUser, User};

use pos_core::{config::MemoryConfig, error::PosError, shellexpand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Persistent store backed by SQLite.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new store, running migrations on first use.
    pub async fn new(config: &MemoryConfig) -> Result<Self, PosError> {
        let db_path = shellexpand(&config.db_path);

        // Ensure parent directory exists.
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PosError::Memory(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| PosError::Memory(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| PosError::Memory(format!("failed to connect to sqlite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("Store initialized at {db_path}");
        Ok(store)
    }

    /// Wrap an existing pool, running migrations on it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, PosError> {
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the database file size in bytes.
    pub async fn db_size(&self) -> Result<u64, PosError> {
        let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PosError::Memory(format!("pragma failed: {e}")))?;

        let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PosError::Memory(format!("pragma failed: {e}")))?;

        Ok((page_count * page_size) as u64)
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), PosError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| PosError::Memory(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[
            ("001_users", include_str!("../../migrations/001_users.sql")),
            ("002_tasks", include_str!("../../migrations/002_tasks.sql")),
            ("003_planning", include_str!("../../migrations/003_planning.sql")),
        ];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        PosError::Memory(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| PosError::Memory(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| PosError::Memory(format!("failed to record migration {name}: {e}")))?;
        }
        Ok(())
    }
}

/// Map a sqlx error, turning unique-constraint violations into `Conflict`.
fn db_error(context: &str, e: sqlx::Error) -> PosError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => PosError::Conflict(format!("{context}: {db}")),
        Some(db) if db.is_foreign_key_violation() => {
            PosError::NotFound(format!("{context}: {db}"))
        }
        _ => PosError::Memory(format!("{context}: {e}")),
    }
}
