// ABOUTME: Data layer for Codebox persistent sandbox sessions
// ABOUTME: SQLite pool setup with embedded migrations and the session row store

pub mod sessions;

pub use sessions::{ConversationSandboxSession, NewSession, SessionStorage, SessionTransaction};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists for conversation: {0}")]
    Conflict(String),
    #[error("Invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// How long a connection waits for another writer to release the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Open (creating if needed) the database at `database_url` and apply migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    debug!("Connected to session database at {}", database_url);
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
