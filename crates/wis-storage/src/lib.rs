//! Persistence and transport plumbing: cursor store, membership store, payload blobs, HTTP.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

mod cursor;
mod http;
mod membership;
mod payload;

pub use cursor::{CursorPersistence, MemoryCursorStore, PgCursorStore};
pub use http::{
    classify_reqwest_error, classify_status, parse_retry_after, BackoffPolicy, FetchedResponse,
    HttpAuth, HttpClientConfig, HttpFetcher, RequestPacer, ResponseDisposition,
};
pub use membership::{
    MemoryReconciliationStore, PgReconciliationStore, ReconciliationPersistence, ReconciliationTx,
};
pub use payload::{PayloadKey, PayloadStore, StoredPayload};

pub const CRATE_NAME: &str = "wis-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, PersistenceError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), PersistenceError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
