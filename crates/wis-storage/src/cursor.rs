use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use wis_core::{CursorCommit, StreamKey, SyncCursor, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE, MIN_BATCH_SIZE};

use crate::PersistenceError;

/// Per-stream watermark persistence.
///
/// `commit` is the only write a run performs on its cursor, and it must never move
/// `next_watermark` backwards.
#[async_trait]
pub trait CursorPersistence: Send + Sync {
    async fn get(&self, stream: &StreamKey) -> Result<Option<SyncCursor>, PersistenceError>;

    async fn commit(
        &self,
        stream: &StreamKey,
        commit: &CursorCommit,
    ) -> Result<SyncCursor, PersistenceError>;

    /// Take the run lease for a stream. Returns `false` when another run holds it.
    async fn try_acquire(&self, stream: &StreamKey) -> Result<bool, PersistenceError>;

    async fn release(&self, stream: &StreamKey) -> Result<(), PersistenceError>;

    async fn load(&self, stream: &StreamKey) -> Result<SyncCursor, PersistenceError> {
        Ok(self
            .get(stream)
            .await?
            .unwrap_or_else(|| SyncCursor::initial(stream.clone())))
    }
}

#[derive(Debug, Default)]
struct MemoryCursorState {
    cursors: HashMap<StreamKey, SyncCursor>,
    leases: HashSet<StreamKey>,
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    state: Mutex<MemoryCursorState>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, cursor: SyncCursor) {
        let mut state = self.state.lock().await;
        state.cursors.insert(cursor.stream.clone(), cursor);
    }
}

#[async_trait]
impl CursorPersistence for MemoryCursorStore {
    async fn get(&self, stream: &StreamKey) -> Result<Option<SyncCursor>, PersistenceError> {
        Ok(self.state.lock().await.cursors.get(stream).cloned())
    }

    async fn commit(
        &self,
        stream: &StreamKey,
        commit: &CursorCommit,
    ) -> Result<SyncCursor, PersistenceError> {
        let mut state = self.state.lock().await;
        let current = state
            .cursors
            .get(stream)
            .cloned()
            .unwrap_or_else(|| SyncCursor::initial(stream.clone()));
        let next = current.advanced(commit);
        state.cursors.insert(stream.clone(), next.clone());
        Ok(next)
    }

    async fn try_acquire(&self, stream: &StreamKey) -> Result<bool, PersistenceError> {
        Ok(self.state.lock().await.leases.insert(stream.clone()))
    }

    async fn release(&self, stream: &StreamKey) -> Result<(), PersistenceError> {
        self.state.lock().await.leases.remove(stream);
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
    lease_ttl: ChronoDuration,
}

const CURSOR_COLUMNS: &str =
    "org_id, source_id, last_run_at, next_watermark, batch_size, exclude_before, resume_after";

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_ttl: ChronoDuration::hours(1),
        }
    }

    /// Leases older than this are considered abandoned by a crashed run.
    pub fn with_lease_ttl(mut self, lease_ttl: ChronoDuration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    fn map_row(row: sqlx::postgres::PgRow) -> Result<SyncCursor, PersistenceError> {
        let batch_size: i32 = row.try_get("batch_size")?;
        let batch_size = u32::try_from(batch_size)
            .map_err(|_| PersistenceError::Corrupt(format!("negative batch_size {batch_size}")))?;
        Ok(SyncCursor {
            stream: StreamKey::new(
                row.try_get::<String, _>("org_id")?,
                row.try_get::<String, _>("source_id")?,
            ),
            last_run_at: row.try_get("last_run_at")?,
            next_watermark: row.try_get("next_watermark")?,
            batch_size,
            exclude_before: row.try_get("exclude_before")?,
            resume_after: row.try_get("resume_after")?,
        })
    }
}

#[async_trait]
impl CursorPersistence for PgCursorStore {
    async fn get(&self, stream: &StreamKey) -> Result<Option<SyncCursor>, PersistenceError> {
        let row = sqlx::query(&format!(
            "select {CURSOR_COLUMNS} from sync_cursors where org_id = $1 and source_id = $2"
        ))
        .bind(&stream.org_id)
        .bind(&stream.source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::map_row).transpose()
    }

    async fn commit(
        &self,
        stream: &StreamKey,
        commit: &CursorCommit,
    ) -> Result<SyncCursor, PersistenceError> {
        let batch_size = commit.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE) as i32;
        // greatest() ignores nulls, so an absent incoming watermark keeps the stored one.
        let row = sqlx::query(&format!(
            "insert into sync_cursors (org_id, source_id, last_run_at, next_watermark, batch_size, resume_after, exclude_before)
             values ($1, $2, $3, $4, $5, $6, $7)
             on conflict (org_id, source_id) do update set
               last_run_at = excluded.last_run_at,
               next_watermark = greatest(sync_cursors.next_watermark, excluded.next_watermark),
               batch_size = excluded.batch_size,
               resume_after = excluded.resume_after,
               exclude_before = coalesce(excluded.exclude_before, sync_cursors.exclude_before),
               updated_at = now()
             returning {CURSOR_COLUMNS}"
        ))
        .bind(&stream.org_id)
        .bind(&stream.source_id)
        .bind(commit.run_started_at)
        .bind(commit.next_watermark)
        .bind(batch_size)
        .bind(commit.resume_after)
        .bind(commit.exclude_before)
        .fetch_one(&self.pool)
        .await?;

        Self::map_row(row)
    }

    async fn try_acquire(&self, stream: &StreamKey) -> Result<bool, PersistenceError> {
        let now = Utc::now();
        let stale_before: DateTime<Utc> = now - self.lease_ttl;
        let row = sqlx::query(
            "insert into sync_cursors (org_id, source_id, batch_size, running, lease_taken_at)
             values ($1, $2, $3, true, $4)
             on conflict (org_id, source_id) do update set running = true, lease_taken_at = $4
             where sync_cursors.running = false or sync_cursors.lease_taken_at < $5
             returning org_id",
        )
        .bind(&stream.org_id)
        .bind(&stream.source_id)
        .bind(DEFAULT_BATCH_SIZE as i32)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn release(&self, stream: &StreamKey) -> Result<(), PersistenceError> {
        sqlx::query(
            "update sync_cursors set running = false, lease_taken_at = null, updated_at = now()
             where org_id = $1 and source_id = $2",
        )
        .bind(&stream.org_id)
        .bind(&stream.source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
