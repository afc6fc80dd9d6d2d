use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use wis_core::{GroupingKey, ReconciliationRecord};

use crate::PersistenceError;

/// Storage for (grouping, item) membership rows.
///
/// All mutation happens through a [`ReconciliationTx`] scoped to one grouping. A
/// transaction that is dropped without `commit` leaves no trace.
#[async_trait]
pub trait ReconciliationPersistence: Send + Sync {
    /// Open a transaction that holds exclusive access to the grouping until it ends.
    async fn begin(
        &self,
        grouping: &GroupingKey,
    ) -> Result<Box<dyn ReconciliationTx>, PersistenceError>;

    async fn members(
        &self,
        grouping: &GroupingKey,
    ) -> Result<Vec<ReconciliationRecord>, PersistenceError>;
}

#[async_trait]
pub trait ReconciliationTx: Send {
    /// Stamp of the newest snapshot committed for the grouping.
    async fn latest_observed_at(&mut self) -> Result<Option<DateTime<Utc>>, PersistenceError>;

    /// Insert missing rows and refresh older stamps. Returns rows written.
    async fn upsert_members(
        &mut self,
        item_ids: &BTreeSet<String>,
        observed_at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError>;

    /// Delete rows stamped before `observed_at`. Returns rows deleted.
    async fn prune_stale(&mut self, observed_at: DateTime<Utc>) -> Result<u64, PersistenceError>;

    async fn mark_applied(&mut self, observed_at: DateTime<Utc>) -> Result<(), PersistenceError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
struct MemoryMembershipState {
    records: HashMap<GroupingKey, BTreeMap<String, DateTime<Utc>>>,
    applied: HashMap<GroupingKey, DateTime<Utc>>,
}

/// In-process store; one transaction at a time across all groupings.
#[derive(Debug, Clone, Default)]
pub struct MemoryReconciliationStore {
    state: Arc<Mutex<MemoryMembershipState>>,
}

impl MemoryReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconciliationPersistence for MemoryReconciliationStore {
    async fn begin(
        &self,
        grouping: &GroupingKey,
    ) -> Result<Box<dyn ReconciliationTx>, PersistenceError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.records.get(grouping).cloned().unwrap_or_default();
        let applied = guard.applied.get(grouping).copied();
        Ok(Box::new(MemoryReconciliationTx {
            guard,
            grouping: grouping.clone(),
            staged,
            applied,
        }))
    }

    async fn members(
        &self,
        grouping: &GroupingKey,
    ) -> Result<Vec<ReconciliationRecord>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(grouping)
            .map(|rows| {
                rows.iter()
                    .map(|(item_id, observed_at)| ReconciliationRecord {
                        grouping: grouping.clone(),
                        item_id: item_id.clone(),
                        observed_at: *observed_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct MemoryReconciliationTx {
    guard: OwnedMutexGuard<MemoryMembershipState>,
    grouping: GroupingKey,
    staged: BTreeMap<String, DateTime<Utc>>,
    applied: Option<DateTime<Utc>>,
}

#[async_trait]
impl ReconciliationTx for MemoryReconciliationTx {
    async fn latest_observed_at(&mut self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        Ok(self.applied)
    }

    async fn upsert_members(
        &mut self,
        item_ids: &BTreeSet<String>,
        observed_at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let mut written = 0u64;
        for item_id in item_ids {
            match self.staged.get_mut(item_id) {
                Some(stamp) if *stamp < observed_at => {
                    *stamp = observed_at;
                    written += 1;
                }
                Some(_) => {}
                None => {
                    self.staged.insert(item_id.clone(), observed_at);
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn prune_stale(&mut self, observed_at: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let before = self.staged.len();
        self.staged.retain(|_, stamp| *stamp >= observed_at);
        Ok((before - self.staged.len()) as u64)
    }

    async fn mark_applied(&mut self, observed_at: DateTime<Utc>) -> Result<(), PersistenceError> {
        self.applied = self.applied.max(Some(observed_at));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let MemoryReconciliationTx {
            mut guard,
            grouping,
            staged,
            applied,
        } = *self;
        if let Some(applied) = applied {
            guard.applied.insert(grouping.clone(), applied);
        }
        if staged.is_empty() {
            guard.records.remove(&grouping);
        } else {
            guard.records.insert(grouping, staged);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgReconciliationStore {
    pool: PgPool,
}

impl PgReconciliationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconciliationPersistence for PgReconciliationStore {
    async fn begin(
        &self,
        grouping: &GroupingKey,
    ) -> Result<Box<dyn ReconciliationTx>, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        // Serializes reconcilers for the same grouping until commit/rollback.
        sqlx::query("select pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(grouping.to_string())
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgReconciliationTx {
            tx,
            grouping: grouping.clone(),
        }))
    }

    async fn members(
        &self,
        grouping: &GroupingKey,
    ) -> Result<Vec<ReconciliationRecord>, PersistenceError> {
        let rows = sqlx::query(
            "select item_id, observed_at from membership_records
             where org_id = $1 and source_id = $2 and context_id = $3
             order by item_id",
        )
        .bind(&grouping.org_id)
        .bind(&grouping.source_id)
        .bind(&grouping.context_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ReconciliationRecord {
                    grouping: grouping.clone(),
                    item_id: row.try_get("item_id")?,
                    observed_at: row.try_get("observed_at")?,
                })
            })
            .collect()
    }
}

struct PgReconciliationTx {
    tx: Transaction<'static, Postgres>,
    grouping: GroupingKey,
}

#[async_trait]
impl ReconciliationTx for PgReconciliationTx {
    async fn latest_observed_at(&mut self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let row = sqlx::query(
            "select observed_at from membership_groupings
             where org_id = $1 and source_id = $2 and context_id = $3",
        )
        .bind(&self.grouping.org_id)
        .bind(&self.grouping.source_id)
        .bind(&self.grouping.context_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("observed_at")?),
            None => None,
        })
    }

    async fn upsert_members(
        &mut self,
        item_ids: &BTreeSet<String>,
        observed_at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = item_ids.iter().cloned().collect();
        let result = sqlx::query(
            "insert into membership_records (org_id, source_id, context_id, item_id, observed_at)
             select $1, $2, $3, item_id, $5 from unnest($4::text[]) as t(item_id)
             on conflict (org_id, source_id, context_id, item_id)
             do update set observed_at = excluded.observed_at
             where membership_records.observed_at < excluded.observed_at",
        )
        .bind(&self.grouping.org_id)
        .bind(&self.grouping.source_id)
        .bind(&self.grouping.context_id)
        .bind(&ids)
        .bind(observed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_stale(&mut self, observed_at: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "delete from membership_records
             where org_id = $1 and source_id = $2 and context_id = $3 and observed_at < $4",
        )
        .bind(&self.grouping.org_id)
        .bind(&self.grouping.source_id)
        .bind(&self.grouping.context_id)
        .bind(observed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_applied(&mut self, observed_at: DateTime<Utc>) -> Result<(), PersistenceError> {
        sqlx::query(
            "insert into membership_groupings (org_id, source_id, context_id, observed_at)
             values ($1, $2, $3, $4)
             on conflict (org_id, source_id, context_id) do update set
               observed_at = greatest(membership_groupings.observed_at, excluded.observed_at),
               updated_at = now()",
        )
        .bind(&self.grouping.org_id)
        .bind(&self.grouping.source_id)
        .bind(&self.grouping.context_id)
        .bind(observed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
