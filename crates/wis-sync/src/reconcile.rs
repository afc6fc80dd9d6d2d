use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use wis_core::MembershipSnapshot;
use wis_storage::{PersistenceError, ReconciliationPersistence, ReconciliationTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub upserted: u64,
    pub deleted: u64,
    /// The snapshot was not newer than what storage already holds.
    pub skipped: bool,
}

/// Converges stored memberships onto the latest snapshot, once per observation stamp.
#[derive(Clone)]
pub struct MembershipReconciler {
    store: Arc<dyn ReconciliationPersistence>,
}

impl MembershipReconciler {
    pub fn new(store: Arc<dyn ReconciliationPersistence>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ReconciliationPersistence> {
        &self.store
    }

    /// Upsert the snapshot's members and prune everything it did not refresh, in one
    /// transaction. Snapshots not strictly newer than the last applied one are ignored.
    pub async fn reconcile(
        &self,
        snapshot: &MembershipSnapshot,
    ) -> Result<ReconcileOutcome, PersistenceError> {
        let mut tx = self.store.begin(&snapshot.grouping).await?;
        match apply(tx.as_mut(), snapshot).await {
            Ok(Some(outcome)) => {
                tx.commit().await?;
                info!(
                    grouping = %snapshot.grouping,
                    members = snapshot.len(),
                    upserted = outcome.upserted,
                    deleted = outcome.deleted,
                    "membership reconciled"
                );
                Ok(outcome)
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(ReconcileOutcome {
                    upserted: 0,
                    deleted: 0,
                    skipped: true,
                })
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(grouping = %snapshot.grouping, error = %rollback_err, "rollback after failed reconcile also failed");
                }
                Err(err)
            }
        }
    }
}

async fn apply(
    tx: &mut dyn ReconciliationTx,
    snapshot: &MembershipSnapshot,
) -> Result<Option<ReconcileOutcome>, PersistenceError> {
    let latest: Option<DateTime<Utc>> = tx.latest_observed_at().await?;
    if latest.is_some_and(|latest| snapshot.observed_at <= latest) {
        debug!(
            grouping = %snapshot.grouping,
            incoming = %snapshot.observed_at,
            latest = ?latest,
            "ignoring snapshot that is not newer than stored state"
        );
        return Ok(None);
    }

    let upserted = tx.upsert_members(&snapshot.item_ids, snapshot.observed_at).await?;
    let deleted = tx.prune_stale(snapshot.observed_at).await?;
    tx.mark_applied(snapshot.observed_at).await?;
    Ok(Some(ReconcileOutcome {
        upserted,
        deleted,
        skipped: false,
    }))
}
