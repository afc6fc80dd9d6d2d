use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::service::SyncService;

/// Cron-driven extraction runs, or `None` when the scheduler is disabled.
///
/// `SYNC_CRON` is seconds-first (six fields).
///
/// A tick that fires while the previous run is still going is skipped by the stream
/// leases, so overlapping ticks are harmless.
pub async fn maybe_build_scheduler(
    service: Arc<SyncService>,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !service.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = service.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let service = service.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            if let Err(err) = service.run_once(&cancel).await {
                error!(error = %err, "scheduled sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
