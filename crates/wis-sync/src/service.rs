use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use wis_adapters::build_source;
use wis_core::{StreamKey, SyncCursor};
use wis_storage::{
    create_pool, CursorPersistence, HttpClientConfig, HttpFetcher, MemoryCursorStore,
    MemoryReconciliationStore, PayloadStore, PgCursorStore, PgReconciliationStore,
    ReconciliationPersistence,
};

use crate::config::{SourceRegistry, StoreBackend, SyncConfig};
use crate::queue::OutboxWorkQueue;
use crate::run::{write_run_summary, RunKind, RunSummary, StreamRun, SyncPipeline, VerifyReport};

/// Everything a process needs to run the registry's streams.
pub struct SyncService {
    config: SyncConfig,
    runs: Vec<StreamRun>,
    pipeline: SyncPipeline,
}

impl SyncService {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()?).await
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.registry_path()).await?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            requests_per_minute: config.http_requests_per_minute,
            ..HttpClientConfig::default()
        })?);

        let mut runs = Vec::new();
        for stream in registry.enabled() {
            let key = stream.stream_key();
            let source = build_source(&stream.resolved_source_spec(), http.clone(), &config.workspace_root)
                .with_context(|| format!("building source for stream {key}"))?;
            runs.push(
                StreamRun::new(key, source, stream.groupings.clone())
                    .with_exclude_before(stream.exclude_before)
                    .with_page_size(stream.page_size),
            );
        }

        let (cursors, memberships): (Arc<dyn CursorPersistence>, Arc<dyn ReconciliationPersistence>) =
            match config.store {
                StoreBackend::Postgres => {
                    let pool = create_pool(&config.database_url)
                        .await
                        .context("connecting to postgres")?;
                    (
                        Arc::new(PgCursorStore::new(pool.clone())),
                        Arc::new(PgReconciliationStore::new(pool)),
                    )
                }
                StoreBackend::Memory => (
                    Arc::new(MemoryCursorStore::new()),
                    Arc::new(MemoryReconciliationStore::new()),
                ),
            };
        let queue = OutboxWorkQueue::open(config.outbox_path())
            .await
            .context("opening work queue outbox")?;
        let pipeline = SyncPipeline::new(
            config.run_settings(),
            cursors,
            memberships,
            PayloadStore::new(config.payload_root()),
            Arc::new(queue),
        );
        info!(streams = runs.len(), store = ?config.store, "sync service ready");

        Ok(Self {
            config,
            runs,
            pipeline,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamKey> {
        self.runs.iter().map(|r| &r.stream)
    }

    /// One extraction pass over every enabled stream; the summary is written under `reports/`.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<(RunSummary, PathBuf)> {
        self.run_kind(RunKind::Extraction, cancel).await
    }

    pub async fn refresh_memberships(&self, cancel: &CancellationToken) -> Result<(RunSummary, PathBuf)> {
        self.run_kind(RunKind::Membership, cancel).await
    }

    async fn run_kind(&self, kind: RunKind, cancel: &CancellationToken) -> Result<(RunSummary, PathBuf)> {
        let summary = self.pipeline.run_all(&self.runs, kind, cancel).await;
        let path = write_run_summary(&self.config.reports_dir(), &summary).await?;
        info!(
            run_id = %summary.run_id,
            kind = ?kind,
            streams = summary.streams.len(),
            report = %path.display(),
            "run finished"
        );
        Ok((summary, path))
    }

    pub async fn cursor(&self, org_id: &str, source_id: &str) -> Result<Option<SyncCursor>> {
        let key = StreamKey::new(org_id, source_id);
        Ok(self.pipeline.cursors().get(&key).await?)
    }

    pub async fn verify(&self, org_id: &str, source_id: &str, ids: &[String]) -> Result<VerifyReport> {
        let run = self.find_run(org_id, source_id)?;
        Ok(self.pipeline.verify_items(run, ids).await?)
    }

    fn find_run(&self, org_id: &str, source_id: &str) -> Result<&StreamRun> {
        self.runs
            .iter()
            .find(|r| r.stream.org_id == org_id && r.stream.source_id == source_id)
            .ok_or_else(|| anyhow!("no enabled stream {org_id}/{source_id} in the registry"))
    }
}
