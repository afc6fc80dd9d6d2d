//! Per-stream run orchestration: extraction passes, membership refreshes, integrity checks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wis_adapters::SourceApi;
use wis_core::{
    CursorCommit, ExtractedItem, GroupingKey, MembershipSnapshot, StreamKey, SyncCursor,
};
use wis_storage::{
    CursorPersistence, PayloadKey, PayloadStore, PersistenceError, ReconciliationPersistence,
};

use crate::batch;
use crate::budget::TimeBudget;
use crate::collision::CollisionWindow;
use crate::config::RunSettings;
use crate::paginate::{Paginator, Termination};
use crate::queue::{WorkMessage, WorkQueue};
use crate::reconcile::{MembershipReconciler, ReconcileOutcome};
use crate::retry::{reschedule_watermark, RetryHandler};
use crate::SyncError;

/// One (org, source) stream bound to its source implementation.
#[derive(Clone)]
pub struct StreamRun {
    pub stream: StreamKey,
    pub source: Arc<dyn SourceApi>,
    pub groupings: Vec<String>,
    pub exclude_before: Option<DateTime<Utc>>,
    /// Items requested per page. Defaults to the cursor's batch size.
    pub page_size: Option<u32>,
}

impl StreamRun {
    pub fn new(stream: StreamKey, source: Arc<dyn SourceApi>, groupings: Vec<String>) -> Self {
        Self {
            stream,
            source,
            groupings,
            exclude_before: None,
            page_size: None,
        }
    }

    pub fn with_exclude_before(mut self, exclude_before: Option<DateTime<Utc>>) -> Self {
        self.exclude_before = exclude_before;
        self
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Extraction,
    Membership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Some groupings failed, were throttled, or stopped early.
    Partial,
    /// Another run holds the stream's lease.
    Skipped,
    /// The source asked us to wait until `resume_after`.
    Deferred,
    Cancelled,
    /// A storage or queue failure stopped the run.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStatus {
    Completed,
    /// A membership snapshot stopped before the end of data and was discarded.
    Incomplete,
    Throttled,
    Failed,
    Cancelled,
}

impl GroupingStatus {
    fn from_termination(termination: Option<Termination>) -> Self {
        match termination {
            Some(Termination::Throttled { .. }) => GroupingStatus::Throttled,
            Some(Termination::Cancelled) => GroupingStatus::Cancelled,
            Some(Termination::Failed) => GroupingStatus::Failed,
            _ => GroupingStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupingOutcome {
    pub grouping: GroupingKey,
    pub status: GroupingStatus,
    pub pages: u32,
    /// Items emitted (extraction) or snapshot members (membership).
    pub items: u64,
    pub excluded: u64,
    pub duplicates: u64,
    pub termination: Option<Termination>,
    pub boundary_open: bool,
    pub safe_watermark: Option<DateTime<Utc>>,
    /// Exhausted without observing a single change.
    #[serde(skip)]
    drained_empty: bool,
    pub reconciled: Option<ReconcileOutcome>,
    pub error: Option<String>,
}

impl GroupingOutcome {
    fn new(grouping: GroupingKey) -> Self {
        Self {
            grouping,
            status: GroupingStatus::Completed,
            pages: 0,
            items: 0,
            excluded: 0,
            duplicates: 0,
            termination: None,
            boundary_open: false,
            safe_watermark: None,
            drained_empty: false,
            reconciled: None,
            error: None,
        }
    }

    fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self.termination {
            Some(Termination::Throttled { retry_after }) => Some(retry_after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub stream: StreamKey,
    pub kind: RunKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_watermark: Option<DateTime<Utc>>,
    /// Cursor as stored after this run; `None` when nothing was committed.
    pub committed: Option<SyncCursor>,
    pub groupings: Vec<GroupingOutcome>,
    pub error: Option<String>,
}

impl StreamReport {
    fn empty(stream: &StreamKey, kind: RunKind, status: RunStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            stream: stream.clone(),
            kind,
            status,
            started_at,
            finished_at: Utc::now(),
            previous_watermark: None,
            committed: None,
            groupings: Vec::new(),
            error: None,
        }
    }

    pub fn count(&self, status: GroupingStatus) -> usize {
        self.groupings.iter().filter(|g| g.status == status).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub streams: Vec<StreamReport>,
}

impl RunSummary {
    pub fn grouping_count(&self, status: GroupingStatus) -> usize {
        self.streams.iter().map(|s| s.count(status)).sum()
    }

    pub fn stream_count(&self, status: RunStatus) -> usize {
        self.streams.iter().filter(|s| s.status == status).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub stream: StreamKey,
    pub requested: usize,
    pub found: usize,
    /// Not returned by the source.
    pub missing: Vec<String>,
    /// Returned by the source but never stored.
    pub unstored: Vec<String>,
    /// Stored payload differs from what the source returns now.
    pub drifted: Vec<String>,
}

/// Write `reports/<run_id>/run_summary.json` and return its path.
pub async fn write_run_summary(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("run_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Per-run state shared by the grouping tasks of one stream.
struct Pass<'a> {
    run: &'a StreamRun,
    watermark: Option<DateTime<Utc>>,
    exclude_before: Option<DateTime<Utc>>,
    batch_size: u32,
    page_size: u32,
    budget: &'a TimeBudget,
    cancel: &'a CancellationToken,
    seen: &'a Mutex<HashSet<String>>,
}

pub struct SyncPipeline {
    settings: RunSettings,
    cursors: Arc<dyn CursorPersistence>,
    reconciler: MembershipReconciler,
    payloads: PayloadStore,
    queue: Arc<dyn WorkQueue>,
    retry: RetryHandler,
}

impl SyncPipeline {
    pub fn new(
        settings: RunSettings,
        cursors: Arc<dyn CursorPersistence>,
        memberships: Arc<dyn ReconciliationPersistence>,
        payloads: PayloadStore,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        let retry = RetryHandler::new(settings.max_fetch_attempts, settings.backoff);
        Self {
            settings,
            cursors,
            reconciler: MembershipReconciler::new(memberships),
            payloads,
            queue,
            retry,
        }
    }

    pub fn cursors(&self) -> &Arc<dyn CursorPersistence> {
        &self.cursors
    }

    pub fn reconciler(&self) -> &MembershipReconciler {
        &self.reconciler
    }

    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    /// Run every stream once and collect a summary. Stream failures are recorded,
    /// not propagated, so one stream cannot block the others.
    pub async fn run_all(
        &self,
        runs: &[StreamRun],
        kind: RunKind,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut streams = Vec::with_capacity(runs.len());
        for run in runs {
            let result = match kind {
                RunKind::Extraction => self.run_extraction(run, cancel).await,
                RunKind::Membership => self.refresh_memberships(run, cancel).await,
            };
            let report = result.unwrap_or_else(|err| {
                error!(stream = %run.stream, error = %err, "stream run aborted");
                let mut report = StreamReport::empty(&run.stream, kind, RunStatus::Aborted, started_at);
                report.error = Some(err.to_string());
                report
            });
            streams.push(report);
        }
        RunSummary {
            run_id,
            kind,
            started_at,
            finished_at: Utc::now(),
            streams,
        }
    }

    /// One incremental extraction for a stream.
    ///
    /// The cursor is committed at most once, at the end, and only if no storage failure
    /// or cancellation happened. Its watermark is the lowest safe watermark across
    /// groupings, so a failed grouping holds the stream where it was.
    pub async fn run_extraction(
        &self,
        run: &StreamRun,
        cancel: &CancellationToken,
    ) -> Result<StreamReport, SyncError> {
        let started_at = Utc::now();
        if cancel.is_cancelled() {
            return Ok(StreamReport::empty(&run.stream, RunKind::Extraction, RunStatus::Cancelled, started_at));
        }
        if !self.cursors.try_acquire(&run.stream).await? {
            info!(stream = %run.stream, "stream is already running elsewhere; skipping");
            return Ok(StreamReport::empty(&run.stream, RunKind::Extraction, RunStatus::Skipped, started_at));
        }

        let span = info_span!("extraction", stream = %run.stream);
        let result = self
            .extract_leased(run, started_at, cancel)
            .instrument(span)
            .await;
        if let Err(err) = self.cursors.release(&run.stream).await {
            warn!(stream = %run.stream, error = %err, "failed to release run lease");
        }
        result
    }

    async fn extract_leased(
        &self,
        run: &StreamRun,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<StreamReport, SyncError> {
        let cursor = self.cursors.load(&run.stream).await?;
        let mut report = StreamReport::empty(&run.stream, RunKind::Extraction, RunStatus::Completed, started_at);
        report.previous_watermark = cursor.next_watermark;

        if cursor.is_deferred_at(started_at) {
            info!(resume_after = ?cursor.resume_after, "source asked for a pause; deferring run");
            report.status = RunStatus::Deferred;
            return Ok(report);
        }

        let budget = TimeBudget::new(started_at, self.settings.run_budget)
            .with_safety_margin(self.settings.safety_margin);
        let run_cancel = cancel.child_token();
        let seen = Mutex::new(HashSet::new());
        let pass = Pass {
            run,
            watermark: cursor.next_watermark,
            exclude_before: run.exclude_before.or(cursor.exclude_before),
            batch_size: cursor.batch_size,
            page_size: run.page_size.unwrap_or(cursor.batch_size).min(cursor.batch_size),
            budget: &budget,
            cancel: &run_cancel,
            seen: &seen,
        };
        info!(
            watermark = ?pass.watermark,
            batch_size = pass.batch_size,
            groupings = run.groupings.len(),
            "starting extraction"
        );

        let results: Vec<Result<GroupingOutcome, SyncError>> = stream::iter(run.groupings.clone())
            .map(|context_id| {
                let pass = &pass;
                async move { self.extract_grouping(pass, &context_id).await }
            })
            .buffer_unordered(self.settings.fetch_fanout.max(1))
            .collect()
            .await;
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        outcomes.sort_by(|a, b| a.grouping.cmp(&b.grouping));

        if cancel.is_cancelled() {
            warn!("run cancelled; cursor left untouched");
            report.status = RunStatus::Cancelled;
            report.groupings = outcomes;
            report.finished_at = Utc::now();
            return Ok(report);
        }

        // A grouping that reached the end of data without seeing a change places no bound.
        let mut next_watermark = outcomes
            .iter()
            .filter(|o| !o.drained_empty)
            .map(|o| o.safe_watermark)
            .min()
            .unwrap_or(cursor.next_watermark);
        let resume_after = outcomes.iter().filter_map(GroupingOutcome::retry_after).max();
        if let Some(retry_after) = resume_after {
            next_watermark = reschedule_watermark(next_watermark, retry_after);
        }
        let did_expire = outcomes
            .iter()
            .any(|o| o.termination == Some(Termination::BudgetExpired));
        let commit = CursorCommit {
            run_started_at: started_at,
            next_watermark,
            batch_size: batch::adjust(cursor.batch_size, did_expire),
            resume_after,
            exclude_before: run.exclude_before,
        };
        let committed = self.cursors.commit(&run.stream, &commit).await?;

        report.status = if outcomes.iter().all(|o| o.status == GroupingStatus::Completed) {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        info!(
            status = ?report.status,
            watermark = ?committed.next_watermark,
            batch_size = committed.batch_size,
            did_expire,
            "extraction committed"
        );
        report.committed = Some(committed);
        report.groupings = outcomes;
        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn extract_grouping(
        &self,
        pass: &Pass<'_>,
        context_id: &str,
    ) -> Result<GroupingOutcome, SyncError> {
        let grouping = pass.run.stream.grouping(context_id);
        let source = pass.run.source.as_ref();
        let mut paginator = Paginator::new(source, &self.retry, grouping.clone(), pass.watermark, pass.page_size)
            .with_batch_limit(Some(pass.batch_size))
            .with_page_ceiling(self.settings.page_ceiling)
            .with_budget(pass.budget)
            .with_cancellation(pass.cancel);
        let mut window = CollisionWindow::new(pass.watermark, source.watermark_semantics());
        let mut outcome = GroupingOutcome::new(grouping.clone());

        loop {
            let page = match paginator.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    error!(grouping = %grouping, error = %err, "grouping extraction failed");
                    outcome.error = Some(err.to_string());
                    break;
                }
            };
            let truncated = !paginator.is_exhausted();
            let (kept, boundary_open) = window.filter_and_detect(page, truncated);
            paginator.extend_past_batch(boundary_open);

            for item in kept {
                if item.is_excluded_by(pass.exclude_before) {
                    outcome.excluded += 1;
                    continue;
                }
                if !pass.seen.lock().await.insert(item.item_id.clone()) {
                    outcome.duplicates += 1;
                    continue;
                }
                if let Err(err) = self.emit_item(&grouping, &item).await {
                    pass.cancel.cancel();
                    return Err(err);
                }
                outcome.items += 1;
            }
        }

        outcome.pages = paginator.pages_fetched();
        outcome.termination = paginator.termination();
        outcome.boundary_open = window.boundary_open();
        outcome.status = GroupingStatus::from_termination(outcome.termination);
        outcome.safe_watermark = match outcome.status {
            GroupingStatus::Failed | GroupingStatus::Cancelled => pass.watermark,
            _ => window.safe_watermark(paginator.is_exhausted()),
        };
        outcome.drained_empty = outcome.status == GroupingStatus::Completed
            && paginator.is_exhausted()
            && window.max_seen().is_none();
        info!(
            grouping = %grouping,
            pages = outcome.pages,
            items = outcome.items,
            termination = ?outcome.termination,
            boundary_open = outcome.boundary_open,
            "grouping extracted"
        );
        Ok(outcome)
    }

    async fn emit_item(&self, grouping: &GroupingKey, item: &ExtractedItem) -> Result<(), SyncError> {
        let key = PayloadKey::new(&grouping.org_id, &grouping.source_id, &item.item_id);
        let bytes = serde_json::to_vec(&item.raw).map_err(|e| {
            PersistenceError::Corrupt(format!("encoding payload for {}: {e}", item.item_id))
        })?;
        let stored = self.payloads.put(&key, &bytes).await?;
        self.queue
            .publish(WorkMessage::ItemExtracted {
                org_id: grouping.org_id.clone(),
                source_id: grouping.source_id.clone(),
                context_id: grouping.context_id.clone(),
                item_id: item.item_id.clone(),
                changed_at: item.changed_at,
                payload_ref: stored.relative_path.to_string_lossy().into_owned(),
                content_hash: stored.content_hash,
            })
            .await?;
        Ok(())
    }

    /// Rebuild every grouping's membership from a full pagination and reconcile it.
    ///
    /// Only snapshots whose pagination reached the end of data are reconciled; anything
    /// cut short is discarded whole.
    pub async fn refresh_memberships(
        &self,
        run: &StreamRun,
        cancel: &CancellationToken,
    ) -> Result<StreamReport, SyncError> {
        let observed_at = Utc::now();
        let mut report = StreamReport::empty(&run.stream, RunKind::Membership, RunStatus::Completed, observed_at);
        if cancel.is_cancelled() {
            report.status = RunStatus::Cancelled;
            return Ok(report);
        }
        let cursor = self.cursors.load(&run.stream).await?;
        if cursor.is_deferred_at(observed_at) {
            report.status = RunStatus::Deferred;
            return Ok(report);
        }

        let budget = TimeBudget::new(observed_at, self.settings.run_budget)
            .with_safety_margin(self.settings.safety_margin);
        let run_cancel = cancel.child_token();
        let seen = Mutex::new(HashSet::new());
        let pass = Pass {
            run,
            watermark: None,
            exclude_before: run.exclude_before.or(cursor.exclude_before),
            batch_size: cursor.batch_size,
            page_size: run.page_size.unwrap_or(cursor.batch_size),
            budget: &budget,
            cancel: &run_cancel,
            seen: &seen,
        };

        let span = info_span!("membership", stream = %run.stream);
        let results: Vec<Result<GroupingOutcome, SyncError>> = stream::iter(run.groupings.clone())
            .map(|context_id| {
                let pass = &pass;
                async move { self.refresh_grouping(pass, &context_id, observed_at).await }
            })
            .buffer_unordered(self.settings.fetch_fanout.max(1))
            .collect()
            .instrument(span)
            .await;
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        outcomes.sort_by(|a, b| a.grouping.cmp(&b.grouping));

        report.status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if outcomes.iter().all(|o| o.status == GroupingStatus::Completed) {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        report.groupings = outcomes;
        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn refresh_grouping(
        &self,
        pass: &Pass<'_>,
        context_id: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<GroupingOutcome, SyncError> {
        let grouping = pass.run.stream.grouping(context_id);
        let mut paginator = Paginator::new(pass.run.source.as_ref(), &self.retry, grouping.clone(), None, pass.page_size)
            .with_page_ceiling(self.settings.page_ceiling)
            .with_budget(pass.budget)
            .with_cancellation(pass.cancel);
        let mut snapshot = MembershipSnapshot::new(grouping.clone(), observed_at);
        let mut outcome = GroupingOutcome::new(grouping.clone());

        loop {
            match paginator.next_page().await {
                Ok(Some(page)) => {
                    for item in page.items {
                        if item.is_excluded_by(pass.exclude_before) {
                            outcome.excluded += 1;
                        } else if !snapshot.insert(item.item_id) {
                            outcome.duplicates += 1;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(grouping = %grouping, error = %err, "membership pagination failed");
                    outcome.error = Some(err.to_string());
                    break;
                }
            }
        }
        outcome.pages = paginator.pages_fetched();
        outcome.termination = paginator.termination();
        outcome.items = snapshot.len() as u64;

        if !paginator.is_exhausted() || pass.cancel.is_cancelled() {
            outcome.status = match GroupingStatus::from_termination(outcome.termination) {
                GroupingStatus::Completed => GroupingStatus::Incomplete,
                other => other,
            };
            warn!(
                grouping = %grouping,
                members = snapshot.len(),
                termination = ?outcome.termination,
                "discarding incomplete membership snapshot"
            );
            return Ok(outcome);
        }

        let reconciled = match self.reconciler.reconcile(&snapshot).await {
            Ok(reconciled) => reconciled,
            Err(err) => {
                pass.cancel.cancel();
                return Err(err.into());
            }
        };
        if !reconciled.skipped {
            self.queue
                .publish(WorkMessage::SnapshotCompleted {
                    grouping: grouping.clone(),
                    observed_at,
                    members: snapshot.len(),
                    upserted: reconciled.upserted,
                    deleted: reconciled.deleted,
                })
                .await?;
        }
        outcome.reconciled = Some(reconciled);
        Ok(outcome)
    }

    /// Look items up directly and compare them with what extraction stored.
    pub async fn verify_items(&self, run: &StreamRun, ids: &[String]) -> Result<VerifyReport, SyncError> {
        let live = self.retry.fetch_by_id(run.source.as_ref(), ids).await?;
        let by_id: HashMap<&str, &ExtractedItem> =
            live.iter().map(|item| (item.item_id.as_str(), item)).collect();

        let mut report = VerifyReport {
            stream: run.stream.clone(),
            requested: ids.len(),
            found: 0,
            missing: Vec::new(),
            unstored: Vec::new(),
            drifted: Vec::new(),
        };
        for id in ids {
            let Some(item) = by_id.get(id.as_str()) else {
                report.missing.push(id.clone());
                continue;
            };
            report.found += 1;
            let key = PayloadKey::new(&run.stream.org_id, &run.stream.source_id, id);
            match self.payloads.get(&key).await {
                Ok(stored) => {
                    let current = serde_json::to_vec(&item.raw).map_err(|e| {
                        PersistenceError::Corrupt(format!("encoding payload for {id}: {e}"))
                    })?;
                    if PayloadStore::sha256_hex(&stored) != PayloadStore::sha256_hex(&current) {
                        report.drifted.push(id.clone());
                    }
                }
                Err(PersistenceError::NotFound(_)) => report.unstored.push(id.clone()),
                Err(err) => return Err(err.into()),
            }
        }
        info!(
            stream = %run.stream,
            requested = report.requested,
            found = report.found,
            missing = report.missing.len(),
            drifted = report.drifted.len(),
            "verified items"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item_at, resolved_item_at, ts, ScriptedSource};
    use crate::MemoryWorkQueue;
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;
    use tempfile::{tempdir, TempDir};
    use wis_adapters::{FetchError, FixtureSource};
    use wis_core::{PaginationStyle, SourceKind, WatermarkSemantics};
    use wis_storage::{BackoffPolicy, MemoryCursorStore, MemoryReconciliationStore};

    struct Harness {
        pipeline: SyncPipeline,
        cursors: Arc<MemoryCursorStore>,
        memberships: Arc<MemoryReconciliationStore>,
        queue: Arc<MemoryWorkQueue>,
        _dir: TempDir,
    }

    fn settings() -> RunSettings {
        RunSettings {
            backoff: BackoffPolicy {
                initial: StdDuration::ZERO,
                ceiling: StdDuration::ZERO,
            },
            ..RunSettings::default()
        }
    }

    fn harness_with(settings: RunSettings) -> Harness {
        let dir = tempdir().expect("tempdir");
        let cursors = Arc::new(MemoryCursorStore::new());
        let memberships = Arc::new(MemoryReconciliationStore::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let pipeline = SyncPipeline::new(
            settings,
            cursors.clone(),
            memberships.clone(),
            PayloadStore::new(dir.path().join("payloads")),
            queue.clone(),
        );
        Harness {
            pipeline,
            cursors,
            memberships,
            queue,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(settings())
    }

    fn stream() -> StreamKey {
        StreamKey::new("acme", "tracker")
    }

    fn cursor_at(watermark: Option<DateTime<Utc>>, batch_size: u32) -> SyncCursor {
        let mut cursor = SyncCursor::initial(stream());
        cursor.next_watermark = watermark;
        cursor.batch_size = batch_size;
        cursor
    }

    fn fixture(groupings: Vec<(&str, Vec<ExtractedItem>)>) -> FixtureSource {
        let map: BTreeMap<String, Vec<ExtractedItem>> = groupings
            .into_iter()
            .map(|(ctx, items)| (ctx.to_string(), items))
            .collect();
        FixtureSource::from_items("tracker", SourceKind::Jira, map)
    }

    fn stream_run(source: impl SourceApi + 'static, groupings: &[&str]) -> StreamRun {
        StreamRun::new(
            stream(),
            Arc::new(source),
            groupings.iter().map(|g| g.to_string()).collect(),
        )
    }

    fn tied_items(count: usize, at: DateTime<Utc>) -> Vec<ExtractedItem> {
        (0..count).map(|i| item_at(&format!("t{i:03}"), at)).collect()
    }

    #[tokio::test]
    async fn natural_exhaustion_advances_watermark_to_newest_change() {
        let h = harness();
        h.cursors.seed(cursor_at(Some(ts(0)), 500)).await;
        let source = fixture(vec![(
            "board-1",
            vec![item_at("a", ts(1)), item_at("b", ts(2)), item_at("c", ts(2))],
        )]);
        let run = stream_run(source, &["board-1"]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        let outcome = &report.groupings[0];
        assert_eq!(outcome.items, 3);
        assert_eq!(outcome.termination, Some(Termination::Exhausted));
        assert!(!outcome.boundary_open);

        let committed = report.committed.expect("committed");
        assert_eq!(committed.next_watermark, Some(ts(2)));
        assert_eq!(committed.batch_size, 600);
        assert_eq!(h.queue.extracted_item_ids().await, vec!["a", "b", "c"]);

        let stored = h
            .pipeline
            .payloads()
            .get(&PayloadKey::new("acme", "tracker", "b"))
            .await
            .unwrap();
        assert_eq!(stored, serde_json::to_vec(&item_at("b", ts(2)).raw).unwrap());
    }

    #[tokio::test]
    async fn tie_on_watermark_is_drained_past_the_batch_size() {
        let h = harness();
        h.cursors.seed(cursor_at(Some(ts(10)), 100)).await;
        let run = stream_run(fixture(vec![("board-1", tied_items(150, ts(10)))]), &["board-1"]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        let outcome = &report.groupings[0];
        assert_eq!(outcome.items, 150);
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.termination, Some(Termination::Exhausted));
        assert_eq!(report.committed.unwrap().next_watermark, Some(ts(10)));
    }

    #[tokio::test]
    async fn tied_items_split_by_batch_are_not_lost_across_runs() {
        for semantics in [WatermarkSemantics::Inclusive, WatermarkSemantics::Exclusive] {
            let h = harness();
            h.cursors.seed(cursor_at(Some(ts(0)), 100)).await;
            let source = fixture(vec![("board-1", tied_items(150, ts(10)))])
                .with_pagination(PaginationStyle::Offset)
                .with_watermark_semantics(semantics);
            let run = stream_run(source, &["board-1"]).with_page_size(Some(100));
            let cancel = CancellationToken::new();

            let first = h.pipeline.run_extraction(&run, &cancel).await.unwrap();
            assert_eq!(first.groupings[0].items, 100);
            assert_eq!(first.groupings[0].termination, Some(Termination::BatchFilled));
            let after_first = first.committed.unwrap().next_watermark.unwrap();
            assert!(after_first <= ts(10));

            h.pipeline.run_extraction(&run, &cancel).await.unwrap();
            let seen: HashSet<String> = h.queue.extracted_item_ids().await.into_iter().collect();
            assert_eq!(seen.len(), 150, "{semantics:?}");
        }
    }

    #[tokio::test]
    async fn expired_budget_stops_paging_and_shrinks_batch() {
        let h = harness_with(RunSettings {
            run_budget: chrono::Duration::zero(),
            safety_margin: chrono::Duration::zero(),
            ..settings()
        });
        h.cursors.seed(cursor_at(Some(ts(0)), 500)).await;
        let items = (1..=5).map(|i| item_at(&i.to_string(), ts(i))).collect();
        let run = stream_run(fixture(vec![("board-1", items)]), &["board-1"]).with_page_size(Some(2));

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        let outcome = &report.groupings[0];
        assert_eq!(outcome.pages, 1);
        assert_eq!(outcome.termination, Some(Termination::BudgetExpired));
        let committed = report.committed.unwrap();
        assert_eq!(committed.batch_size, 400);
        assert_eq!(committed.next_watermark, Some(ts(2)));
    }

    #[tokio::test]
    async fn throttled_grouping_keeps_partial_results_and_sets_resume_after() {
        let h = harness();
        h.cursors.seed(cursor_at(Some(ts(0)), 500)).await;
        let source = ScriptedSource::cursor(vec![
            Ok(ScriptedSource::page(vec![item_at("a", ts(1))], Some("next"))),
            Err(FetchError::Throttled { retry_after: ts(100) }),
        ]);
        let run = stream_run(source, &["board-1"]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.groupings[0].status, GroupingStatus::Throttled);
        assert_eq!(h.queue.extracted_item_ids().await, vec!["a"]);
        let committed = report.committed.unwrap();
        assert_eq!(committed.next_watermark, Some(ts(1)));
        assert_eq!(committed.resume_after, Some(ts(100)));
    }

    #[tokio::test]
    async fn run_before_resume_after_is_deferred() {
        let h = harness();
        let mut cursor = cursor_at(Some(ts(0)), 500);
        cursor.resume_after = Some(Utc::now() + chrono::Duration::hours(1));
        h.cursors.seed(cursor.clone()).await;
        let source = Arc::new(ScriptedSource::endless_cursor());
        let run = StreamRun::new(stream(), source.clone(), vec!["board-1".into()]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Deferred);
        assert_eq!(source.calls(), 0);
        assert_eq!(h.cursors.get(&stream()).await.unwrap(), Some(cursor));
    }

    #[tokio::test]
    async fn fatal_grouping_does_not_block_siblings_or_advance_cursor() {
        let h = harness();
        h.cursors.seed(cursor_at(Some(ts(0)), 500)).await;
        let source = ScriptedSource::offset(Vec::new())
            .with_context_script("broken", vec![Err(FetchError::Fatal("401 Unauthorized".into()))])
            .with_context_script(
                "healthy",
                vec![Ok(ScriptedSource::page(vec![item_at("x", ts(5))], None))],
            );
        let run = stream_run(source, &["broken", "healthy"]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.count(GroupingStatus::Failed), 1);
        assert_eq!(report.count(GroupingStatus::Completed), 1);
        let broken = &report.groupings[0];
        assert_eq!(broken.grouping.context_id, "broken");
        assert!(broken.error.as_deref().unwrap().contains("401"));
        assert_eq!(h.queue.extracted_item_ids().await, vec!["x"]);
        assert_eq!(report.committed.unwrap().next_watermark, Some(ts(0)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_the_run() {
        let h = harness();
        let source = ScriptedSource::offset(vec![
            Err(FetchError::Transient("503".into())),
            Ok(ScriptedSource::page(vec![item_at("a", ts(3))], None)),
        ]);
        let run = stream_run(source, &["board-1"]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.committed.unwrap().next_watermark, Some(ts(3)));
    }

    #[tokio::test]
    async fn cancelled_run_commits_nothing_and_releases_lease() {
        let h = harness();
        h.cursors.seed(cursor_at(Some(ts(0)), 500)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = stream_run(fixture(vec![("board-1", vec![item_at("a", ts(1))])]), &["board-1"]);

        let report = h.pipeline.run_extraction(&run, &cancel).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.committed.is_none());
        assert_eq!(
            h.cursors.get(&stream()).await.unwrap().unwrap().next_watermark,
            Some(ts(0))
        );
        assert!(h.cursors.try_acquire(&stream()).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_run_of_same_stream_is_skipped() {
        let h = harness();
        assert!(h.cursors.try_acquire(&stream()).await.unwrap());
        let run = stream_run(fixture(vec![("board-1", vec![item_at("a", ts(1))])]), &["board-1"]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Skipped);
        assert!(h.queue.messages().await.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_aborts_run_without_commit() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let cursors = Arc::new(MemoryCursorStore::new());
        cursors.seed(cursor_at(Some(ts(0)), 500)).await;
        let pipeline = SyncPipeline::new(
            settings(),
            cursors.clone(),
            Arc::new(MemoryReconciliationStore::new()),
            PayloadStore::new(&blocker),
            Arc::new(MemoryWorkQueue::new()),
        );
        let run = stream_run(fixture(vec![("board-1", vec![item_at("a", ts(1))])]), &["board-1"]);

        let err = pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Persistence(_)));
        assert_eq!(
            cursors.get(&stream()).await.unwrap().unwrap().next_watermark,
            Some(ts(0))
        );
        assert!(cursors.try_acquire(&stream()).await.unwrap());
        cursors.release(&stream()).await.unwrap();

        let summary = pipeline
            .run_all(std::slice::from_ref(&run), RunKind::Extraction, &CancellationToken::new())
            .await;
        assert_eq!(summary.stream_count(RunStatus::Aborted), 1);
    }

    #[tokio::test]
    async fn shared_and_excluded_items_are_filtered() {
        let h = harness();
        let source = fixture(vec![
            ("board-1", vec![item_at("shared", ts(1)), resolved_item_at("old", ts(2), ts(0))]),
            ("board-2", vec![item_at("shared", ts(1)), item_at("fresh", ts(3))]),
        ]);
        let run = stream_run(source, &["board-1", "board-2"]).with_exclude_before(Some(ts(1)));

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        let mut emitted = h.queue.extracted_item_ids().await;
        emitted.sort();
        assert_eq!(emitted, vec!["fresh", "shared"]);
        let excluded: u64 = report.groupings.iter().map(|g| g.excluded).sum();
        let duplicates: u64 = report.groupings.iter().map(|g| g.duplicates).sum();
        assert_eq!((excluded, duplicates), (1, 1));
        assert_eq!(report.committed.unwrap().next_watermark, Some(ts(2)));
    }

    #[tokio::test]
    async fn configured_exclusion_threshold_is_stored_on_the_cursor() {
        let h = harness();
        let items = vec![resolved_item_at("old", ts(2), ts(0)), item_at("open", ts(4))];
        let configured = stream_run(fixture(vec![("board-1", items)]), &["board-1"])
            .with_exclude_before(Some(ts(1)));

        let report = h.pipeline.run_extraction(&configured, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.committed.unwrap().exclude_before, Some(ts(1)));

        let later = vec![resolved_item_at("late", ts(6), ts(0)), item_at("open", ts(4))];
        let unconfigured = stream_run(fixture(vec![("board-1", later)]), &["board-1"]);
        let report = h.pipeline.run_extraction(&unconfigured, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.groupings[0].excluded, 1);
        assert_eq!(report.committed.unwrap().exclude_before, Some(ts(1)));
    }

    #[tokio::test]
    async fn watermark_is_monotonic_across_runs() {
        let h = harness();
        let run = stream_run(
            fixture(vec![("board-1", vec![item_at("a", ts(4)), item_at("b", ts(8))])]),
            &["board-1"],
        );
        let cancel = CancellationToken::new();
        let mut previous = None;
        for _ in 0..3 {
            let report = h.pipeline.run_extraction(&run, &cancel).await.unwrap();
            let watermark = report.committed.unwrap().next_watermark;
            assert!(watermark >= previous);
            previous = watermark;
        }
        assert_eq!(previous, Some(ts(8)));
    }

    #[tokio::test]
    async fn empty_grouping_does_not_hold_back_the_first_full_sync() {
        let h = harness();
        let run = stream_run(
            fixture(vec![
                ("busy", vec![item_at("a", ts(5)), item_at("b", ts(8))]),
                ("empty", Vec::new()),
            ]),
            &["busy", "empty"],
        );
        let cancel = CancellationToken::new();

        let first = h.pipeline.run_extraction(&run, &cancel).await.unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.committed.unwrap().next_watermark, Some(ts(8)));

        let second = h.pipeline.run_extraction(&run, &cancel).await.unwrap();
        assert_eq!(second.committed.unwrap().next_watermark, Some(ts(8)));
    }

    #[tokio::test]
    async fn failed_grouping_keeps_a_full_sync_pending() {
        let h = harness();
        let source = ScriptedSource::offset(Vec::new())
            .with_context_script("broken", vec![Err(FetchError::Fatal("403 Forbidden".into()))])
            .with_context_script(
                "healthy",
                vec![Ok(ScriptedSource::page(vec![item_at("x", ts(5))], None))],
            );
        let run = stream_run(source, &["broken", "healthy"]);

        let report = h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.committed.unwrap().next_watermark, None);
    }

    #[tokio::test]
    async fn membership_refresh_reconciles_complete_snapshots() {
        let h = harness();
        let first = stream_run(
            fixture(vec![("board-1", vec![item_at("a", ts(1)), item_at("b", ts(2))])]),
            &["board-1"],
        );
        let report = h.pipeline.refresh_memberships(&first, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.groupings[0].reconciled.unwrap().upserted, 2);

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let second = stream_run(fixture(vec![("board-1", vec![item_at("b", ts(3))])]), &["board-1"]);
        let report = h.pipeline.refresh_memberships(&second, &CancellationToken::new()).await.unwrap();
        let reconciled = report.groupings[0].reconciled.unwrap();
        assert_eq!((reconciled.upserted, reconciled.deleted), (1, 1));

        let members = h.memberships.members(&stream().grouping("board-1")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].item_id, "b");
        let snapshots = h
            .queue
            .messages()
            .await
            .into_iter()
            .filter(|m| matches!(m, WorkMessage::SnapshotCompleted { .. }))
            .count();
        assert_eq!(snapshots, 2);
    }

    #[tokio::test]
    async fn truncated_membership_snapshot_is_discarded() {
        let h = harness_with(RunSettings {
            page_ceiling: 3,
            ..settings()
        });
        let run = stream_run(ScriptedSource::endless_cursor(), &["board-1"]);

        let report = h.pipeline.refresh_memberships(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Partial);
        let outcome = &report.groupings[0];
        assert_eq!(outcome.status, GroupingStatus::Incomplete);
        assert_eq!(outcome.termination, Some(Termination::CeilingReached));
        assert!(outcome.reconciled.is_none());
        assert!(h
            .memberships
            .members(&stream().grouping("board-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn membership_pagination_ignores_watermark() {
        let h = harness();
        h.cursors.seed(cursor_at(Some(ts(50)), 500)).await;
        let source = Arc::new(ScriptedSource::offset(vec![Ok(ScriptedSource::page(
            vec![item_at("a", ts(1))],
            None,
        ))]));
        let run = StreamRun::new(stream(), source.clone(), vec!["board-1".into()]);
        h.pipeline.refresh_memberships(&run, &CancellationToken::new()).await.unwrap();
        assert_eq!(source.requests()[0].watermark, None);
    }

    #[tokio::test]
    async fn verify_reports_missing_and_drifted_items() {
        let h = harness();
        let run = stream_run(
            fixture(vec![("board-1", vec![item_at("a", ts(1)), item_at("b", ts(2))])]),
            &["board-1"],
        );
        h.pipeline.run_extraction(&run, &CancellationToken::new()).await.unwrap();

        let ids = vec!["a".to_string(), "b".to_string(), "zzz".to_string()];
        let clean = h.pipeline.verify_items(&run, &ids).await.unwrap();
        assert_eq!(clean.found, 2);
        assert_eq!(clean.missing, vec!["zzz"]);
        assert!(clean.drifted.is_empty());

        h.pipeline
            .payloads()
            .put(&PayloadKey::new("acme", "tracker", "b"), b"{\"stale\":true}")
            .await
            .unwrap();
        let drifted = h.pipeline.verify_items(&run, &ids).await.unwrap();
        assert_eq!(drifted.drifted, vec!["b"]);
    }

    #[tokio::test]
    async fn run_summary_is_written_as_json() {
        let h = harness();
        let run = stream_run(fixture(vec![("board-1", vec![item_at("a", ts(1))])]), &["board-1"]);
        let summary = h
            .pipeline
            .run_all(std::slice::from_ref(&run), RunKind::Extraction, &CancellationToken::new())
            .await;
        assert_eq!(summary.stream_count(RunStatus::Completed), 1);
        assert_eq!(summary.grouping_count(GroupingStatus::Completed), 1);

        let dir = tempdir().expect("tempdir");
        let path = write_run_summary(dir.path(), &summary).await.unwrap();
        assert!(path.ends_with(format!("{}/run_summary.json", summary.run_id)));
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["kind"], "extraction");
        assert_eq!(written["streams"][0]["status"], "completed");
        assert_eq!(written["streams"][0]["groupings"][0]["termination"]["reason"], "exhausted");
    }
}
