//! Core domain model for incremental work-item extraction and membership reconciliation.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "wis-core";

pub const MIN_BATCH_SIZE: u32 = 100;
pub const MAX_BATCH_SIZE: u32 = 2000;
pub const BATCH_SIZE_STEP: u32 = 100;
pub const DEFAULT_BATCH_SIZE: u32 = 500;

/// One (org, source) extraction stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub org_id: String,
    pub source_id: String,
}

impl StreamKey {
    pub fn new(org_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            source_id: source_id.into(),
        }
    }

    pub fn grouping(&self, context_id: impl Into<String>) -> GroupingKey {
        GroupingKey {
            org_id: self.org_id.clone(),
            source_id: self.source_id.clone(),
            context_id: context_id.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org_id, self.source_id)
    }
}

/// A logical bucket (board, filter, project) that owns a set of item memberships.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupingKey {
    pub org_id: String,
    pub source_id: String,
    pub context_id: String,
}

impl GroupingKey {
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.org_id.clone(), self.source_id.clone())
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.source_id, self.context_id)
    }
}

/// Persisted extraction state for one stream.
///
/// Values are immutable: a run reads one at start and produces a new one through
/// [`SyncCursor::advanced`] when it commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub stream: StreamKey,
    pub last_run_at: Option<DateTime<Utc>>,
    /// `None` means full sync from epoch.
    pub next_watermark: Option<DateTime<Utc>>,
    pub batch_size: u32,
    pub exclude_before: Option<DateTime<Utc>>,
    /// Set after a throttled run; runs starting earlier are deferred.
    pub resume_after: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn initial(stream: StreamKey) -> Self {
        Self {
            stream,
            last_run_at: None,
            next_watermark: None,
            batch_size: DEFAULT_BATCH_SIZE,
            exclude_before: None,
            resume_after: None,
        }
    }

    pub fn with_exclude_before(mut self, exclude_before: Option<DateTime<Utc>>) -> Self {
        self.exclude_before = exclude_before;
        self
    }

    pub fn is_full_sync(&self) -> bool {
        self.next_watermark.is_none()
    }

    pub fn is_deferred_at(&self, now: DateTime<Utc>) -> bool {
        self.resume_after.is_some_and(|resume| now < resume)
    }

    /// Apply a commit. The watermark never moves backwards and the batch size stays in bounds.
    pub fn advanced(&self, commit: &CursorCommit) -> SyncCursor {
        SyncCursor {
            stream: self.stream.clone(),
            last_run_at: Some(commit.run_started_at),
            next_watermark: self.next_watermark.max(commit.next_watermark),
            batch_size: commit.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            exclude_before: commit.exclude_before.or(self.exclude_before),
            resume_after: commit.resume_after,
        }
    }
}

/// What a completed run writes back to the cursor store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorCommit {
    pub run_started_at: DateTime<Utc>,
    pub next_watermark: Option<DateTime<Utc>>,
    pub batch_size: u32,
    pub resume_after: Option<DateTime<Utc>>,
    /// Configured exclusion threshold; `None` leaves the stored one in place.
    pub exclude_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Jira,
    AzureBoards,
    Kanbanize,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Jira => "jira",
            SourceKind::AzureBoards => "azure_boards",
            SourceKind::Kanbanize => "kanbanize",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JiraIssue {
    pub id: String,
    pub key: String,
    pub issue_type: Option<String>,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub updated: DateTime<Utc>,
    pub resolution_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureWorkItem {
    pub id: i64,
    pub rev: Option<i64>,
    pub work_item_type: Option<String>,
    pub state: Option<String>,
    pub title: Option<String>,
    pub changed_date: DateTime<Utc>,
    pub closed_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KanbanizeCard {
    pub card_id: i64,
    pub board_id: Option<i64>,
    pub column_id: Option<i64>,
    pub title: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Typed per-tracker payload carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourcePayload {
    Jira(JiraIssue),
    AzureBoards(AzureWorkItem),
    Kanbanize(KanbanizeCard),
}

impl SourcePayload {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourcePayload::Jira(_) => SourceKind::Jira,
            SourcePayload::AzureBoards(_) => SourceKind::AzureBoards,
            SourcePayload::Kanbanize(_) => SourceKind::Kanbanize,
        }
    }
}

/// One work item as observed in a page of "changed since" results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub item_id: String,
    pub changed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub payload: SourcePayload,
    /// Source response fragment this item was decoded from.
    pub raw: JsonValue,
}

impl ExtractedItem {
    /// Items fully resolved before the threshold are skipped entirely.
    pub fn is_excluded_by(&self, exclude_before: Option<DateTime<Utc>>) -> bool {
        match (self.resolved_at, exclude_before) {
            (Some(resolved), Some(threshold)) => resolved < threshold,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    /// Opaque continuation token / next link returned by the server.
    Cursor,
    /// Client-computed numeric start offset.
    Offset,
}

/// How a source applies the watermark to its "changed since" filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkSemantics {
    /// `changed >= watermark`
    #[default]
    Inclusive,
    /// `changed > watermark`
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PagePosition {
    Start,
    Token(String),
    Offset(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub grouping: GroupingKey,
    /// `None` requests everything (full sync or membership snapshot).
    pub watermark: Option<DateTime<Utc>>,
    pub position: PagePosition,
    pub page_size: u32,
}

/// One fetch result, items in source order (ascending change timestamp).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<ExtractedItem>,
    pub next_token: Option<String>,
    pub total_hint: Option<u64>,
}

impl Page {
    pub fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        self.items.last().map(|item| item.changed_at)
    }

    pub fn max_changed_at(&self) -> Option<DateTime<Utc>> {
        self.items.iter().map(|item| item.changed_at).max()
    }
}

/// One run's complete view of a grouping's membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub grouping: GroupingKey,
    pub item_ids: BTreeSet<String>,
    pub observed_at: DateTime<Utc>,
}

impl MembershipSnapshot {
    pub fn new(grouping: GroupingKey, observed_at: DateTime<Utc>) -> Self {
        Self {
            grouping,
            item_ids: BTreeSet::new(),
            observed_at,
        }
    }

    pub fn with_items<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.item_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn insert(&mut self, item_id: impl Into<String>) -> bool {
        self.item_ids.insert(item_id.into())
    }

    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

/// Persisted membership row, one per (grouping, item).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub grouping: GroupingKey,
    pub item_id: String,
    pub observed_at: DateTime<Utc>,
}
