use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use wis_adapters::{FetchError, SourceApi};
use wis_core::{
    ExtractedItem, JiraIssue, Page, PagePosition, PageRequest, PaginationStyle, SourceKind,
    SourcePayload,
};

/// `2024-01-01T00:00:00Z` plus `secs`.
pub fn ts(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap() + Duration::seconds(secs.into())
}

pub fn item_at(id: &str, changed_at: DateTime<Utc>) -> ExtractedItem {
    ExtractedItem {
        item_id: id.to_string(),
        changed_at,
        resolved_at: None,
        payload: SourcePayload::Jira(JiraIssue {
            id: id.to_string(),
            key: format!("P-{id}"),
            issue_type: None,
            status: None,
            summary: None,
            updated: changed_at,
            resolution_date: None,
        }),
        raw: json!({ "id": id, "fields": { "updated": changed_at.to_rfc3339() } }),
    }
}

pub fn resolved_item_at(
    id: &str,
    changed_at: DateTime<Utc>,
    resolved_at: DateTime<Utc>,
) -> ExtractedItem {
    let mut item = item_at(id, changed_at);
    item.resolved_at = Some(resolved_at);
    item
}

use crate::config::SyncConfig;

const REGISTRY: &str = r#"
sources:
  - org_id: acme
    source_id: jira-cloud
    kind: jira
    mode: fixture
    fixture_path: fixtures/jira.json
    groupings: [board-1, board-2]
  - org_id: acme
    source_id: boards
    kind: azure_boards
    mode: http
    enabled: false
    page_url_template: "https://example.invalid/{{context}}"
"#;

/// Workspace with a registry of one enabled fixture stream and one disabled http stream.
pub async fn fixture_workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("sources.yaml"), REGISTRY).await.unwrap();
    tokio::fs::create_dir_all(dir.path().join("fixtures")).await.unwrap();
    let fixture = json!({
        "source_id": "jira-cloud",
        "kind": "jira",
        "groupings": {
            "board-1": [
                { "id": "1", "key": "P-1", "fields": { "updated": "2024-01-01T00:00:00Z" } },
                { "id": "2", "key": "P-2", "fields": { "updated": "2024-01-01T00:00:05Z" } }
            ],
            "board-2": [
                { "id": "2", "key": "P-2", "fields": { "updated": "2024-01-01T00:00:05Z" } }
            ]
        }
    });
    tokio::fs::write(
        dir.path().join("fixtures/jira.json"),
        serde_json::to_vec(&fixture).unwrap(),
    )
    .await
    .unwrap();
    dir
}

/// Memory-backed config rooted at `root`, with extra variables layered on top.
pub fn memory_config(root: &TempDir, extra: &[(&str, &str)]) -> SyncConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("WIS_STORE".to_string(), "memory".to_string()),
        ("WIS_WORKSPACE_ROOT".to_string(), root.path().display().to_string()),
    ]);
    for (name, value) in extra {
        vars.insert(name.to_string(), value.to_string());
    }
    SyncConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

type Script = VecDeque<Result<Page, FetchError>>;

/// Source that replays canned responses, optionally per grouping, and records requests.
pub struct ScriptedSource {
    style: PaginationStyle,
    endless: bool,
    default_script: Mutex<Script>,
    per_context: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedSource {
    fn with_style(style: PaginationStyle, script: Vec<Result<Page, FetchError>>) -> Self {
        Self {
            style,
            endless: false,
            default_script: Mutex::new(script.into()),
            per_context: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn cursor(script: Vec<Result<Page, FetchError>>) -> Self {
        Self::with_style(PaginationStyle::Cursor, script)
    }

    pub fn offset(script: Vec<Result<Page, FetchError>>) -> Self {
        Self::with_style(PaginationStyle::Offset, script)
    }

    /// Every call returns one item and a fresh continuation token.
    pub fn endless_cursor() -> Self {
        let mut source = Self::cursor(Vec::new());
        source.endless = true;
        source
    }

    pub fn with_context_script(
        self,
        context_id: &str,
        script: Vec<Result<Page, FetchError>>,
    ) -> Self {
        self.per_context
            .lock()
            .unwrap()
            .insert(context_id.to_string(), script.into());
        self
    }

    pub fn page(items: Vec<ExtractedItem>, next_token: Option<&str>) -> Page {
        Page {
            items,
            next_token: next_token.map(str::to_string),
            total_hint: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn positions(&self) -> Vec<PagePosition> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.position.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceApi for ScriptedSource {
    fn source_id(&self) -> &str {
        "tracker"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Jira
    }

    fn pagination_style(&self) -> PaginationStyle {
        self.style
    }

    async fn fetch_changed_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if self.endless {
            return Ok(Self::page(
                vec![item_at(&format!("e{call}"), ts(1))],
                Some(&format!("t{call}")),
            ));
        }
        let next = {
            let mut per_context = self.per_context.lock().unwrap();
            match per_context.get_mut(&request.grouping.context_id) {
                Some(script) => script.pop_front(),
                None => self.default_script.lock().unwrap().pop_front(),
            }
        };
        next.unwrap_or_else(|| Ok(Page::default()))
    }

    async fn fetch_by_id(&self, _ids: &[String]) -> Result<Vec<ExtractedItem>, FetchError> {
        Err(FetchError::Fatal("scripted source has no by-id lookup".into()))
    }
}
