//! Per-tracker decoders from raw response JSON into [`ExtractedItem`]s.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use wis_core::{
    AzureWorkItem, ExtractedItem, JiraIssue, KanbanizeCard, Page, SourceKind, SourcePayload,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{kind} payload is missing `{field}`")]
    MissingField { kind: SourceKind, field: &'static str },
    #[error("unparseable timestamp {0:?}")]
    Timestamp(String),
    #[error("invalid {kind} payload: {source}")]
    Json {
        kind: SourceKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Accepts RFC 3339, Jira's `+0000` offsets, and naive `YYYY-MM-DD HH:MM:SS` (read as UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DecodeError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts.and_utc());
    }
    Err(DecodeError::Timestamp(value.to_string()))
}

fn opt_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>, DecodeError> {
    value.map(parse_timestamp).transpose()
}

#[derive(Debug, Deserialize)]
struct WireJiraIssue {
    id: String,
    key: String,
    fields: WireJiraFields,
}

#[derive(Debug, Deserialize)]
struct WireJiraFields {
    updated: Option<String>,
    resolutiondate: Option<String>,
    summary: Option<String>,
    status: Option<WireNamed>,
    issuetype: Option<WireNamed>,
}

#[derive(Debug, Deserialize)]
struct WireNamed {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAzureWorkItem {
    id: i64,
    rev: Option<i64>,
    fields: WireAzureFields,
}

#[derive(Debug, Deserialize)]
struct WireAzureFields {
    #[serde(rename = "System.ChangedDate")]
    changed_date: Option<String>,
    #[serde(rename = "Microsoft.VSTS.Common.ClosedDate")]
    closed_date: Option<String>,
    #[serde(rename = "System.State")]
    state: Option<String>,
    #[serde(rename = "System.WorkItemType")]
    work_item_type: Option<String>,
    #[serde(rename = "System.Title")]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireKanbanizeCard {
    card_id: i64,
    board_id: Option<i64>,
    column_id: Option<i64>,
    title: Option<String>,
    last_modified: Option<String>,
    completed_at: Option<String>,
}

fn from_json<T: serde::de::DeserializeOwned>(
    kind: SourceKind,
    value: &JsonValue,
) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|source| DecodeError::Json { kind, source })
}

pub fn decode_item(kind: SourceKind, value: &JsonValue) -> Result<ExtractedItem, DecodeError> {
    match kind {
        SourceKind::Jira => {
            let wire: WireJiraIssue = from_json(kind, value)?;
            let updated = wire.fields.updated.as_deref().ok_or(DecodeError::MissingField {
                kind,
                field: "fields.updated",
            })?;
            let issue = JiraIssue {
                id: wire.id,
                key: wire.key,
                issue_type: wire.fields.issuetype.and_then(|n| n.name),
                status: wire.fields.status.and_then(|n| n.name),
                summary: wire.fields.summary,
                updated: parse_timestamp(updated)?,
                resolution_date: opt_timestamp(wire.fields.resolutiondate.as_deref())?,
            };
            Ok(ExtractedItem {
                item_id: issue.id.clone(),
                changed_at: issue.updated,
                resolved_at: issue.resolution_date,
                payload: SourcePayload::Jira(issue),
                raw: value.clone(),
            })
        }
        SourceKind::AzureBoards => {
            let wire: WireAzureWorkItem = from_json(kind, value)?;
            let changed = wire.fields.changed_date.as_deref().ok_or(DecodeError::MissingField {
                kind,
                field: "fields.System.ChangedDate",
            })?;
            let work_item = AzureWorkItem {
                id: wire.id,
                rev: wire.rev,
                work_item_type: wire.fields.work_item_type,
                state: wire.fields.state,
                title: wire.fields.title,
                changed_date: parse_timestamp(changed)?,
                closed_date: opt_timestamp(wire.fields.closed_date.as_deref())?,
            };
            Ok(ExtractedItem {
                item_id: work_item.id.to_string(),
                changed_at: work_item.changed_date,
                resolved_at: work_item.closed_date,
                payload: SourcePayload::AzureBoards(work_item),
                raw: value.clone(),
            })
        }
        SourceKind::Kanbanize => {
            let wire: WireKanbanizeCard = from_json(kind, value)?;
            let modified = wire.last_modified.as_deref().ok_or(DecodeError::MissingField {
                kind,
                field: "last_modified",
            })?;
            let card = KanbanizeCard {
                card_id: wire.card_id,
                board_id: wire.board_id,
                column_id: wire.column_id,
                title: wire.title,
                last_modified: parse_timestamp(modified)?,
                completed_at: opt_timestamp(wire.completed_at.as_deref())?,
            };
            Ok(ExtractedItem {
                item_id: card.card_id.to_string(),
                changed_at: card.last_modified,
                resolved_at: card.completed_at,
                payload: SourcePayload::Kanbanize(card),
                raw: value.clone(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJiraSearch {
    #[serde(default)]
    issues: Vec<JsonValue>,
    total: Option<u64>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAzureBatch {
    #[serde(default)]
    value: Vec<JsonValue>,
    count: Option<u64>,
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireKanbanizeEnvelope {
    data: WireKanbanizeData,
}

#[derive(Debug, Deserialize)]
struct WireKanbanizeData {
    #[serde(default)]
    data: Vec<JsonValue>,
    pagination: Option<WireKanbanizePagination>,
}

#[derive(Debug, Deserialize)]
struct WireKanbanizePagination {
    all_pages: Option<u64>,
    results_per_page: Option<u64>,
}

/// Decode one response body. `header_token` carries a continuation token some
/// trackers return in a response header instead of the body.
pub fn decode_page(
    kind: SourceKind,
    body: &[u8],
    header_token: Option<String>,
) -> Result<Page, DecodeError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|source| DecodeError::Json { kind, source })?;

    let (raw_items, next_token, total_hint) = match kind {
        SourceKind::Jira => {
            let wire: WireJiraSearch = from_json(kind, &value)?;
            (wire.issues, wire.next_page_token, wire.total)
        }
        SourceKind::AzureBoards => {
            let wire: WireAzureBatch = from_json(kind, &value)?;
            (wire.value, wire.continuation_token.or(header_token), wire.count)
        }
        SourceKind::Kanbanize => {
            let wire: WireKanbanizeEnvelope = from_json(kind, &value)?;
            let total = wire.data.pagination.and_then(|p| {
                Some(p.all_pages?.saturating_mul(p.results_per_page?))
            });
            (wire.data.data, None, total)
        }
    };

    let items = raw_items
        .iter()
        .map(|raw| decode_item(kind, raw))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Page {
        items,
        next_token: next_token.filter(|t| !t.is_empty()),
        total_hint,
    })
}
