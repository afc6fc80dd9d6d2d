use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use wis_core::{
    ExtractedItem, Page, PagePosition, PageRequest, PaginationStyle, SourceKind,
    WatermarkSemantics,
};

use crate::{decode_item, default_pagination_for, FetchError, SourceApi};

/// Recorded tracker responses, keyed by grouping context id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    pub source_id: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub pagination: Option<PaginationStyle>,
    #[serde(default)]
    pub groupings: BTreeMap<String, Vec<JsonValue>>,
}

/// Offline source that answers page requests from a fixture file.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    kind: SourceKind,
    pagination: PaginationStyle,
    semantics: WatermarkSemantics,
    groupings: BTreeMap<String, Vec<ExtractedItem>>,
}

impl FixtureSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_file(file).with_context(|| format!("decoding items in {}", path.display()))
    }

    pub fn from_file(file: FixtureFile) -> Result<Self> {
        let mut groupings = BTreeMap::new();
        for (context_id, raw_items) in &file.groupings {
            let items = raw_items
                .iter()
                .map(|raw| decode_item(file.kind, raw))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("grouping {context_id}"))?;
            groupings.insert(context_id.clone(), items);
        }
        let pagination = file
            .pagination
            .unwrap_or_else(|| default_pagination_for(file.kind));
        Ok(Self::from_items(file.source_id, file.kind, groupings).with_pagination(pagination))
    }

    pub fn from_items(
        source_id: impl Into<String>,
        kind: SourceKind,
        groupings: BTreeMap<String, Vec<ExtractedItem>>,
    ) -> Self {
        let groupings = groupings
            .into_iter()
            .map(|(context_id, mut items)| {
                items.sort_by(|a, b| {
                    a.changed_at
                        .cmp(&b.changed_at)
                        .then_with(|| a.item_id.cmp(&b.item_id))
                });
                (context_id, items)
            })
            .collect();
        Self {
            source_id: source_id.into(),
            kind,
            pagination: default_pagination_for(kind),
            semantics: WatermarkSemantics::Inclusive,
            groupings,
        }
    }

    pub fn with_pagination(mut self, pagination: PaginationStyle) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_watermark_semantics(mut self, semantics: WatermarkSemantics) -> Self {
        self.semantics = semantics;
        self
    }

    pub fn context_ids(&self) -> impl Iterator<Item = &str> {
        self.groupings.keys().map(String::as_str)
    }

    fn start_offset(position: &PagePosition) -> Result<usize, FetchError> {
        match position {
            PagePosition::Start => Ok(0),
            PagePosition::Offset(offset) => Ok(*offset as usize),
            PagePosition::Token(token) => token
                .strip_prefix("o:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| FetchError::Fatal(format!("unknown continuation token {token:?}"))),
        }
    }
}

#[async_trait]
impl SourceApi for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn pagination_style(&self) -> PaginationStyle {
        self.pagination
    }

    fn watermark_semantics(&self) -> WatermarkSemantics {
        self.semantics
    }

    async fn fetch_changed_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let Some(items) = self.groupings.get(&request.grouping.context_id) else {
            return Ok(Page::default());
        };
        let matching: Vec<&ExtractedItem> = items
            .iter()
            .filter(|item| match (request.watermark, self.semantics) {
                (None, _) => true,
                (Some(w), WatermarkSemantics::Inclusive) => item.changed_at >= w,
                (Some(w), WatermarkSemantics::Exclusive) => item.changed_at > w,
            })
            .collect();

        let start = Self::start_offset(&request.position)?.min(matching.len());
        let end = start
            .saturating_add(request.page_size.max(1) as usize)
            .min(matching.len());
        let next_token = match self.pagination {
            PaginationStyle::Cursor if end < matching.len() => Some(format!("o:{end}")),
            _ => None,
        };

        Ok(Page {
            items: matching[start..end].iter().map(|item| (*item).clone()).collect(),
            next_token,
            total_hint: Some(matching.len() as u64),
        })
    }

    async fn fetch_by_id(&self, ids: &[String]) -> Result<Vec<ExtractedItem>, FetchError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        Ok(self
            .groupings
            .values()
            .flatten()
            .filter(|item| wanted.contains(item.item_id.as_str()))
            .filter(|item| seen.insert(item.item_id.clone()))
            .cloned()
            .collect())
    }
}
