//! Source API contracts, tracker payload decoders, and source implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wis_core::{ExtractedItem, Page, PageRequest, PaginationStyle, SourceKind, WatermarkSemantics};
use wis_storage::{HttpAuth, HttpFetcher};

mod decode;
mod fixture;
mod http_source;

pub use decode::{decode_item, decode_page, parse_timestamp, DecodeError};
pub use fixture::{FixtureFile, FixtureSource};
pub use http_source::{HttpSource, HttpSourceConfig};

pub const CRATE_NAME: &str = "wis-adapters";

/// Fallback wait when a throttled response carries no usable `Retry-After`.
pub const DEFAULT_THROTTLE_BACKOFF_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Source-imposed rate limit. Recoverable by waiting until `retry_after`.
    #[error("throttled by source until {retry_after}")]
    Throttled { retry_after: DateTime<Utc> },
    /// Network failure or 5xx. Recoverable by retry.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// Auth failure, malformed response, schema violation.
    #[error("fatal source failure: {0}")]
    Fatal(String),
}

impl From<DecodeError> for FetchError {
    fn from(err: DecodeError) -> Self {
        FetchError::Fatal(format!("malformed response: {err}"))
    }
}

#[async_trait]
pub trait SourceApi: Send + Sync {
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn pagination_style(&self) -> PaginationStyle;

    fn watermark_semantics(&self) -> WatermarkSemantics {
        WatermarkSemantics::Inclusive
    }

    /// One page of items changed since `request.watermark`, in ascending change order.
    async fn fetch_changed_page(&self, request: &PageRequest) -> Result<Page, FetchError>;

    /// Direct lookup used for integrity checks, not for sync.
    async fn fetch_by_id(&self, ids: &[String]) -> Result<Vec<ExtractedItem>, FetchError>;
}

pub fn default_pagination_for(kind: SourceKind) -> PaginationStyle {
    match kind {
        SourceKind::Jira | SourceKind::Kanbanize => PaginationStyle::Offset,
        SourceKind::AzureBoards => PaginationStyle::Cursor,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Http,
    Fixture,
}

/// Names of the environment variables holding a source's credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthSpec {
    Basic { username_env: String, token_env: String },
    Bearer { token_env: String },
}

impl AuthSpec {
    fn resolve(&self) -> Result<HttpAuth> {
        let read = |name: &str| {
            std::env::var(name).with_context(|| format!("credential variable {name} is not set"))
        };
        Ok(match self {
            AuthSpec::Basic {
                username_env,
                token_env,
            } => HttpAuth::Basic {
                username: read(username_env)?,
                token: read(token_env)?,
            },
            AuthSpec::Bearer { token_env } => HttpAuth::Bearer(read(token_env)?),
        })
    }
}

/// Source entry as written in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub kind: SourceKind,
    pub mode: SourceMode,
    #[serde(default)]
    pub pagination: Option<PaginationStyle>,
    #[serde(default)]
    pub watermark_semantics: WatermarkSemantics,
    #[serde(default)]
    pub page_url_template: Option<String>,
    #[serde(default)]
    pub by_id_url_template: Option<String>,
    #[serde(default)]
    pub continuation_param: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

/// Build the source implementation a registry entry asks for.
pub fn build_source(
    spec: &SourceSpec,
    http: Arc<HttpFetcher>,
    workspace_root: &std::path::Path,
) -> Result<Arc<dyn SourceApi>> {
    let pagination = spec
        .pagination
        .unwrap_or_else(|| default_pagination_for(spec.kind));
    match spec.mode {
        SourceMode::Fixture => {
            let Some(rel) = &spec.fixture_path else {
                bail!("fixture source {} has no fixture_path", spec.source_id);
            };
            let source = FixtureSource::load(workspace_root.join(rel))?
                .with_pagination(pagination)
                .with_watermark_semantics(spec.watermark_semantics);
            Ok(Arc::new(source))
        }
        SourceMode::Http => {
            let Some(page_url_template) = spec.page_url_template.clone() else {
                bail!("http source {} has no page_url_template", spec.source_id);
            };
            let auth = spec.auth.as_ref().map(AuthSpec::resolve).transpose()?;
            let config = HttpSourceConfig {
                source_id: spec.source_id.clone(),
                kind: spec.kind,
                pagination,
                watermark_semantics: spec.watermark_semantics,
                page_url_template,
                by_id_url_template: spec.by_id_url_template.clone(),
                continuation_param: spec
                    .continuation_param
                    .clone()
                    .unwrap_or_else(|| "continuationToken".to_string()),
                auth,
            };
            Ok(Arc::new(HttpSource::new(config, http)))
        }
    }
}
