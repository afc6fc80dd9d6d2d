use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};
use wis_core::{
    ExtractedItem, Page, PagePosition, PageRequest, PaginationStyle, SourceKind,
    WatermarkSemantics,
};
use wis_storage::{classify_reqwest_error, HttpAuth, HttpFetcher, ResponseDisposition};

use crate::{decode_page, FetchError, SourceApi, DEFAULT_THROTTLE_BACKOFF_SECS};

const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    pub pagination: PaginationStyle,
    pub watermark_semantics: WatermarkSemantics,
    /// Placeholders: `{{context}}`, `{{since}}`, `{{limit}}`, `{{offset}}`.
    pub page_url_template: String,
    /// Placeholder: `{{ids}}` (comma separated).
    pub by_id_url_template: Option<String>,
    pub continuation_param: String,
    pub auth: Option<HttpAuth>,
}

/// Tracker REST source. One HTTP attempt per call; retries are the caller's job.
#[derive(Debug)]
pub struct HttpSource {
    config: HttpSourceConfig,
    http: Arc<HttpFetcher>,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn page_url(&self, request: &PageRequest) -> String {
        let since = request
            .watermark
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let offset = match &request.position {
            PagePosition::Offset(offset) => *offset,
            PagePosition::Start | PagePosition::Token(_) => 0,
        };
        let mut url = self
            .config
            .page_url_template
            .replace("{{context}}", &urlencoding::encode(&request.grouping.context_id))
            .replace("{{since}}", &urlencoding::encode(&since))
            .replace("{{limit}}", &request.page_size.to_string())
            .replace("{{offset}}", &offset.to_string());

        if let PagePosition::Token(token) = &request.position {
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push(separator);
            url.push_str(&self.config.continuation_param);
            url.push('=');
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    async fn get_page(&self, url: &str) -> Result<Page, FetchError> {
        let response = self
            .http
            .get(&self.config.source_id, url, self.config.auth.as_ref())
            .await
            .map_err(|err| match classify_reqwest_error(&err) {
                ResponseDisposition::Transient => FetchError::Transient(err.to_string()),
                _ => FetchError::Fatal(err.to_string()),
            })?;

        match response.disposition() {
            None => {}
            Some(ResponseDisposition::Throttled) => {
                let wait = response
                    .retry_after()
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_THROTTLE_BACKOFF_SECS));
                warn!(source_id = %self.config.source_id, wait_secs = wait.num_seconds(), "source throttled");
                return Err(FetchError::Throttled {
                    retry_after: Utc::now() + wait,
                });
            }
            Some(ResponseDisposition::Transient) => {
                return Err(FetchError::Transient(format!(
                    "{} from {}: {}",
                    response.status,
                    response.final_url,
                    response.body_snippet()
                )));
            }
            Some(ResponseDisposition::Fatal) => {
                return Err(FetchError::Fatal(format!(
                    "{} from {}: {}",
                    response.status,
                    response.final_url,
                    response.body_snippet()
                )));
            }
        }

        let header_token = response
            .headers
            .get(CONTINUATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let page = decode_page(self.config.kind, &response.body, header_token)?;
        debug!(
            source_id = %self.config.source_id,
            items = page.items.len(),
            has_next = page.next_token.is_some(),
            "decoded page"
        );
        Ok(page)
    }
}

#[async_trait]
impl SourceApi for HttpSource {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> SourceKind {
        self.config.kind
    }

    fn pagination_style(&self) -> PaginationStyle {
        self.config.pagination
    }

    fn watermark_semantics(&self) -> WatermarkSemantics {
        self.config.watermark_semantics
    }

    async fn fetch_changed_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let url = self.page_url(request);
        self.get_page(&url).await
    }

    async fn fetch_by_id(&self, ids: &[String]) -> Result<Vec<ExtractedItem>, FetchError> {
        let Some(template) = &self.config.by_id_url_template else {
            return Err(FetchError::Fatal(format!(
                "source {} has no by-id endpoint configured",
                self.config.source_id
            )));
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids.join(",");
        let url = template.replace("{{ids}}", &urlencoding::encode(&joined));
        Ok(self.get_page(&url).await?.items)
    }
}
