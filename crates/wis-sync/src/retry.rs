use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use wis_adapters::{FetchError, SourceApi};
use wis_core::{ExtractedItem, Page, PageRequest};
use wis_storage::BackoffPolicy;

pub const DEFAULT_MAX_FETCH_ATTEMPTS: u32 = 3;

/// Wraps source calls with bounded retry of transient failures.
///
/// `Throttled` and `Fatal` are returned on first sight: a throttled source is never
/// retried inside the run that saw it.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FETCH_ATTEMPTS, BackoffPolicy::default())
    }
}

impl RetryHandler {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn fetch_page(
        &self,
        source: &dyn SourceApi,
        request: &PageRequest,
    ) -> Result<Page, FetchError> {
        self.call("fetch_changed_page", || source.fetch_changed_page(request))
            .await
    }

    pub async fn fetch_by_id(
        &self,
        source: &dyn SourceApi,
        ids: &[String],
    ) -> Result<Vec<ExtractedItem>, FetchError> {
        self.call("fetch_by_id", || source.fetch_by_id(ids)).await
    }

    pub async fn call<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(FetchError::Transient(cause)) if attempt < self.max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    debug!(operation, attempt, delay_ms = delay.as_millis() as u64, %cause, "retrying transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(FetchError::Transient(cause)) => {
                    warn!(operation, attempts = attempt, %cause, "transient failures exhausted retries");
                    return Err(FetchError::Fatal(format!(
                        "{cause} (gave up after {attempt} attempts)"
                    )));
                }
                other => return other,
            }
        }
    }
}

/// Cap a candidate watermark at the instant the source said it will be ready again.
pub fn reschedule_watermark(
    candidate: Option<DateTime<Utc>>,
    retry_after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    candidate.map(|watermark| watermark.min(retry_after))
}
