//! Bounded page-by-page traversal of one grouping's "changed since" results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wis_adapters::{FetchError, SourceApi};
use wis_core::{GroupingKey, Page, PagePosition, PageRequest, PaginationStyle};

use crate::budget::TimeBudget;
use crate::retry::RetryHandler;

pub const DEFAULT_PAGE_CEILING: u32 = 20;

/// Why a pagination chain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// The source reported no more data.
    Exhausted,
    /// Enough items for this run's batch were fetched.
    BatchFilled,
    BudgetExpired,
    /// The iteration ceiling was hit; the chain may be malformed.
    CeilingReached,
    Throttled { retry_after: DateTime<Utc> },
    Cancelled,
    Failed,
}

impl Termination {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Termination::Exhausted)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exhausted => f.write_str("exhausted"),
            Termination::BatchFilled => f.write_str("batch_filled"),
            Termination::BudgetExpired => f.write_str("budget_expired"),
            Termination::CeilingReached => f.write_str("ceiling_reached"),
            Termination::Throttled { retry_after } => write!(f, "throttled until {retry_after}"),
            Termination::Cancelled => f.write_str("cancelled"),
            Termination::Failed => f.write_str("failed"),
        }
    }
}

/// Lazy, finite, non-restartable sequence of pages for one grouping.
///
/// Pages are fetched strictly in order. Budget, ceiling and batch limits are checked
/// between pages, so the first page is always requested unless the run is already
/// cancelled. Once [`Paginator::next_page`] returns `Ok(None)` or an error the chain is
/// over and [`Paginator::termination`] says why.
pub struct Paginator<'a> {
    source: &'a dyn SourceApi,
    retry: &'a RetryHandler,
    budget: Option<&'a TimeBudget>,
    cancel: Option<&'a CancellationToken>,
    grouping: GroupingKey,
    watermark: Option<DateTime<Utc>>,
    style: PaginationStyle,
    page_size: u32,
    batch_limit: Option<u64>,
    ceiling: u32,
    position: PagePosition,
    pages: u32,
    accumulated: u64,
    extend_past_batch: bool,
    termination: Option<Termination>,
}

impl<'a> Paginator<'a> {
    pub fn new(
        source: &'a dyn SourceApi,
        retry: &'a RetryHandler,
        grouping: GroupingKey,
        watermark: Option<DateTime<Utc>>,
        page_size: u32,
    ) -> Self {
        Self {
            style: source.pagination_style(),
            source,
            retry,
            budget: None,
            cancel: None,
            grouping,
            watermark,
            page_size: page_size.max(1),
            batch_limit: None,
            ceiling: DEFAULT_PAGE_CEILING,
            position: PagePosition::Start,
            pages: 0,
            accumulated: 0,
            extend_past_batch: false,
            termination: None,
        }
    }

    /// Stop once this many items were fetched. `None` pages to exhaustion.
    pub fn with_batch_limit(mut self, limit: Option<u32>) -> Self {
        self.batch_limit = limit.map(u64::from);
        self
    }

    pub fn with_page_ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = ceiling.max(1);
        self
    }

    pub fn with_budget(mut self, budget: &'a TimeBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Keep paging past the batch limit while a tie at the boundary timestamp is open.
    pub fn extend_past_batch(&mut self, extend: bool) {
        self.extend_past_batch = extend;
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// True once the source has reported the end of data.
    pub fn is_exhausted(&self) -> bool {
        self.termination.is_some_and(|t| t.is_exhausted())
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    pub fn items_fetched(&self) -> u64 {
        self.accumulated
    }

    fn stop(&mut self, termination: Termination) {
        if self.termination.is_none() {
            self.termination = Some(termination);
        }
    }

    fn stop_reason_before_fetch(&self) -> Option<Termination> {
        if self.cancel.is_some_and(|c| c.is_cancelled()) {
            return Some(Termination::Cancelled);
        }
        if self.pages == 0 {
            return None;
        }
        if let Some(limit) = self.batch_limit {
            if self.accumulated >= limit && !self.extend_past_batch {
                return Some(Termination::BatchFilled);
            }
        }
        if self.budget.is_some_and(|b| b.is_expired()) {
            return Some(Termination::BudgetExpired);
        }
        if self.pages >= self.ceiling {
            return Some(Termination::CeilingReached);
        }
        None
    }

    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        if self.termination.is_some() {
            return Ok(None);
        }
        if let Some(reason) = self.stop_reason_before_fetch() {
            if reason == Termination::CeilingReached {
                warn!(
                    grouping = %self.grouping,
                    pages = self.pages,
                    ceiling = self.ceiling,
                    "pagination ceiling reached; continuation chain may be malformed"
                );
            }
            self.stop(reason);
            return Ok(None);
        }

        let request = PageRequest {
            grouping: self.grouping.clone(),
            watermark: self.watermark,
            position: self.position.clone(),
            page_size: self.page_size,
        };

        let page = match self.retry.fetch_page(self.source, &request).await {
            Ok(page) => page,
            Err(FetchError::Throttled { retry_after }) => {
                warn!(grouping = %self.grouping, %retry_after, "source throttled; stopping pagination");
                self.stop(Termination::Throttled { retry_after });
                return Ok(None);
            }
            Err(err) => {
                self.stop(Termination::Failed);
                return Err(err);
            }
        };

        self.pages += 1;
        let returned = page.items.len() as u64;
        self.accumulated += returned;

        match self.style {
            PaginationStyle::Cursor => match &page.next_token {
                Some(token) => self.position = PagePosition::Token(token.clone()),
                None => self.stop(Termination::Exhausted),
            },
            PaginationStyle::Offset => {
                // A short page without an explicit end marker is read as the end of data.
                if returned == 0 || returned < u64::from(self.page_size) {
                    self.stop(Termination::Exhausted);
                } else {
                    let previous = match self.position {
                        PagePosition::Offset(offset) => offset,
                        _ => 0,
                    };
                    self.position = PagePosition::Offset(previous + returned);
                }
            }
        }

        debug!(
            grouping = %self.grouping,
            page = self.pages,
            returned,
            accumulated = self.accumulated,
            exhausted = self.is_exhausted(),
            "fetched page"
        );
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item_at, ts, ScriptedSource};
    use chrono::Duration;
    use wis_core::StreamKey;

    fn grouping() -> GroupingKey {
        StreamKey::new("acme", "tracker").grouping("board-1")
    }

    async fn drain(paginator: &mut Paginator<'_>) -> Result<Vec<Page>, FetchError> {
        let mut pages = Vec::new();
        while let Some(page) = paginator.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    #[tokio::test]
    async fn cursor_chain_stops_when_token_disappears() {
        let source = ScriptedSource::cursor(vec![
            Ok(ScriptedSource::page(vec![item_at("1", ts(1))], Some("t1"))),
            Ok(ScriptedSource::page(vec![item_at("2", ts(2))], None)),
        ]);
        let retry = RetryHandler::default();
        let mut paginator = Paginator::new(&source, &retry, grouping(), None, 10);
        let pages = drain(&mut paginator).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(paginator.termination(), Some(Termination::Exhausted));
        assert_eq!(
            source.positions(),
            vec![PagePosition::Start, PagePosition::Token("t1".into())]
        );
    }

    #[tokio::test]
    async fn endless_token_chain_stops_at_ceiling() {
        let source = ScriptedSource::endless_cursor();
        let retry = RetryHandler::default();
        let mut paginator =
            Paginator::new(&source, &retry, grouping(), None, 10).with_page_ceiling(20);
        let pages = drain(&mut paginator).await.unwrap();
        assert_eq!(pages.len(), 20);
        assert_eq!(paginator.termination(), Some(Termination::CeilingReached));
        assert_eq!(source.calls(), 20);
    }

    #[tokio::test]
    async fn offset_advances_by_items_returned_and_stops_on_short_page() {
        let full: Vec<_> = (0..3).map(|i| item_at(&i.to_string(), ts(1))).collect();
        let source = ScriptedSource::offset(vec![
            Ok(ScriptedSource::page(full.clone(), None)),
            Ok(ScriptedSource::page(full, None)),
            Ok(ScriptedSource::page(vec![item_at("9", ts(2))], None)),
        ]);
        let retry = RetryHandler::default();
        let mut paginator = Paginator::new(&source, &retry, grouping(), None, 3);
        let pages = drain(&mut paginator).await.unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(paginator.items_fetched(), 7);
        assert!(paginator.is_exhausted());
        assert_eq!(
            source.positions(),
            vec![PagePosition::Start, PagePosition::Offset(3), PagePosition::Offset(6)]
        );
    }

    #[tokio::test]
    async fn offset_stops_on_empty_page() {
        let full: Vec<_> = (0..2).map(|i| item_at(&i.to_string(), ts(1))).collect();
        let source = ScriptedSource::offset(vec![
            Ok(ScriptedSource::page(full, None)),
            Ok(ScriptedSource::page(Vec::new(), None)),
        ]);
        let retry = RetryHandler::default();
        let mut paginator = Paginator::new(&source, &retry, grouping(), None, 2);
        let pages = drain(&mut paginator).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert!(paginator.is_exhausted());
    }

    #[tokio::test]
    async fn batch_limit_stops_unless_extended() {
        let full = |prefix: &str| -> Vec<_> {
            (0..2).map(|i| item_at(&format!("{prefix}{i}"), ts(1))).collect()
        };
        let script = || {
            vec![
                Ok(ScriptedSource::page(full("a"), None)),
                Ok(ScriptedSource::page(full("b"), None)),
                Ok(ScriptedSource::page(Vec::new(), None)),
            ]
        };
        let retry = RetryHandler::default();

        let source = ScriptedSource::offset(script());
        let mut paginator =
            Paginator::new(&source, &retry, grouping(), None, 2).with_batch_limit(Some(2));
        assert_eq!(drain(&mut paginator).await.unwrap().len(), 1);
        assert_eq!(paginator.termination(), Some(Termination::BatchFilled));

        let source = ScriptedSource::offset(script());
        let mut paginator =
            Paginator::new(&source, &retry, grouping(), None, 2).with_batch_limit(Some(2));
        let mut pages = 0;
        while let Some(_page) = paginator.next_page().await.unwrap() {
            pages += 1;
            paginator.extend_past_batch(true);
        }
        assert_eq!(pages, 3);
        assert!(paginator.is_exhausted());
    }

    #[tokio::test]
    async fn expired_budget_allows_in_flight_page_only() {
        let source = ScriptedSource::endless_cursor();
        let retry = RetryHandler::default();
        let budget = TimeBudget::new(Utc::now(), Duration::zero());
        let mut paginator =
            Paginator::new(&source, &retry, grouping(), None, 10).with_budget(&budget);
        assert_eq!(drain(&mut paginator).await.unwrap().len(), 1);
        assert_eq!(paginator.termination(), Some(Termination::BudgetExpired));
    }

    #[tokio::test]
    async fn throttle_stops_gracefully_after_partial_results() {
        let retry_after = ts(30);
        let source = ScriptedSource::cursor(vec![
            Ok(ScriptedSource::page(vec![item_at("1", ts(1))], Some("t1"))),
            Err(FetchError::Throttled { retry_after }),
        ]);
        let retry = RetryHandler::default();
        let mut paginator = Paginator::new(&source, &retry, grouping(), None, 10);
        let pages = drain(&mut paginator).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(paginator.termination(), Some(Termination::Throttled { retry_after }));
    }

    #[tokio::test]
    async fn fatal_error_surfaces_and_ends_chain() {
        let source = ScriptedSource::cursor(vec![Err(FetchError::Fatal("401".into()))]);
        let retry = RetryHandler::default();
        let mut paginator = Paginator::new(&source, &retry, grouping(), None, 10);
        assert!(paginator.next_page().await.is_err());
        assert_eq!(paginator.termination(), Some(Termination::Failed));
        assert!(paginator.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_token_prevents_any_fetch() {
        let source = ScriptedSource::endless_cursor();
        let retry = RetryHandler::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut paginator =
            Paginator::new(&source, &retry, grouping(), None, 10).with_cancellation(&cancel);
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(paginator.termination(), Some(Termination::Cancelled));
        assert_eq!(source.calls(), 0);
    }
}
