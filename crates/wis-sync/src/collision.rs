use chrono::{DateTime, Duration, Utc};
use wis_core::{ExtractedItem, Page, WatermarkSemantics};

/// One tick of watermark precision.
pub const WATERMARK_TICK_MILLIS: i64 = 1;

/// Tracks change timestamps across one grouping's pages and guards the watermark
/// against ties cut off at a page boundary.
#[derive(Debug, Clone)]
pub struct CollisionWindow {
    watermark: Option<DateTime<Utc>>,
    semantics: WatermarkSemantics,
    last_seen: Option<DateTime<Utc>>,
    max_seen: Option<DateTime<Utc>>,
    boundary_open: bool,
    dropped: usize,
}

impl CollisionWindow {
    pub fn new(watermark: Option<DateTime<Utc>>, semantics: WatermarkSemantics) -> Self {
        Self {
            watermark,
            semantics,
            last_seen: None,
            max_seen: None,
            boundary_open: false,
            dropped: 0,
        }
    }

    /// Where a follow-up run would resume after a chain cut short at `last`.
    fn resume_point(&self, last: DateTime<Utc>) -> DateTime<Utc> {
        match self.semantics {
            WatermarkSemantics::Inclusive => last,
            WatermarkSemantics::Exclusive => last - Duration::milliseconds(WATERMARK_TICK_MILLIS),
        }
    }

    /// Keep the items inside the requested window and flag an open tie.
    ///
    /// The boundary is open when the page was cut short (not by the end of data) and
    /// its last item sits on the run's starting watermark: more items with that
    /// instant may follow, and resuming from it would refetch the same slice.
    pub fn filter_and_detect(&mut self, page: Page, truncated: bool) -> (Vec<ExtractedItem>, bool) {
        if let Some(last) = page.last_changed_at() {
            self.last_seen = Some(last);
            self.max_seen = self.max_seen.max(page.max_changed_at());
            self.boundary_open =
                truncated && self.watermark.is_some_and(|w| self.resume_point(last) <= w);
        } else if !truncated {
            self.boundary_open = false;
        }

        let before = page.items.len();
        let kept: Vec<ExtractedItem> = page
            .items
            .into_iter()
            .filter(|item| match (self.watermark, self.semantics) {
                (None, _) => true,
                (Some(w), WatermarkSemantics::Inclusive) => item.changed_at >= w,
                (Some(w), WatermarkSemantics::Exclusive) => item.changed_at > w,
            })
            .collect();
        self.dropped += before - kept.len();
        (kept, self.boundary_open)
    }

    pub fn boundary_open(&self) -> bool {
        self.boundary_open
    }

    /// Items the source returned outside the requested window.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn max_seen(&self) -> Option<DateTime<Utc>> {
        self.max_seen
    }

    /// Furthest watermark that cannot skip an unprocessed item.
    ///
    /// After natural exhaustion everything up to the newest observed change was seen.
    /// A truncated chain may stop mid-tie, so an inclusive source resumes at the last
    /// observed instant and an exclusive one a tick before it. An open tie never moves
    /// the watermark.
    pub fn safe_watermark(&self, exhausted: bool) -> Option<DateTime<Utc>> {
        let candidate = match (self.last_seen, self.max_seen) {
            (Some(_), _) if self.boundary_open => self.watermark,
            (_, Some(max)) if exhausted => Some(max),
            (Some(last), _) => Some(self.resume_point(last)),
            (None, _) => self.watermark,
        };
        candidate.max(self.watermark)
    }
}
