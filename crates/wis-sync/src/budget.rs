use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 30;

/// Wall-clock allowance for one run, minus a margin reserved for draining in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    started_at: DateTime<Utc>,
    allotted: Duration,
    safety_margin: Duration,
}

impl TimeBudget {
    pub fn new(started_at: DateTime<Utc>, allotted: Duration) -> Self {
        Self {
            started_at,
            allotted,
            safety_margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
        }
    }

    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.started_at >= self.allotted - self.safety_margin
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.allotted - self.safety_margin - (now - self.started_at)).max(Duration::zero())
    }
}
