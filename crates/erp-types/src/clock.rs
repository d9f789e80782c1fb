//! Injected business clock.
//!
//! Every "business day" boundary (sale dates, AP due dates, settlement
//! transaction dates) comes from a single [`BusinessClock`] with a fixed UTC
//! offset instead of ad-hoc offset arithmetic at call sites.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};

use crate::error::TypeError;

/// Source of the current instant and the business-day offset.
pub trait BusinessClock: Send + Sync {
    /// Current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Offset that defines business-day boundaries.
    fn offset(&self) -> FixedOffset;

    /// Current instant in business-local time.
    fn now(&self) -> DateTime<FixedOffset> {
        self.now_utc().with_timezone(&self.offset())
    }

    /// Current business day.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time at a fixed offset.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Build from a whole-hour offset such as `8` for UTC+8.
    pub fn with_offset_hours(hours: i32) -> Result<Self, TypeError> {
        offset_from_hours(hours).map(Self::new)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl BusinessClock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// A clock frozen at one instant. Used by tests and replay tooling.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock {
    at: DateTime<Utc>,
    offset: FixedOffset,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self { at, offset }
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

impl BusinessClock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.at
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Convert whole hours east of UTC into a [`FixedOffset`].
pub fn offset_from_hours(hours: i32) -> Result<FixedOffset, TypeError> {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .ok_or(TypeError::InvalidOffset(hours))
}
