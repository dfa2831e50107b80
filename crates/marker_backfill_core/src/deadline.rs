use std::time::{Duration, Instant};

pub const DEFAULT_DEADLINE_MARGIN: Duration = Duration::from_millis(5_000);

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Instant after which no new page fetch may begin.
///
/// The deadline is advisory at page granularity: it is consulted between
/// pages, never while a scan or write is in flight, so a run can overrun it by
/// one page's scan+write latency. [`Deadline::from_remaining`] subtracts a
/// safety margin to keep that overrun inside the external hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Unbounded,
    At(Instant),
}

impl Deadline {
    pub fn from_remaining(now: Instant, remaining: Duration, margin: Duration) -> Self {
        Self::At(now + remaining.saturating_sub(margin))
    }

    pub fn has_passed(&self, now: Instant) -> bool {
        match self {
            Self::Unbounded => false,
            Self::At(instant) => now >= *instant,
        }
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Self::Unbounded => None,
            Self::At(instant) => Some(instant.saturating_duration_since(now)),
        }
    }
}
