use std::time::{Duration, Instant};

use crate::{Error, Result, TimeoutCause};

/// Converts sustained lack of progress into a bounded failure.
///
/// Every blocking timeout is counted. Any completion resets the count. Past the low watermark
/// the watchdog warns on each check; past the high watermark it also compares the time since
/// the last completion with the no-progress ceiling and fails the check once that is exceeded,
/// so a wedged backend or starved thread cannot make callers wait forever.
#[derive(Debug)]
pub(crate) struct Watchdog {
    low_watermark: u32,
    high_watermark: u32,
    no_progress_ceiling: Duration,

    consecutive_timeouts: u32,
    last_progress: Instant,
}

impl Watchdog {
    pub(crate) fn new(
        low_watermark: u32,
        high_watermark: u32,
        no_progress_ceiling: Duration,
        now: Instant,
    ) -> Self {
        Self {
            low_watermark,
            high_watermark,
            no_progress_ceiling,
            consecutive_timeouts: 0,
            last_progress: now,
        }
    }

    pub(crate) fn record_progress(&mut self, now: Instant) {
        self.consecutive_timeouts = 0;
        self.last_progress = now;
    }

    /// Counts one more timeout and returns the new count.
    pub(crate) fn record_timeout(&mut self) -> u32 {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        self.consecutive_timeouts
    }

    pub(crate) fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub(crate) fn check(&self, now: Instant, outstanding: usize, capacity: usize) -> Result<()> {
        if self.consecutive_timeouts <= self.low_watermark {
            return Ok(());
        }

        let since_progress = now.saturating_duration_since(self.last_progress);

        tracing::warn!(
            consecutive_timeouts = self.consecutive_timeouts,
            ?since_progress,
            outstanding,
            capacity,
            "event queue keeps timing out without completing anything"
        );

        if self.consecutive_timeouts >= self.high_watermark
            && since_progress > self.no_progress_ceiling
        {
            return Err(Error::TimedOut {
                cause: TimeoutCause::NoProgress,
                elapsed: since_progress,
                outstanding,
                capacity,
                consecutive_timeouts: self.consecutive_timeouts,
            });
        }

        Ok(())
    }
}
