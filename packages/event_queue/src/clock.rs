use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::ERR_POISONED_LOCK;

/// The time source and the only sleep point of the reactor.
///
/// Blocking operations measure their deadlines with [`now()`][Self::now] and wait between
/// unproductive polls with [`sleep()`][Self::sleep]. The system clock does what it says. A
/// [`ManualClock`] only moves when somebody sleeps on it or advances it explicitly, which makes
/// timeout behavior fully deterministic in tests.
#[derive(Clone, Debug, Default)]
pub struct Clock {
    inner: ClockInner,
}

#[derive(Clone, Debug, Default)]
enum ClockInner {
    #[default]
    System,

    Manual(ManualClock),
}

impl Clock {
    /// The real monotonic clock. Sleeping blocks the thread.
    #[must_use]
    pub fn system() -> Self {
        Self {
            inner: ClockInner::System,
        }
    }

    /// Creates a manually driven clock, returning the clock and the control handle for it.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use event_queue::Clock;
    ///
    /// let (clock, control) = Clock::manual();
    /// let start = clock.now();
    ///
    /// clock.sleep(Duration::from_millis(5));
    /// control.advance(Duration::from_millis(10));
    ///
    /// assert_eq!(clock.now() - start, Duration::from_millis(15));
    /// ```
    #[must_use]
    pub fn manual() -> (Self, ManualClock) {
        let control = ManualClock::new();
        (Self::from(control.clone()), control)
    }

    /// The current instant.
    #[must_use]
    pub fn now(&self) -> Instant {
        match &self.inner {
            ClockInner::System => Instant::now(),
            ClockInner::Manual(manual) => manual.now(),
        }
    }

    /// Waits for `duration` to pass.
    pub fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        match &self.inner {
            ClockInner::System => thread::sleep(duration),
            ClockInner::Manual(manual) => manual.advance(duration),
        }
    }
}

impl From<ManualClock> for Clock {
    fn from(manual: ManualClock) -> Self {
        Self {
            inner: ClockInner::Manual(manual),
        }
    }
}

/// Control handle for a manually driven [`Clock`].
///
/// Clones share the same timeline, so a test can keep one handle while the reactor owns another.
#[derive(Clone, Debug)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    now: Instant,
    slept: Duration,
}

impl ManualClock {
    /// Creates a manual timeline starting at the current real instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                slept: Duration::ZERO,
            })),
        }
    }

    /// The current instant on this timeline.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.state.lock().expect(ERR_POISONED_LOCK).now
    }

    /// Moves the timeline forward.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        state.now = state
            .now
            .checked_add(duration)
            .expect("manual clock advanced beyond the representable range");
        state.slept = state.slept.saturating_add(duration);
    }

    /// Total time this timeline has been advanced, whether by sleeping or explicitly.
    #[must_use]
    pub fn total_advanced(&self) -> Duration {
        self.state.lock().expect(ERR_POISONED_LOCK).slept
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}
