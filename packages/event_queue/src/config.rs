use std::time::Duration;

/// Largest number of events a single queue may hold.
pub const MAX_CAPACITY: u16 = 32767;

const DEFAULT_CAPACITY: u16 = 256;
const DEFAULT_TIMEOUT_LOW_WATERMARK: u32 = 50;
const DEFAULT_NO_PROGRESS_CEILING: Duration = Duration::from_secs(60);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Tuning parameters shared by every queue that a registry creates.
///
/// Use [`EventQueueConfig::builder()`] to override the defaults.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventQueueConfig {
    capacity: u16,
    timeout_low_watermark: u32,
    no_progress_ceiling: Duration,
    max_backoff: Duration,
}

impl EventQueueConfig {
    /// Starts building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> EventQueueConfigBuilder {
        EventQueueConfigBuilder {
            config: Self::default(),
        }
    }

    /// Number of events in each queue.
    #[must_use]
    pub const fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Consecutive timeouts after which the watchdog starts warning.
    #[must_use]
    pub const fn timeout_low_watermark(&self) -> u32 {
        self.timeout_low_watermark
    }

    /// Consecutive timeouts after which the watchdog enforces the no-progress ceiling.
    #[must_use]
    pub const fn timeout_high_watermark(&self) -> u32 {
        self.timeout_low_watermark.saturating_mul(2)
    }

    /// How long a queue may go without any completion, once past the high watermark,
    /// before blocking calls fail immediately.
    #[must_use]
    pub const fn no_progress_ceiling(&self) -> Duration {
        self.no_progress_ceiling
    }

    /// Cap on the linearly growing wait between unproductive polls.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            timeout_low_watermark: DEFAULT_TIMEOUT_LOW_WATERMARK,
            no_progress_ceiling: DEFAULT_NO_PROGRESS_CEILING,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Builds an [`EventQueueConfig`].
///
/// ```
/// use std::time::Duration;
///
/// use event_queue::EventQueueConfig;
///
/// let config = EventQueueConfig::builder()
///     .capacity(64)
///     .no_progress_ceiling(Duration::from_secs(5))
///     .build();
///
/// assert_eq!(config.capacity(), 64);
/// assert_eq!(config.timeout_high_watermark(), 100);
/// ```
#[derive(Debug)]
#[must_use]
pub struct EventQueueConfigBuilder {
    config: EventQueueConfig,
}

impl EventQueueConfigBuilder {
    /// Sets the number of events in each queue. Default: 256.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is zero or greater than [`MAX_CAPACITY`].
    pub fn capacity(mut self, capacity: u16) -> Self {
        assert!(capacity > 0, "event queue capacity must be non-zero");
        assert!(
            capacity <= MAX_CAPACITY,
            "event queue capacity {capacity} exceeds the maximum of {MAX_CAPACITY}"
        );

        self.config.capacity = capacity;
        self
    }

    /// Sets the consecutive-timeout count past which the watchdog warns. The high watermark,
    /// past which the no-progress ceiling is enforced, is twice this value. Default: 50.
    ///
    /// # Panics
    ///
    /// Panics if the watermark is zero.
    pub fn timeout_low_watermark(mut self, watermark: u32) -> Self {
        assert!(watermark > 0, "timeout low watermark must be non-zero");

        self.config.timeout_low_watermark = watermark;
        self
    }

    /// Sets how long a queue past the high watermark may go without progress. Default: 60 s.
    pub fn no_progress_ceiling(mut self, ceiling: Duration) -> Self {
        self.config.no_progress_ceiling = ceiling;
        self
    }

    /// Sets the cap on the wait between unproductive polls. Default: 100 ms.
    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.config.max_backoff = max_backoff;
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> EventQueueConfig {
        self.config
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EventQueueConfig::default();

        assert_eq!(config.capacity(), 256);
        assert_eq!(config.timeout_low_watermark(), 50);
        assert_eq!(config.timeout_high_watermark(), 100);
        assert_eq!(config.no_progress_ceiling(), Duration::from_secs(60));
        assert_eq!(config.max_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn builder_overrides() {
        let config = EventQueueConfig::builder()
            .capacity(MAX_CAPACITY)
            .timeout_low_watermark(3)
            .no_progress_ceiling(Duration::from_millis(10))
            .max_backoff(Duration::from_millis(4))
            .build();

        assert_eq!(config.capacity(), MAX_CAPACITY);
        assert_eq!(config.timeout_high_watermark(), 6);
        assert_eq!(config.no_progress_ceiling(), Duration::from_millis(10));
        assert_eq!(config.max_backoff(), Duration::from_millis(4));
    }

    #[test]
    #[should_panic]
    fn zero_capacity_panics() {
        drop(EventQueueConfig::builder().capacity(0));
    }

    #[test]
    #[should_panic]
    fn oversized_capacity_panics() {
        drop(EventQueueConfig::builder().capacity(MAX_CAPACITY + 1));
    }
}
