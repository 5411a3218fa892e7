use std::fmt::{self, Display};
use std::time::Duration;

use thiserror::Error;

use crate::BackendError;

/// Errors that can occur when operating an event queue.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A blocking operation ran out of time, either because the caller's own deadline passed
    /// or because the progress watchdog decided that the reactor is stuck.
    ///
    /// This is recoverable: the caller may retry, abort pending work or escalate.
    #[error(
        "timed out ({cause}) after {elapsed:?} with {outstanding} of {capacity} events outstanding and {consecutive_timeouts} consecutive timeouts"
    )]
    TimedOut {
        /// What triggered the timeout.
        cause: TimeoutCause,

        /// How long the failing call waited (for [`TimeoutCause::NoProgress`], how long the
        /// queue has gone without progress).
        elapsed: Duration,

        /// Events still in use when the timeout was raised.
        outstanding: usize,

        /// Total number of events in the queue.
        capacity: usize,

        /// Timeouts in a row without an intervening completion, including this one.
        consecutive_timeouts: u32,
    },

    /// An operation was attempted on an event, queue or handle in the wrong state.
    ///
    /// This signals a programming error rather than a transient failure; do not retry.
    #[error("invalid state: {problem}")]
    InvalidState {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The backend reported a failure, propagated without interpretation.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Why an [`Error::TimedOut`] was raised.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimeoutCause {
    /// The caller's own maximum wait elapsed.
    Deadline,

    /// The watchdog's no-progress ceiling was exceeded before the caller's deadline.
    NoProgress,
}

impl Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deadline => write!(f, "deadline"),
            Self::NoProgress => write!(f, "no progress"),
        }
    }
}

impl Error {
    pub(crate) fn invalid_state(problem: impl Into<String>) -> Self {
        Self::InvalidState {
            problem: problem.into(),
        }
    }

    /// Whether this is a timeout of any cause.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// A specialized `Result` type for event queue operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, std::fmt::Debug);

    #[test]
    fn timeout_message_carries_diagnostics() {
        let error = Error::TimedOut {
            cause: TimeoutCause::NoProgress,
            elapsed: Duration::from_secs(2),
            outstanding: 4,
            capacity: 4,
            consecutive_timeouts: 101,
        };

        let message = error.to_string();

        assert!(message.contains("no progress"));
        assert!(message.contains("4 of 4 events"));
        assert!(message.contains("101 consecutive"));
        assert!(error.is_timeout());
    }

    #[test]
    fn backend_error_converts() {
        let error: Error = BackendError::new("abort", -1).into();

        assert!(matches!(error, Error::Backend(e) if e.code() == -1));
    }
}
