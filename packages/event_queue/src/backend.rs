use std::fmt::{self, Debug, Display};
use std::time::Duration;

use thiserror::Error;

use crate::EventId;

/// Identifies one completion queue inside the backend.
///
/// The value is opaque to this crate. It is handed out by [`EventBackend::create_queue()`]
/// and passed back to the backend on every call that concerns the queue.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QueueHandle(u64);

impl QueueHandle {
    /// Wraps a raw backend queue identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw backend queue identifier.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// The result code the backend reports for a completed operation.
///
/// The reactor only distinguishes success from failure. Interpreting a failure code is left to
/// the attachment that receives it in
/// [`Attachment::on_ready()`][crate::Attachment::on_ready].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ResultCode(i32);

impl ResultCode {
    /// The operation succeeded.
    pub const SUCCESS: Self = Self(0);

    /// The operation was canceled by an abort request before it could complete.
    pub const CANCELED: Self = Self(-125);

    /// Wraps a raw backend result code.
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw backend result code.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether the code denotes success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One completed operation as reported by [`EventBackend::poll()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Completion {
    /// The event the operation was submitted with.
    pub event: EventId,

    /// The backend's verdict on the operation.
    pub result: ResultCode,
}

impl Completion {
    /// Creates a completion record.
    #[must_use]
    pub const fn new(event: EventId, result: ResultCode) -> Self {
        Self { event, result }
    }
}

/// A backend call failed. The code is propagated as-is, without interpretation.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("backend call '{operation}' failed with code {code}")]
pub struct BackendError {
    operation: &'static str,
    code: i32,
}

impl BackendError {
    /// Creates an error describing a failed backend call.
    #[must_use]
    pub const fn new(operation: &'static str, code: i32) -> Self {
        Self { operation, code }
    }

    /// Name of the backend call that failed.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    /// The raw failure code reported by the backend.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }
}

/// The storage backend primitives that an [`EventQueue`][crate::EventQueue] is built upon.
///
/// A backend owns any number of completion queues. Operations are submitted against a queue
/// together with the identity of the event slot they occupy, and the backend later reports
/// that event as completed through [`poll()`][Self::poll].
///
/// Implementations must be thread-safe because queues for many threads share one backend,
/// although any single queue is only ever used from the thread that owns it.
#[cfg_attr(test, mockall::automock)]
pub trait EventBackend: Debug + Send + Sync + 'static {
    /// Creates a completion queue able to track `capacity` concurrent operations.
    fn create_queue(&self, capacity: u16) -> Result<QueueHandle, BackendError>;

    /// Destroys a completion queue. Operations still in flight are abandoned.
    fn destroy_queue(&self, queue: QueueHandle) -> Result<(), BackendError>;

    /// Submits an operation. The descriptor is an already-encoded request that only the
    /// backend understands.
    fn submit(
        &self,
        queue: QueueHandle,
        event: EventId,
        descriptor: &[u8],
    ) -> Result<(), BackendError>;

    /// Requests cancellation of the operation submitted with `event`.
    ///
    /// Returns `true` if an in-flight operation was found and will be reported as completed
    /// (typically with a cancellation result) by a later poll. Returns `false` if nothing was
    /// in flight, for example because the operation has already completed.
    fn abort(&self, queue: QueueHandle, event: EventId) -> Result<bool, BackendError>;

    /// Returns up to `max_completions` completions in the order the backend observed them,
    /// waiting up to `timeout` for at least one to become available.
    fn poll(
        &self,
        queue: QueueHandle,
        max_completions: usize,
        timeout: Duration,
    ) -> Result<Vec<Completion>, BackendError>;
}
