use thiserror::Error;

use crate::StorageError;

/// Errors that can occur when using a [`ClientContext`][crate::ClientContext].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The context was built without something it cannot work without.
    #[error("invalid configuration: {problem}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// An event queue operation failed.
    #[error(transparent)]
    EventQueue(#[from] event_queue::Error),

    /// Acquiring or releasing a shared handle failed.
    #[error(transparent)]
    Handle(#[from] shared_handle::Error),

    /// The storage backend reported a failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    /// The storage backend's error, if this error originates from one, however deeply it
    /// is wrapped.
    #[must_use]
    pub fn storage_error(&self) -> Option<StorageError> {
        match self {
            Self::Storage(error) => Some(*error),
            Self::Handle(shared_handle::Error::Backend { source, .. }) => source
                .downcast_ref::<Self>()
                .and_then(Self::storage_error)
                .or_else(|| source.downcast_ref::<StorageError>().copied()),
            _ => None,
        }
    }
}

/// A specialized `Result` type for storage client operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
