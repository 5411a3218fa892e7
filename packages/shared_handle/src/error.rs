use thiserror::Error;

/// Errors that can occur when acquiring or releasing shared handles.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation was attempted on a handle or registry in the wrong state.
    ///
    /// This signals a programming error rather than a transient failure; do not retry.
    #[error("invalid state: {problem}")]
    InvalidState {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The backend failed to open or close a resource.
    #[error("failed to {operation} {kind} {identity}")]
    Backend {
        /// The kind of resource, as reported by its connector.
        kind: &'static str,

        /// `"open"` or `"close"`.
        operation: &'static str,

        /// Debug representation of the resource identity.
        identity: String,

        /// The connector's own error, unmodified.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    pub(crate) fn invalid_state(problem: impl Into<String>) -> Self {
        Self::InvalidState {
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for shared handle operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as _;
    use std::io;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, std::fmt::Debug);

    #[test]
    fn backend_error_keeps_source() {
        let error = Error::Backend {
            kind: "pool",
            operation: "open",
            identity: "7".to_string(),
            source: Box::new(io::Error::other("no such pool")),
        };

        assert_eq!(error.to_string(), "failed to open pool 7");
        assert_eq!(error.source().unwrap().to_string(), "no such pool");
    }
}
