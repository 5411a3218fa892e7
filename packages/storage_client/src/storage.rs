use std::fmt::{self, Debug, Display};

use thiserror::Error;
use uuid::Uuid;

use crate::{ContainerFlags, PoolOptions};

/// An opaque handle issued by a [`StorageBackend`] for an open pool, container or mount.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NativeHandle(u64);

impl NativeHandle {
    /// Wraps a raw backend handle.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw backend handle.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl Display for NativeHandle {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The kinds of resources a [`StorageBackend`] opens and closes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ResourceKind {
    /// A connection to a storage pool.
    Pool,

    /// An open container inside a pool.
    Container,

    /// A file system view mounted on a pool and, optionally, a container.
    Mount,
}

impl Display for ResourceKind {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pool => "pool",
            Self::Container => "container",
            Self::Mount => "mount",
        })
    }
}

/// A failure reported by a [`StorageBackend`], carrying the backend's own error code.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("storage operation '{operation}' failed with code {code}")]
pub struct StorageError {
    operation: &'static str,
    code: i32,
}

impl StorageError {
    /// The handle passed to the operation is not open.
    pub const NO_HANDLE: i32 = -1002;

    /// The resource cannot be closed because something is still open on top of it.
    pub const BUSY: i32 = -1012;

    /// The backend has already been finalized.
    pub const UNINITIALIZED: i32 = -1015;

    /// Creates an error for `operation` with the backend's error `code`.
    #[must_use]
    pub const fn new(operation: &'static str, code: i32) -> Self {
        Self { operation, code }
    }

    /// The operation that failed.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    /// The backend's error code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }
}

/// The storage library underneath a [`ClientContext`][crate::ClientContext].
///
/// Resources are opened on top of each other: containers inside a pool, mounts on a pool and
/// optionally a container. A backend may refuse to close a resource while something is still
/// open on top of it, so callers close from the top down.
///
/// Implementations must be thread-safe; every thread of the process uses the same backend.
#[cfg_attr(test, mockall::automock)]
pub trait StorageBackend: Debug + Send + Sync + 'static {
    /// Connects to the pool identified by `pool`.
    fn connect_pool(&self, pool: Uuid, options: &PoolOptions) -> Result<NativeHandle, StorageError>;

    /// Disconnects from a pool.
    fn disconnect_pool(&self, pool: NativeHandle) -> Result<(), StorageError>;

    /// Opens the container identified by `container` inside an open pool.
    fn open_container(
        &self,
        pool: NativeHandle,
        container: Uuid,
        flags: ContainerFlags,
    ) -> Result<NativeHandle, StorageError>;

    /// Closes a container.
    fn close_container(&self, container: NativeHandle) -> Result<(), StorageError>;

    /// Mounts a file system view on a pool, on `container` if given and on the pool's root
    /// container otherwise.
    fn mount(
        &self,
        pool: NativeHandle,
        container: Option<NativeHandle>,
        read_only: bool,
    ) -> Result<NativeHandle, StorageError>;

    /// Unmounts a file system view.
    fn unmount(&self, mount: NativeHandle) -> Result<(), StorageError>;

    /// Releases the process-wide resources of the storage library. Called once, last.
    fn finalize(&self) -> Result<(), StorageError>;
}
