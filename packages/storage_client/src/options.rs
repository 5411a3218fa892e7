/// The server group a pool connection goes to unless told otherwise.
pub const DEFAULT_SERVER_GROUP: &str = "daos_server";

/// The pool service ranks a pool connection goes to unless told otherwise.
pub const DEFAULT_RANKS: &str = "0";

/// How a pool is connected to.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum PoolFlags {
    /// Read and write access.
    #[default]
    ReadWrite,

    /// Read-only access.
    ReadOnly,

    /// Exclusive access.
    Execute,
}

/// How a container is opened.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ContainerFlags {
    /// Read and write access.
    #[default]
    ReadWrite,

    /// Read-only access.
    ReadOnly,

    /// Read and write access without waiting for a consistent snapshot.
    NoSlip,
}

/// Where and how to connect to a pool.
///
/// Only the first connection to a pool uses these; later acquisitions share the existing
/// connection whatever options they pass.
///
/// ```
/// use storage_client::{PoolFlags, PoolOptions};
///
/// let options = PoolOptions::builder()
///     .server_group("archive")
///     .ranks("0:1:2")
///     .flags(PoolFlags::ReadOnly)
///     .build();
///
/// assert_eq!(options.ranks(), "0:1:2");
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolOptions {
    server_group: String,
    ranks: String,
    flags: PoolFlags,
}

impl PoolOptions {
    /// Starts building options, with every option at its default.
    #[must_use]
    pub fn builder() -> PoolOptionsBuilder {
        PoolOptionsBuilder {
            options: Self::default(),
        }
    }

    /// The server group to connect to.
    #[must_use]
    pub fn server_group(&self) -> &str {
        &self.server_group
    }

    /// The pool service ranks, separated by `:`.
    #[must_use]
    pub fn ranks(&self) -> &str {
        &self.ranks
    }

    /// How to connect.
    #[must_use]
    pub fn flags(&self) -> PoolFlags {
        self.flags
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            server_group: DEFAULT_SERVER_GROUP.to_string(),
            ranks: DEFAULT_RANKS.to_string(),
            flags: PoolFlags::default(),
        }
    }
}

/// Builds [`PoolOptions`].
#[derive(Debug)]
#[must_use]
pub struct PoolOptionsBuilder {
    options: PoolOptions,
}

impl PoolOptionsBuilder {
    /// Sets the server group. Defaults to [`DEFAULT_SERVER_GROUP`].
    pub fn server_group(mut self, server_group: impl Into<String>) -> Self {
        self.options.server_group = server_group.into();
        self
    }

    /// Sets the pool service ranks as one or more rank numbers separated by `:`.
    /// Defaults to [`DEFAULT_RANKS`].
    pub fn ranks(mut self, ranks: impl Into<String>) -> Self {
        self.options.ranks = ranks.into();
        self
    }

    /// Sets how to connect. Defaults to [`PoolFlags::ReadWrite`].
    pub fn flags(mut self, flags: PoolFlags) -> Self {
        self.options.flags = flags;
        self
    }

    /// Validates and returns the options.
    ///
    /// # Panics
    ///
    /// Panics if the server group is empty or the ranks are not a `:`-separated list of
    /// rank numbers.
    #[must_use]
    pub fn build(self) -> PoolOptions {
        assert!(
            !self.options.server_group.is_empty(),
            "server group must not be empty"
        );
        assert!(
            self.options
                .ranks
                .split(':')
                .all(|rank| rank.parse::<u32>().is_ok()),
            "ranks must be rank numbers separated by ':', got '{}'",
            self.options.ranks
        );

        self.options
    }
}

/// How to mount a file system view.
///
/// ```
/// use storage_client::ClientOptions;
///
/// let options = ClientOptions::builder().read_only(true).shared(false).build();
///
/// assert!(options.read_only());
/// assert!(!options.shared());
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClientOptions {
    read_only: bool,
    shared: bool,
}

impl ClientOptions {
    /// Starts building options, with every option at its default.
    #[must_use]
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Whether the view is mounted read-only.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the view is shared with every other user of the same pool and container, as
    /// opposed to being a private mount owned by a single caller.
    #[must_use]
    pub fn shared(&self) -> bool {
        self.shared
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            shared: true,
        }
    }
}

/// Builds [`ClientOptions`].
#[derive(Debug)]
#[must_use]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Mounts the view read-only. Defaults to `false`.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    /// Shares the view through the client registry. Defaults to `true`.
    pub fn shared(mut self, shared: bool) -> Self {
        self.options.shared = shared;
        self
    }

    /// Returns the options.
    #[must_use]
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn pool_defaults() {
        let options = PoolOptions::default();

        assert_eq!(options.server_group(), "daos_server");
        assert_eq!(options.ranks(), "0");
        assert_eq!(options.flags(), PoolFlags::ReadWrite);
        assert_eq!(PoolOptions::builder().build(), options);
    }

    #[test]
    #[should_panic]
    fn malformed_ranks_panic() {
        let _options = PoolOptions::builder().ranks("0,1").build();
    }

    #[test]
    #[should_panic]
    fn empty_server_group_panics() {
        let _options = PoolOptions::builder().server_group("").build();
    }

    #[test]
    fn client_defaults() {
        let options = ClientOptions::default();

        assert!(!options.read_only());
        assert!(options.shared());
        assert_eq!(ContainerFlags::default(), ContainerFlags::ReadWrite);
    }
}
