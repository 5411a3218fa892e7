use std::fmt::Debug;
use std::hash::Hash;

/// Opens and closes one kind of backend resource on behalf of a
/// [`HandleRegistry`][crate::HandleRegistry].
///
/// The registry guarantees that, per identity, [`open()`][Self::open] runs at most once until
/// the matching [`close()`][Self::close], no matter how many threads acquire the identity
/// concurrently.
pub trait Connector: Send + Sync + 'static {
    /// What distinguishes one resource of this kind from another.
    type Identity: Clone + Debug + Eq + Hash + Send + Sync + 'static;

    /// Extra information needed to open a resource, used only by the first acquisition.
    type Params;

    /// The opened resource. Cloning must be cheap; every handle token carries a copy.
    type Native: Clone + Debug + Send + Sync + 'static;

    /// What the backend reports when an open or close fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short name of the resource kind, for diagnostics.
    fn kind(&self) -> &'static str;

    /// Opens the resource identified by `identity`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the resource cannot be opened.
    fn open(
        &self,
        identity: &Self::Identity,
        params: &Self::Params,
    ) -> Result<Self::Native, Self::Error>;

    /// Closes a resource previously returned by [`open()`][Self::open].
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the resource cannot be closed. The resource is
    /// considered gone regardless.
    fn close(&self, identity: &Self::Identity, native: Self::Native) -> Result<(), Self::Error>;
}
