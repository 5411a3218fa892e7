use std::fmt;
use std::sync::Arc;

use crate::registry::HandleCell;
use crate::{Connector, ERR_POISONED_LOCK, Error, HandleRegistry, Result};

/// One reference to an open resource, issued by a [`HandleRegistry`].
///
/// Dropping the token releases the reference and closes the resource if it was the last one;
/// any close failure is logged. Use [`close()`][Self::close] to observe the failure instead.
///
/// A token outlives a [forced shutdown][HandleRegistry::force_close_all] of its registry
/// harmlessly: it reports the resource as no longer open and releasing it does nothing.
pub struct SharedHandle<C>
where
    C: Connector,
{
    registry: HandleRegistry<C>,
    cell: Arc<HandleCell<C>>,
    generation: u64,
    native: C::Native,
    released: bool,
}

impl<C> SharedHandle<C>
where
    C: Connector,
{
    pub(crate) fn new(
        registry: HandleRegistry<C>,
        cell: Arc<HandleCell<C>>,
        generation: u64,
        native: C::Native,
    ) -> Self {
        Self {
            registry,
            cell,
            generation,
            native,
            released: false,
        }
    }

    /// The identity of the resource.
    #[must_use]
    pub fn identity(&self) -> &C::Identity {
        &self.cell.identity
    }

    /// The opened resource, as returned by [`Connector::open()`].
    ///
    /// After a forced shutdown this is a stale copy; check [`is_open()`][Self::is_open] if
    /// that matters.
    #[must_use]
    pub fn native(&self) -> &C::Native {
        &self.native
    }

    /// Whether the resource this token refers to is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let state = self.cell.state.lock().expect(ERR_POISONED_LOCK);
        state.generation == self.generation && state.native.is_some()
    }

    /// Whether the resource is shared through the registry, as opposed to opened with
    /// [`HandleRegistry::open_unshared()`].
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.cell.is_shared()
    }

    /// Number of references currently held to the resource, including this one.
    ///
    /// Zero if the resource has been force-closed.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        let state = self.cell.state.lock().expect(ERR_POISONED_LOCK);

        if state.generation == self.generation {
            state.ref_count
        } else {
            0
        }
    }

    /// A non-counting link to this resource, for children that are opened on top of it.
    #[must_use]
    pub fn link(&self) -> ParentLink<C> {
        ParentLink {
            cell: Arc::clone(&self.cell),
            generation: self.generation,
        }
    }

    /// Releases this reference, closing the resource if it was the last one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if closing the resource fails. The reference is released
    /// regardless.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        self.released = true;
        self.registry.release(&self.cell, self.generation)
    }
}

impl<C> Drop for SharedHandle<C>
where
    C: Connector,
{
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::error!(
                kind = self.registry.kind(),
                identity = ?self.cell.identity,
                %error,
                "failed to close dropped handle"
            );
        }
    }
}

impl<C> fmt::Debug for SharedHandle<C>
where
    C: Connector,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(std::any::type_name::<Self>())
            .field("identity", &self.cell.identity)
            .field("generation", &self.generation)
            .field("native", &self.native)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// Refers to a parent resource without holding a reference to it.
///
/// A child resource (say, a container inside a pool) is opened on top of its parent's native
/// handle. The child keeps a link to the parent for its whole life, but whoever acquired the
/// child is responsible for holding the parent too. The link only lets the child find out
/// whether the parent is still open.
pub struct ParentLink<C>
where
    C: Connector,
{
    cell: Arc<HandleCell<C>>,
    generation: u64,
}

impl<C> ParentLink<C>
where
    C: Connector,
{
    /// The identity of the parent resource.
    #[must_use]
    pub fn identity(&self) -> &C::Identity {
        &self.cell.identity
    }

    /// The parent's native handle, if the parent is still open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the parent has been closed since the link was made.
    pub fn native(&self) -> Result<C::Native> {
        let state = self.cell.state.lock().expect(ERR_POISONED_LOCK);

        match &state.native {
            Some(native) if state.generation == self.generation => Ok(native.clone()),
            _ => Err(Error::invalid_state(format!(
                "parent {:?} has been closed",
                self.cell.identity
            ))),
        }
    }

    /// Whether the parent is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.native().is_ok()
    }
}

impl<C> Clone for ParentLink<C>
where
    C: Connector,
{
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            generation: self.generation,
        }
    }
}

impl<C> fmt::Debug for ParentLink<C>
where
    C: Connector,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(std::any::type_name::<Self>())
            .field("identity", &self.cell.identity)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::convert::Infallible;

    use static_assertions::assert_impl_all;

    use super::*;

    #[derive(Debug)]
    struct Plain;

    impl Connector for Plain {
        type Identity = &'static str;
        type Params = ();
        type Native = usize;
        type Error = Infallible;

        fn kind(&self) -> &'static str {
            "plain"
        }

        fn open(
            &self,
            identity: &&'static str,
            _params: &(),
        ) -> std::result::Result<usize, Infallible> {
            Ok(identity.len())
        }

        fn close(
            &self,
            _identity: &&'static str,
            _native: usize,
        ) -> std::result::Result<(), Infallible> {
            Ok(())
        }
    }

    assert_impl_all!(SharedHandle<Plain>: Send, Sync);
    assert_impl_all!(ParentLink<Plain>: Send, Sync, Clone);

    #[test]
    fn token_reports_identity_and_native() {
        let registry = HandleRegistry::new(Plain);
        let handle = registry.get_instance("pool", &()).unwrap();

        assert_eq!(*handle.identity(), "pool");
        assert_eq!(*handle.native(), 4);
        assert!(handle.is_open());
        assert!(handle.is_shared());
    }

    #[test]
    fn drop_releases_reference() {
        let registry = HandleRegistry::new(Plain);
        let first = registry.get_instance("pool", &()).unwrap();
        let second = registry.get_instance("pool", &()).unwrap();

        drop(first);

        assert_eq!(second.ref_count(), 1);
    }

    #[test]
    fn link_tracks_parent_lifetime_without_counting() {
        let registry = HandleRegistry::new(Plain);
        let parent = registry.get_instance("pool", &()).unwrap();

        let link = parent.link();
        assert_eq!(parent.ref_count(), 1);
        assert_eq!(link.native().unwrap(), 4);
        assert_eq!(*link.identity(), "pool");

        parent.close().unwrap();

        assert!(!link.is_open());
        assert!(matches!(link.native(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn link_does_not_follow_reopened_parent() {
        let registry = HandleRegistry::new(Plain);
        let link = registry.get_instance("pool", &()).unwrap().link();

        let _reopened = registry.get_instance("pool", &()).unwrap();

        assert!(!link.is_open());
    }

    #[test]
    fn stale_token_after_force_close() {
        let registry = HandleRegistry::new(Plain);
        let handle = registry.get_instance("pool", &()).unwrap();

        registry.force_close_all();

        assert!(!handle.is_open());
        assert_eq!(handle.ref_count(), 0);
        handle.close().unwrap();
    }
}
