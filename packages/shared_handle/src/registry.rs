use std::fmt;
use std::sync::atomic::{self, AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard};

use foldhash::{HashMap, HashMapExt};

use crate::{Connector, ERR_POISONED_LOCK, Error, Result, SharedHandle};

/// Keeps at most one open resource per identity and counts the references to it.
///
/// The first [`get_instance()`][Self::get_instance] for an identity opens the resource and
/// every further one shares it. Each acquisition returns a [`SharedHandle`] token; the resource
/// is closed when the last token is released and the identity is forgotten, so a later
/// acquisition opens it anew.
///
/// The registry is thread-safe and cheap to clone; clones share the same set of handles.
///
/// ```
/// use std::convert::Infallible;
///
/// use shared_handle::{Connector, HandleRegistry};
///
/// #[derive(Debug)]
/// struct Files;
///
/// impl Connector for Files {
///     type Identity = String;
///     type Params = ();
///     type Native = u32;
///     type Error = Infallible;
///
///     fn kind(&self) -> &'static str {
///         "file"
///     }
///
///     fn open(&self, identity: &String, _params: &()) -> Result<u32, Infallible> {
///         Ok(identity.len() as u32)
///     }
///
///     fn close(&self, _identity: &String, _native: u32) -> Result<(), Infallible> {
///         Ok(())
///     }
/// }
///
/// let registry = HandleRegistry::new(Files);
///
/// let first = registry.get_instance("a.txt".to_string(), &()).unwrap();
/// let second = registry.get_instance("a.txt".to_string(), &()).unwrap();
/// assert_eq!(first.ref_count(), 2);
///
/// first.close().unwrap();
/// assert_eq!(second.ref_count(), 1);
///
/// second.close().unwrap();
/// assert!(registry.is_empty());
/// ```
///
/// # Locking
///
/// Each identity has its own lock, held across the open or close call for that identity and
/// across the reference count update that goes with it. The map of identities has a separate
/// lock that is never held while waiting for a per-identity lock.
pub struct HandleRegistry<C>
where
    C: Connector,
{
    inner: Arc<RegistryInner<C>>,
}

struct RegistryInner<C>
where
    C: Connector,
{
    connector: C,
    handles: Mutex<HashMap<C::Identity, Arc<HandleCell<C>>>>,
    next_sequence: AtomicU64,
    closed: AtomicBool,
}

/// Everything the registry knows about one identity.
pub(crate) struct HandleCell<C>
where
    C: Connector,
{
    pub(crate) identity: C::Identity,

    /// Creation order, used to force-close newest first.
    sequence: u64,

    shared: bool,

    pub(crate) state: Mutex<HandleState<C::Native>>,
}

#[derive(Debug)]
pub(crate) struct HandleState<N> {
    /// `Some` while the resource is open.
    pub(crate) native: Option<N>,

    pub(crate) ref_count: usize,

    /// Changes every time the resource is torn down. Tokens remember the generation they were
    /// issued for and do nothing when released against a different one.
    pub(crate) generation: u64,

    /// Set when the cell has been removed from the registry for good. Acquirers that were
    /// waiting on the cell must start over with a fresh one.
    retired: bool,
}

impl<C> HandleRegistry<C>
where
    C: Connector,
{
    /// Creates an empty registry that opens and closes resources through `connector`.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                handles: Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The connector that opens and closes the resources.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Acquires a reference to the resource identified by `identity`, opening it first if
    /// nobody holds a reference to it yet.
    ///
    /// `params` are only used if the resource needs to be opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if opening the resource fails. Nothing is registered in that
    /// case and the next acquisition tries to open it again.
    ///
    /// Returns [`Error::InvalidState`] if the registry has been shut down.
    pub fn get_instance(
        &self,
        identity: C::Identity,
        params: &C::Params,
    ) -> Result<SharedHandle<C>> {
        loop {
            let cell = {
                let mut handles = self.lock_handles();

                // Checked under the map lock, which `force_close_all` also holds while closing
                // the registry, so no cell can be added after the map has been drained.
                self.ensure_open()?;

                Arc::clone(handles.entry(identity.clone()).or_insert_with(|| {
                    Arc::new(HandleCell::new(identity.clone(), self.next_sequence(), true))
                }))
            };

            let mut state = cell.state.lock().expect(ERR_POISONED_LOCK);

            if state.retired {
                // The last reference was released (or the open failed) between us finding the
                // cell and locking it. The cell is gone from the map by now; try again.
                continue;
            }

            if state.native.is_none() {
                match self.inner.connector.open(&identity, params) {
                    Ok(native) => {
                        tracing::debug!(kind = self.kind(), ?identity, "opened shared handle");
                        state.native = Some(native);
                    }
                    Err(source) => {
                        state.retired = true;
                        self.forget(&cell);
                        return Err(self.backend_error("open", &identity, source));
                    }
                }
            }

            state.ref_count = state
                .ref_count
                .checked_add(1)
                .expect("reference count overflow is not possible with real-world memory sizes");

            let generation = state.generation;
            let native = state
                .native
                .clone()
                .expect("we just ensured the resource is open");

            drop(state);

            return Ok(SharedHandle::new(self.clone(), cell, generation, native));
        }
    }

    /// Opens a private instance of the resource that is not shared with anyone.
    ///
    /// The instance is not entered in the registry. It is closed when its token is released
    /// and is not affected by [`force_close_all()`][Self::force_close_all].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if opening the resource fails.
    ///
    /// Returns [`Error::InvalidState`] if the registry has been shut down.
    pub fn open_unshared(
        &self,
        identity: C::Identity,
        params: &C::Params,
    ) -> Result<SharedHandle<C>> {
        self.ensure_open()?;

        let native = self
            .inner
            .connector
            .open(&identity, params)
            .map_err(|source| self.backend_error("open", &identity, source))?;

        tracing::debug!(kind = self.kind(), ?identity, "opened unshared handle");

        let cell = Arc::new(HandleCell::new(identity, self.next_sequence(), false));

        {
            let mut state = cell.state.lock().expect(ERR_POISONED_LOCK);
            state.native = Some(native.clone());
            state.ref_count = 1;
        }

        Ok(SharedHandle::new(self.clone(), cell, 0, native))
    }

    /// Number of identities with an open resource.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_handles().len()
    }

    /// Whether no identity has an open resource.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the resource identified by `identity` is currently open.
    #[must_use]
    pub fn contains(&self, identity: &C::Identity) -> bool {
        self.lock_handles().contains_key(identity)
    }

    /// Number of references held to the resource identified by `identity`, zero if it is
    /// not open.
    #[must_use]
    pub fn ref_count(&self, identity: &C::Identity) -> usize {
        let Some(cell) = self.lock_handles().get(identity).cloned() else {
            return 0;
        };

        cell.state.lock().expect(ERR_POISONED_LOCK).ref_count
    }

    /// Whether [`force_close_all()`][Self::force_close_all] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(atomic::Ordering::Acquire)
    }

    /// Closes every open resource regardless of outstanding references, newest first, and
    /// rejects further acquisitions.
    ///
    /// Meant for process shutdown, when some owners may never release their references.
    /// Tokens still held afterwards release nothing. Close failures are logged, not returned.
    ///
    /// Returns the number of resources closed.
    pub fn force_close_all(&self) -> usize {
        let mut cells: Vec<_> = {
            let mut handles = self.lock_handles();
            self.inner.closed.store(true, atomic::Ordering::Release);
            handles.drain().map(|(_, cell)| cell).collect()
        };
        cells.sort_unstable_by_key(|cell| std::cmp::Reverse(cell.sequence));

        let mut closed: usize = 0;

        for cell in cells {
            let mut state = cell.state.lock().expect(ERR_POISONED_LOCK);

            if state.retired {
                continue;
            }

            if state.ref_count > 0 {
                tracing::warn!(
                    kind = self.kind(),
                    identity = ?cell.identity,
                    ref_count = state.ref_count,
                    "force closing handle that is still referenced"
                );
            }

            let native = tear_down(&mut state);

            if let Some(native) = native {
                if let Err(error) = self.inner.connector.close(&cell.identity, native) {
                    tracing::error!(
                        kind = self.kind(),
                        identity = ?cell.identity,
                        %error,
                        "failed to close handle during shutdown"
                    );
                }

                closed = closed.saturating_add(1);
            }
        }

        closed
    }

    /// Gives back one reference issued for `generation`, closing the resource if it was the
    /// last one.
    pub(crate) fn release(&self, cell: &Arc<HandleCell<C>>, generation: u64) -> Result<()> {
        let mut state = cell.state.lock().expect(ERR_POISONED_LOCK);

        if state.retired || state.generation != generation {
            // Force-closed while we held the token. Nothing left to release.
            return Ok(());
        }

        state.ref_count = state.ref_count.saturating_sub(1);

        if state.ref_count > 0 {
            return Ok(());
        }

        let native = tear_down(&mut state);

        if cell.shared {
            self.forget(cell);
        }

        let Some(native) = native else {
            return Ok(());
        };

        self.inner
            .connector
            .close(&cell.identity, native)
            .map_err(|source| self.backend_error("close", &cell.identity, source))?;

        tracing::debug!(kind = self.kind(), identity = ?cell.identity, "closed shared handle");

        Ok(())
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.inner.connector.kind()
    }

    /// Removes the cell from the map if it is still the one registered for its identity.
    ///
    /// Called with the cell's own lock held; the map lock is always taken second.
    fn forget(&self, cell: &Arc<HandleCell<C>>) {
        let mut handles = self.lock_handles();

        if handles
            .get(&cell.identity)
            .is_some_and(|registered| Arc::ptr_eq(registered, cell))
        {
            handles.remove(&cell.identity);
        }
    }

    fn backend_error(
        &self,
        operation: &'static str,
        identity: &C::Identity,
        source: C::Error,
    ) -> Error {
        Error::Backend {
            kind: self.kind(),
            operation,
            identity: format!("{identity:?}"),
            source: Box::new(source),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::invalid_state(format!(
                "the {} registry has been shut down",
                self.kind()
            )));
        }

        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.inner
            .next_sequence
            .fetch_add(1, atomic::Ordering::Relaxed)
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<C::Identity, Arc<HandleCell<C>>>> {
        self.inner.handles.lock().expect(ERR_POISONED_LOCK)
    }
}

fn tear_down<N>(state: &mut HandleState<N>) -> Option<N> {
    state.ref_count = 0;
    state.retired = true;
    state.generation = state.generation.wrapping_add(1);
    state.native.take()
}

impl<C> HandleCell<C>
where
    C: Connector,
{
    fn new(identity: C::Identity, sequence: u64, shared: bool) -> Self {
        Self {
            identity,
            sequence,
            shared,
            state: Mutex::new(HandleState {
                native: None,
                ref_count: 0,
                generation: 0,
                retired: false,
            }),
        }
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.shared
    }
}

impl<C> Clone for HandleRegistry<C>
where
    C: Connector,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for HandleRegistry<C>
where
    C: Connector,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(std::any::type_name::<Self>())
            .field("kind", &self.kind())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<C> fmt::Debug for HandleCell<C>
where
    C: Connector,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCell")
            .field("identity", &self.identity)
            .field("sequence", &self.sequence)
            .field("shared", &self.shared)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::{io, mem};

    use static_assertions::assert_impl_all;

    use super::*;

    /// Counts calls and can be told to fail opens of particular identities.
    #[derive(Debug, Default)]
    struct CountingConnector {
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail_open: Mutex<Vec<u32>>,
        fail_close: AtomicBool,
    }

    impl Connector for CountingConnector {
        type Identity = u32;
        type Params = &'static str;
        type Native = String;
        type Error = io::Error;

        fn kind(&self) -> &'static str {
            "widget"
        }

        fn open(&self, identity: &u32, params: &&'static str) -> io::Result<String> {
            if self.fail_open.lock().unwrap().contains(identity) {
                return Err(io::Error::other("refused"));
            }

            let serial = self.opens.fetch_add(1, atomic::Ordering::SeqCst);
            Ok(format!("{params}-{identity}-{serial}"))
        }

        fn close(&self, _identity: &u32, _native: String) -> io::Result<()> {
            self.closes.fetch_add(1, atomic::Ordering::SeqCst);

            if self.fail_close.load(atomic::Ordering::SeqCst) {
                return Err(io::Error::other("stuck"));
            }

            Ok(())
        }
    }

    type Registry = HandleRegistry<CountingConnector>;

    assert_impl_all!(Registry: Send, Sync, Clone);

    fn opens(registry: &Registry) -> usize {
        registry.connector().opens.load(atomic::Ordering::SeqCst)
    }

    fn closes(registry: &Registry) -> usize {
        registry.connector().closes.load(atomic::Ordering::SeqCst)
    }

    #[test]
    fn first_acquire_opens_and_last_release_closes() {
        let registry = Registry::new(CountingConnector::default());

        let a = registry.get_instance(1, &"p").unwrap();
        let b = registry.get_instance(1, &"ignored").unwrap();

        assert_eq!(opens(&registry), 1);
        assert_eq!(a.native(), "p-1-0");
        assert_eq!(b.native(), "p-1-0");
        assert_eq!(registry.ref_count(&1), 2);

        a.close().unwrap();
        assert_eq!(closes(&registry), 0);
        assert!(registry.contains(&1));

        b.close().unwrap();
        assert_eq!(closes(&registry), 1);
        assert!(!registry.contains(&1));
        assert_eq!(registry.ref_count(&1), 0);
    }

    #[test]
    fn reacquire_after_close_opens_again() {
        let registry = Registry::new(CountingConnector::default());

        registry.get_instance(1, &"p").unwrap().close().unwrap();
        let again = registry.get_instance(1, &"p").unwrap();

        assert_eq!(opens(&registry), 2);
        assert_eq!(again.native(), "p-1-1");
    }

    #[test]
    fn identities_are_independent() {
        let registry = Registry::new(CountingConnector::default());

        let one = registry.get_instance(1, &"p").unwrap();
        let two = registry.get_instance(2, &"p").unwrap();

        assert_eq!(registry.len(), 2);
        drop(one);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&2));
        drop(two);
        assert!(registry.is_empty());
        assert_eq!(closes(&registry), 2);
    }

    #[test]
    fn failed_open_registers_nothing_and_can_be_retried() {
        let registry = Registry::new(CountingConnector::default());
        registry.connector().fail_open.lock().unwrap().push(1);

        let error = registry.get_instance(1, &"p").unwrap_err();

        assert!(matches!(
            error,
            Error::Backend {
                kind: "widget",
                operation: "open",
                ..
            }
        ));
        assert!(registry.is_empty());

        registry.connector().fail_open.lock().unwrap().clear();
        let handle = registry.get_instance(1, &"p").unwrap();
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn failed_close_is_reported_and_identity_is_forgotten() {
        let registry = Registry::new(CountingConnector::default());
        let handle = registry.get_instance(1, &"p").unwrap();
        registry
            .connector()
            .fail_close
            .store(true, atomic::Ordering::SeqCst);

        assert!(matches!(
            handle.close(),
            Err(Error::Backend {
                operation: "close",
                ..
            })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_first_acquisition_opens_exactly_once() {
        testing::with_watchdog(|| {
            const THREADS: usize = 8;

            let registry = Registry::new(CountingConnector::default());
            let barrier = Arc::new(Barrier::new(THREADS));

            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let registry = registry.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        registry.get_instance(42, &"p").unwrap()
                    })
                })
                .collect();

            let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

            assert_eq!(opens(&registry), 1);
            assert_eq!(registry.ref_count(&42), THREADS);

            let mut remaining = THREADS;
            for handle in handles {
                handle.close().unwrap();
                remaining -= 1;

                let expected_closes = usize::from(remaining == 0);
                assert_eq!(closes(&registry), expected_closes);
            }
        });
    }

    #[test]
    fn concurrent_acquire_and_release_never_double_opens() {
        testing::with_watchdog(|| {
            let registry = Registry::new(CountingConnector::default());

            testing::on_threads(4, {
                let registry = registry.clone();
                move |_| {
                    for _ in 0..500 {
                        let handle = registry.get_instance(7, &"p").unwrap();
                        assert!(handle.is_open());
                        handle.close().unwrap();
                    }
                }
            });

            // Every open was matched by exactly one close.
            assert_eq!(opens(&registry), closes(&registry));
            assert!(registry.is_empty());
        });
    }

    #[test]
    fn force_close_all_closes_newest_first_and_ignores_counts() {
        #[derive(Debug, Default)]
        struct Ordered {
            closed: Mutex<Vec<u32>>,
        }

        impl Connector for Ordered {
            type Identity = u32;
            type Params = ();
            type Native = u32;
            type Error = io::Error;

            fn kind(&self) -> &'static str {
                "ordered"
            }

            fn open(&self, identity: &u32, _params: &()) -> io::Result<u32> {
                Ok(*identity)
            }

            fn close(&self, identity: &u32, _native: u32) -> io::Result<()> {
                self.closed.lock().unwrap().push(*identity);
                Ok(())
            }
        }

        let registry = HandleRegistry::new(Ordered::default());

        let held: Vec<_> = [3, 1, 2]
            .into_iter()
            .map(|id| registry.get_instance(id, &()).unwrap())
            .collect();
        let extra = registry.get_instance(3, &()).unwrap();

        assert_eq!(registry.force_close_all(), 3);
        assert_eq!(*registry.connector().closed.lock().unwrap(), [2, 1, 3]);

        // Tokens outstanding at shutdown release nothing.
        for handle in held {
            assert!(!handle.is_open());
            handle.close().unwrap();
        }
        mem::drop(extra);
        assert_eq!(registry.connector().closed.lock().unwrap().len(), 3);

        assert!(registry.is_closed());
        assert!(matches!(
            registry.get_instance(9, &()),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn acquisitions_racing_force_close_all_leave_nothing_open() {
        testing::with_watchdog(|| {
            for _ in 0..200 {
                let registry = Registry::new(CountingConnector::default());
                let barrier = Arc::new(Barrier::new(2));

                let acquirer = thread::spawn({
                    let registry = registry.clone();
                    let barrier = Arc::clone(&barrier);
                    move || {
                        barrier.wait();

                        let mut held = Vec::new();
                        for identity in 0_u32.. {
                            match registry.get_instance(identity % 4, &"p") {
                                Ok(handle) => held.push(handle),
                                Err(Error::InvalidState { .. }) => break,
                                Err(other) => panic!("unexpected error: {other}"),
                            }
                        }
                        held
                    }
                });

                barrier.wait();
                registry.force_close_all();

                let held = acquirer.join().unwrap();

                // Whatever was opened before the shutdown was closed by it, and nothing was
                // opened after it.
                assert!(registry.is_empty());
                assert_eq!(opens(&registry), closes(&registry));
                assert!(held.iter().all(|handle| !handle.is_open()));
            }
        });
    }

    #[test]
    fn unshared_handles_are_private() {
        let registry = Registry::new(CountingConnector::default());

        let shared = registry.get_instance(1, &"p").unwrap();
        let private = registry.open_unshared(1, &"p").unwrap();

        assert_eq!(opens(&registry), 2);
        assert_ne!(shared.native(), private.native());
        assert!(!private.is_shared());
        assert_eq!(registry.ref_count(&1), 1);

        private.close().unwrap();
        assert_eq!(closes(&registry), 1);
        assert!(registry.contains(&1));

        // Shutdown does not see unshared handles.
        let other_private = registry.open_unshared(2, &"p").unwrap();
        assert_eq!(registry.force_close_all(), 1);
        assert!(other_private.is_open());
        other_private.close().unwrap();
        assert_eq!(closes(&registry), 3);
    }
}
