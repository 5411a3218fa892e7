use std::sync::{Mutex, MutexGuard};

use foldhash::{HashMap, HashMapExt};
use uuid::Uuid;

use crate::{
    ContainerFlags, ERR_POISONED_LOCK, NativeHandle, PoolOptions, ResourceKind, StorageBackend,
    StorageError,
};

/// A [`StorageBackend`] that keeps everything in process memory.
///
/// It enforces the same nesting rules as a real storage library: closing a pool or container
/// fails with [`StorageError::BUSY`] while something is still open on top of it, and nothing
/// works after [`finalize()`][StorageBackend::finalize]. It also counts every open and close per
/// [`ResourceKind`], which lets tests check that resources are opened and closed exactly once.
#[derive(Debug)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    next_handle: u64,

    pools: HashMap<NativeHandle, Uuid>,

    // Container -> pool it was opened in.
    containers: HashMap<NativeHandle, NativeHandle>,

    // Mount -> pool and container it was mounted on.
    mounts: HashMap<NativeHandle, (NativeHandle, Option<NativeHandle>)>,

    opens: HashMap<ResourceKind, usize>,
    closes: HashMap<ResourceKind, usize>,

    finalized: bool,
}

impl MemoryStorage {
    /// Creates a backend with nothing open.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_handle: 0,
                pools: HashMap::new(),
                containers: HashMap::new(),
                mounts: HashMap::new(),
                opens: HashMap::new(),
                closes: HashMap::new(),
                finalized: false,
            }),
        }
    }

    /// How many resources of `kind` have been opened so far.
    #[must_use]
    pub fn opens(&self, kind: ResourceKind) -> usize {
        self.lock().opens.get(&kind).copied().unwrap_or_default()
    }

    /// How many resources of `kind` have been closed so far.
    #[must_use]
    pub fn closes(&self, kind: ResourceKind) -> usize {
        self.lock().closes.get(&kind).copied().unwrap_or_default()
    }

    /// How many resources of `kind` are open right now.
    #[must_use]
    pub fn open_now(&self, kind: ResourceKind) -> usize {
        let state = self.lock();

        match kind {
            ResourceKind::Pool => state.pools.len(),
            ResourceKind::Container => state.containers.len(),
            ResourceKind::Mount => state.mounts.len(),
        }
    }

    /// Whether [`finalize()`][StorageBackend::finalize] has succeeded.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn lock_initialized(
        &self,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        let state = self.lock();

        if state.finalized {
            return Err(StorageError::new(operation, StorageError::UNINITIALIZED));
        }

        Ok(state)
    }
}

impl MemoryState {
    fn issue(&mut self, kind: ResourceKind) -> NativeHandle {
        self.next_handle = self.next_handle.wrapping_add(1);
        count(&mut self.opens, kind);
        NativeHandle::new(self.next_handle)
    }

    fn ensure_pool(&self, operation: &'static str, pool: NativeHandle) -> Result<(), StorageError> {
        if self.pools.contains_key(&pool) {
            Ok(())
        } else {
            Err(StorageError::new(operation, StorageError::NO_HANDLE))
        }
    }
}

fn count(counts: &mut HashMap<ResourceKind, usize>, kind: ResourceKind) {
    let entry = counts.entry(kind).or_default();
    *entry = entry.saturating_add(1);
}

impl StorageBackend for MemoryStorage {
    fn connect_pool(
        &self,
        pool: Uuid,
        options: &PoolOptions,
    ) -> Result<NativeHandle, StorageError> {
        let mut state = self.lock_initialized("connect_pool")?;

        let handle = state.issue(ResourceKind::Pool);
        state.pools.insert(handle, pool);

        tracing::debug!(
            %pool,
            server_group = options.server_group(),
            ranks = options.ranks(),
            flags = ?options.flags(),
            %handle,
            "connected to in-memory pool"
        );

        Ok(handle)
    }

    fn disconnect_pool(&self, pool: NativeHandle) -> Result<(), StorageError> {
        const OPERATION: &str = "disconnect_pool";

        let mut state = self.lock_initialized(OPERATION)?;
        state.ensure_pool(OPERATION, pool)?;

        let in_use = state.containers.values().any(|parent| *parent == pool)
            || state.mounts.values().any(|(parent, _)| *parent == pool);

        if in_use {
            return Err(StorageError::new(OPERATION, StorageError::BUSY));
        }

        state.pools.remove(&pool);
        count(&mut state.closes, ResourceKind::Pool);

        Ok(())
    }

    fn open_container(
        &self,
        pool: NativeHandle,
        container: Uuid,
        flags: ContainerFlags,
    ) -> Result<NativeHandle, StorageError> {
        const OPERATION: &str = "open_container";

        let mut state = self.lock_initialized(OPERATION)?;
        state.ensure_pool(OPERATION, pool)?;

        let handle = state.issue(ResourceKind::Container);
        state.containers.insert(handle, pool);

        tracing::debug!(%container, ?flags, %handle, "opened in-memory container");

        Ok(handle)
    }

    fn close_container(&self, container: NativeHandle) -> Result<(), StorageError> {
        const OPERATION: &str = "close_container";

        let mut state = self.lock_initialized(OPERATION)?;

        if !state.containers.contains_key(&container) {
            return Err(StorageError::new(OPERATION, StorageError::NO_HANDLE));
        }

        if state
            .mounts
            .values()
            .any(|(_, mounted)| *mounted == Some(container))
        {
            return Err(StorageError::new(OPERATION, StorageError::BUSY));
        }

        state.containers.remove(&container);
        count(&mut state.closes, ResourceKind::Container);

        Ok(())
    }

    fn mount(
        &self,
        pool: NativeHandle,
        container: Option<NativeHandle>,
        read_only: bool,
    ) -> Result<NativeHandle, StorageError> {
        const OPERATION: &str = "mount";

        let mut state = self.lock_initialized(OPERATION)?;
        state.ensure_pool(OPERATION, pool)?;

        if let Some(container) = container {
            if state.containers.get(&container) != Some(&pool) {
                return Err(StorageError::new(OPERATION, StorageError::NO_HANDLE));
            }
        }

        let handle = state.issue(ResourceKind::Mount);
        state.mounts.insert(handle, (pool, container));

        tracing::debug!(read_only, %handle, "mounted in-memory file system");

        Ok(handle)
    }

    fn unmount(&self, mount: NativeHandle) -> Result<(), StorageError> {
        let mut state = self.lock_initialized("unmount")?;

        if state.mounts.remove(&mount).is_none() {
            return Err(StorageError::new("unmount", StorageError::NO_HANDLE));
        }

        count(&mut state.closes, ResourceKind::Mount);

        Ok(())
    }

    fn finalize(&self) -> Result<(), StorageError> {
        let mut state = self.lock_initialized("finalize")?;

        if !state.pools.is_empty() {
            return Err(StorageError::new("finalize", StorageError::BUSY));
        }

        state.finalized = true;

        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}
