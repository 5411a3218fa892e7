use std::fmt::{self, Display};
use std::sync::Arc;

use shared_handle::{Connector, ParentLink, SharedHandle};
use uuid::Uuid;

use crate::{ContainerFlags, Error, NativeHandle, PoolOptions, StorageBackend};

/// The container a file system view is mounted on when no container is named.
pub const ROOT_CONTAINER: Uuid = Uuid::from_u128(u128::MAX);

/// A shared connection to a pool.
pub type Pool = SharedHandle<PoolConnector>;

/// A shared open container.
pub type Container = SharedHandle<ContainerConnector>;

/// A mounted file system view, shared or private depending on how it was mounted.
pub type Client = SharedHandle<ClientConnector>;

/// Connects to and disconnects from pools.
#[derive(Debug)]
pub struct PoolConnector {
    storage: Arc<dyn StorageBackend>,
}

impl PoolConnector {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

impl Connector for PoolConnector {
    type Identity = Uuid;
    type Params = PoolOptions;
    type Native = NativeHandle;
    type Error = Error;

    fn kind(&self) -> &'static str {
        "pool"
    }

    fn open(&self, identity: &Uuid, params: &PoolOptions) -> Result<NativeHandle, Error> {
        Ok(self.storage.connect_pool(*identity, params)?)
    }

    fn close(&self, _identity: &Uuid, native: NativeHandle) -> Result<(), Error> {
        Ok(self.storage.disconnect_pool(native)?)
    }
}

/// Identifies a container: the pool it lives in and its own id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ContainerId {
    pool: Uuid,
    container: Uuid,
}

impl ContainerId {
    /// Identifies container `container` in pool `pool`.
    #[must_use]
    pub const fn new(pool: Uuid, container: Uuid) -> Self {
        Self { pool, container }
    }

    /// The pool the container lives in.
    #[must_use]
    pub const fn pool(&self) -> Uuid {
        self.pool
    }

    /// The container's own id.
    #[must_use]
    pub const fn container(&self) -> Uuid {
        self.container
    }
}

impl Display for ContainerId {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.container)
    }
}

/// What a container needs in order to be opened.
#[derive(Clone, Debug)]
pub struct ContainerParams {
    pool: ParentLink<PoolConnector>,
    flags: ContainerFlags,
}

impl ContainerParams {
    /// Opens the container inside `pool` with `flags`.
    #[must_use]
    pub fn new(pool: &Pool, flags: ContainerFlags) -> Self {
        Self {
            pool: pool.link(),
            flags,
        }
    }
}

/// An open container and the pool it was opened in.
#[derive(Clone, Debug)]
pub struct ContainerNative {
    handle: NativeHandle,
    pool: ParentLink<PoolConnector>,
}

impl ContainerNative {
    /// The backend's handle to the container.
    #[must_use]
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    /// The pool the container was opened in.
    #[must_use]
    pub fn pool(&self) -> &ParentLink<PoolConnector> {
        &self.pool
    }
}

/// Opens and closes containers on top of already connected pools.
#[derive(Debug)]
pub struct ContainerConnector {
    storage: Arc<dyn StorageBackend>,
}

impl ContainerConnector {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

impl Connector for ContainerConnector {
    type Identity = ContainerId;
    type Params = ContainerParams;
    type Native = ContainerNative;
    type Error = Error;

    fn kind(&self) -> &'static str {
        "container"
    }

    fn open(
        &self,
        identity: &ContainerId,
        params: &ContainerParams,
    ) -> Result<ContainerNative, Error> {
        let pool = params.pool.native()?;

        let handle = self
            .storage
            .open_container(pool, identity.container, params.flags)?;

        Ok(ContainerNative {
            handle,
            pool: params.pool.clone(),
        })
    }

    fn close(&self, _identity: &ContainerId, native: ContainerNative) -> Result<(), Error> {
        Ok(self.storage.close_container(native.handle)?)
    }
}

/// Identifies a file system view: the pool and the container it is mounted on.
///
/// A view of the pool's root container is identified by [`ROOT_CONTAINER`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClientId {
    pool: Uuid,
    container: Uuid,
}

impl ClientId {
    /// Identifies the view of `container` in `pool`, or of the pool's root container if
    /// `container` is `None`.
    #[must_use]
    pub fn new(pool: Uuid, container: Option<Uuid>) -> Self {
        Self {
            pool,
            container: container.unwrap_or(ROOT_CONTAINER),
        }
    }

    /// The pool the view is mounted on.
    #[must_use]
    pub const fn pool(&self) -> Uuid {
        self.pool
    }

    /// The container the view is mounted on, [`ROOT_CONTAINER`] for the root container.
    #[must_use]
    pub const fn container(&self) -> Uuid {
        self.container
    }

    /// Whether the view is of the pool's root container.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.container == ROOT_CONTAINER
    }
}

impl Display for ClientId {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.container)
    }
}

/// What a file system view needs in order to be mounted.
#[derive(Clone, Debug)]
pub struct ClientParams {
    pool: ParentLink<PoolConnector>,
    container: Option<ParentLink<ContainerConnector>>,
    read_only: bool,
}

impl ClientParams {
    /// Mounts a view on `pool` and `container`, or on the pool's root container if
    /// `container` is `None`.
    #[must_use]
    pub fn new(pool: &Pool, container: Option<&Container>, read_only: bool) -> Self {
        Self {
            pool: pool.link(),
            container: container.map(SharedHandle::link),
            read_only,
        }
    }
}

/// A mounted file system view and what it is mounted on.
#[derive(Clone, Debug)]
pub struct ClientNative {
    mount: NativeHandle,
    pool: ParentLink<PoolConnector>,
    container: Option<ParentLink<ContainerConnector>>,
    read_only: bool,
}

impl ClientNative {
    /// The backend's handle to the mount.
    #[must_use]
    pub fn mount(&self) -> NativeHandle {
        self.mount
    }

    /// The pool the view is mounted on.
    #[must_use]
    pub fn pool(&self) -> &ParentLink<PoolConnector> {
        &self.pool
    }

    /// The container the view is mounted on, `None` for the root container.
    #[must_use]
    pub fn container(&self) -> Option<&ParentLink<ContainerConnector>> {
        self.container.as_ref()
    }

    /// Whether the view is read-only.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }
}

/// Mounts and unmounts file system views.
#[derive(Debug)]
pub struct ClientConnector {
    storage: Arc<dyn StorageBackend>,
}

impl ClientConnector {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

impl Connector for ClientConnector {
    type Identity = ClientId;
    type Params = ClientParams;
    type Native = ClientNative;
    type Error = Error;

    fn kind(&self) -> &'static str {
        "client"
    }

    fn open(&self, _identity: &ClientId, params: &ClientParams) -> Result<ClientNative, Error> {
        let pool = params.pool.native()?;
        let container = params
            .container
            .as_ref()
            .map(|link| link.native().map(|native| native.handle))
            .transpose()?;

        let mount = self.storage.mount(pool, container, params.read_only)?;

        Ok(ClientNative {
            mount,
            pool: params.pool.clone(),
            container: params.container.clone(),
            read_only: params.read_only,
        })
    }

    fn close(&self, _identity: &ClientId, native: ClientNative) -> Result<(), Error> {
        Ok(self.storage.unmount(native.mount)?)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use mockall::predicate::eq;
    use shared_handle::HandleRegistry;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{MockStorageBackend, StorageError};

    assert_impl_all!(Pool: Send, Sync);
    assert_impl_all!(Container: Send, Sync);
    assert_impl_all!(Client: Send, Sync);

    const POOL: Uuid = Uuid::from_u128(1);
    const CONTAINER: Uuid = Uuid::from_u128(2);

    #[test]
    fn root_container_is_all_ones() {
        assert_eq!(
            ROOT_CONTAINER.to_string(),
            "ffffffff-ffff-ffff-ffff-ffffffffffff"
        );
        assert!(ClientId::new(POOL, None).is_root());
        assert!(!ClientId::new(POOL, Some(CONTAINER)).is_root());
    }

    #[test]
    fn pool_connector_passes_options_to_backend() {
        let mut storage = MockStorageBackend::new();
        storage
            .expect_connect_pool()
            .withf(|pool, options| *pool == POOL && options.ranks() == "0:1")
            .times(1)
            .returning(|_, _| Ok(NativeHandle::new(5)));
        storage
            .expect_disconnect_pool()
            .with(eq(NativeHandle::new(5)))
            .times(1)
            .returning(|_| Ok(()));

        let pools = HandleRegistry::new(PoolConnector::new(Arc::new(storage)));
        let options = PoolOptions::builder().ranks("0:1").build();

        let pool = pools.get_instance(POOL, &options).unwrap();
        assert_eq!(*pool.native(), NativeHandle::new(5));
        pool.close().unwrap();
    }

    #[test]
    fn container_opens_on_parent_native_handle() {
        let mut storage = MockStorageBackend::new();
        storage
            .expect_connect_pool()
            .returning(|_, _| Ok(NativeHandle::new(5)));
        storage
            .expect_open_container()
            .with(eq(NativeHandle::new(5)), eq(CONTAINER), eq(ContainerFlags::NoSlip))
            .times(1)
            .returning(|_, _, _| Ok(NativeHandle::new(6)));
        storage.expect_close_container().returning(|_| Ok(()));
        storage.expect_disconnect_pool().returning(|_| Ok(()));

        let storage: Arc<dyn StorageBackend> = Arc::new(storage);
        let pools = HandleRegistry::new(PoolConnector::new(Arc::clone(&storage)));
        let containers = HandleRegistry::new(ContainerConnector::new(storage));

        let pool = pools.get_instance(POOL, &PoolOptions::default()).unwrap();
        let container = containers
            .get_instance(
                ContainerId::new(POOL, CONTAINER),
                &ContainerParams::new(&pool, ContainerFlags::NoSlip),
            )
            .unwrap();

        assert_eq!(container.native().handle(), NativeHandle::new(6));
        assert!(container.native().pool().is_open());
    }

    #[test]
    fn backend_failure_surfaces_as_handle_error() {
        let mut storage = MockStorageBackend::new();
        storage
            .expect_connect_pool()
            .returning(|_, _| Err(StorageError::new("connect_pool", -1005)));

        let pools = HandleRegistry::new(PoolConnector::new(Arc::new(storage)));

        let error = Error::from(
            pools
                .get_instance(POOL, &PoolOptions::default())
                .unwrap_err(),
        );

        assert_eq!(error.storage_error().unwrap().code(), -1005);
        assert!(pools.is_empty());
    }

    #[test]
    fn client_mounts_root_container_when_none_given() {
        let mut storage = MockStorageBackend::new();
        storage
            .expect_connect_pool()
            .returning(|_, _| Ok(NativeHandle::new(5)));
        storage
            .expect_mount()
            .with(eq(NativeHandle::new(5)), eq(None::<NativeHandle>), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(NativeHandle::new(9)));
        storage.expect_unmount().returning(|_| Ok(()));
        storage.expect_disconnect_pool().returning(|_| Ok(()));

        let storage: Arc<dyn StorageBackend> = Arc::new(storage);
        let pools = HandleRegistry::new(PoolConnector::new(Arc::clone(&storage)));
        let clients = HandleRegistry::new(ClientConnector::new(storage));

        let pool = pools.get_instance(POOL, &PoolOptions::default()).unwrap();
        let client = clients
            .get_instance(ClientId::new(POOL, None), &ClientParams::new(&pool, None, true))
            .unwrap();

        assert_eq!(client.native().mount(), NativeHandle::new(9));
        assert!(client.native().read_only());
        assert!(client.native().container().is_none());
        assert!(client.identity().is_root());
    }
}
