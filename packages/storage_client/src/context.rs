use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use event_queue::{
    Attachment, Clock, EventBackend, EventId, EventQueueConfig, EventQueueRegistry,
    LocalEventQueue,
};
use shared_handle::{HandleRegistry, ShutdownSequence};
use uuid::Uuid;

use crate::{
    Client, ClientConnector, ClientId, ClientOptions, ClientParams, Container, ContainerConnector,
    ContainerFlags, ContainerId, ContainerParams, Error, IoAttachment, IoKind, Pool,
    PoolConnector, PoolOptions, Result, StorageBackend,
};

/// Everything a process needs to talk to the storage system: one shared connection per pool,
/// one open instance per container, one mount per file system view and one event queue per
/// thread.
///
/// The context is thread-safe. Share it by reference or wrap it in an `Arc`.
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use event_queue::{LoopbackBackend, ResultCode};
/// use storage_client::{
///     ClientContext, ClientOptions, ContainerFlags, IoAttachment, IoKind, MemoryStorage,
///     PoolOptions,
/// };
/// use uuid::Uuid;
///
/// let events = Arc::new(LoopbackBackend::new());
/// let context = ClientContext::builder()
///     .storage(Arc::new(MemoryStorage::new()))
///     .events(events.clone())
///     .build()
///     .unwrap();
///
/// let pool = context
///     .connect_pool(Uuid::from_u128(1), &PoolOptions::default())
///     .unwrap();
/// let container = context
///     .open_container(&pool, Uuid::from_u128(2), ContainerFlags::ReadWrite)
///     .unwrap();
/// let _client = context
///     .mount(&pool, Some(&container), &ClientOptions::default())
///     .unwrap();
///
/// let write = IoAttachment::write(0, b"hello".to_vec());
/// let mut completed = Vec::new();
/// let event = context
///     .submit_io(write.clone(), Duration::from_secs(1), &mut completed)
///     .unwrap();
///
/// let queue = context.event_queue().unwrap().borrow().backend_queue();
/// events.complete(queue, event, ResultCode::SUCCESS);
///
/// context
///     .wait_io(IoKind::Write, Duration::from_secs(1), &mut completed)
///     .unwrap();
/// assert!(write.succeeded());
///
/// context.shutdown();
/// ```
///
/// # Shutdown
///
/// [`shutdown()`][Self::shutdown] tears down, in order: file system views, containers, pools
/// and the event queues of every thread, then finalizes the storage backend. Handles still
/// held by callers at that point are closed regardless and become inert. Dropping the context
/// runs the shutdown if nobody has yet.
pub struct ClientContext {
    storage: Arc<dyn StorageBackend>,
    event_queues: EventQueueRegistry<IoAttachment>,
    pools: HandleRegistry<PoolConnector>,
    containers: HandleRegistry<ContainerConnector>,
    clients: HandleRegistry<ClientConnector>,
    shutdown: ShutdownSequence,
}

impl ClientContext {
    /// Starts building a context.
    #[must_use]
    pub fn builder() -> ClientContextBuilder {
        ClientContextBuilder::default()
    }

    /// Acquires a connection to `pool`, connecting with `options` if this is the first one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handle`] if the backend refuses the connection or the context has
    /// been shut down.
    pub fn connect_pool(&self, pool: Uuid, options: &PoolOptions) -> Result<Pool> {
        Ok(self.pools.get_instance(pool, options)?)
    }

    /// Acquires container `container` inside `pool`, opening it with `flags` if this is the
    /// first acquisition.
    ///
    /// The caller must keep `pool` for as long as it uses the container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handle`] if `pool` has been closed, the backend refuses to open the
    /// container or the context has been shut down.
    pub fn open_container(
        &self,
        pool: &Pool,
        container: Uuid,
        flags: ContainerFlags,
    ) -> Result<Container> {
        // Fail with the parent's own error rather than a wrapped backend failure.
        pool.link().native()?;

        let identity = ContainerId::new(*pool.identity(), container);

        Ok(self
            .containers
            .get_instance(identity, &ContainerParams::new(pool, flags))?)
    }

    /// Mounts a file system view on `pool` and `container`, or on the pool's root container
    /// if `container` is `None`.
    ///
    /// A shared view (the default) is mounted once per pool and container and shared by every
    /// caller. A private view is mounted anew for this caller alone and unmounted when the
    /// returned handle is released.
    ///
    /// The caller must keep `pool` and `container` for as long as it uses the view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handle`] if `pool` or `container` has been closed, the backend
    /// refuses the mount or the context has been shut down.
    ///
    /// Returns [`Error::InvalidConfiguration`] if `container` is not in `pool`.
    pub fn mount(
        &self,
        pool: &Pool,
        container: Option<&Container>,
        options: &ClientOptions,
    ) -> Result<Client> {
        pool.link().native()?;

        if let Some(container) = container {
            container.link().native()?;

            if container.identity().pool() != *pool.identity() {
                return Err(Error::InvalidConfiguration {
                    problem: format!(
                        "container {} is not in pool {}",
                        container.identity(),
                        pool.identity()
                    ),
                });
            }
        }

        let identity = ClientId::new(
            *pool.identity(),
            container.map(|container| container.identity().container()),
        );
        let params = ClientParams::new(pool, container, options.read_only());

        let client = if options.shared() {
            self.clients.get_instance(identity, &params)?
        } else {
            self.clients.open_unshared(identity, &params)?
        };

        Ok(client)
    }

    /// The calling thread's event queue, created on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EventQueue`] if the queue cannot be created or the context has been
    /// shut down.
    pub fn event_queue(&self) -> Result<LocalEventQueue<IoAttachment>> {
        Ok(self.event_queues.current()?)
    }

    /// Submits `operation` on the calling thread's event queue, waiting up to `max_wait` for
    /// a free event.
    ///
    /// Operations of the same kind that complete while waiting are appended to `completed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EventQueue`] if no event frees up in time or the backend refuses the
    /// operation. The event is given back in the latter case.
    pub fn submit_io(
        &self,
        operation: IoAttachment,
        max_wait: Duration,
        completed: &mut Vec<IoAttachment>,
    ) -> Result<EventId> {
        let queue = self.event_queue()?;
        let mut queue = queue.borrow_mut();

        let event = queue.acquire_event_blocking(max_wait, operation.kind(), None, completed)?;
        let descriptor = operation.descriptor();
        queue.attach(event, operation)?;

        if let Err(error) = queue.submit(event, &descriptor) {
            if let Some(mut operation) = queue.return_event(event)? {
                operation.release();
            }

            return Err(error.into());
        }

        Ok(event)
    }

    /// Waits up to `max_wait` for at least one operation of `kind` to complete on the calling
    /// thread's event queue, appending the completed operations to `completed`.
    ///
    /// Operations of other kinds that complete meanwhile are kept for a later call. Returns the
    /// number of operations appended, which is zero only if nothing was in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EventQueue`] if nothing of `kind` completes in time.
    pub fn wait_io(
        &self,
        kind: IoKind,
        max_wait: Duration,
        completed: &mut Vec<IoAttachment>,
    ) -> Result<usize> {
        let queue = self.event_queue()?;
        let delivered = queue
            .borrow_mut()
            .wait_for_any(max_wait, kind, None, completed)?;

        Ok(delivered)
    }

    /// The storage backend.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// The per-thread event queues.
    #[must_use]
    pub fn event_queues(&self) -> &EventQueueRegistry<IoAttachment> {
        &self.event_queues
    }

    /// The pool connections.
    #[must_use]
    pub fn pools(&self) -> &HandleRegistry<PoolConnector> {
        &self.pools
    }

    /// The open containers.
    #[must_use]
    pub fn containers(&self) -> &HandleRegistry<ContainerConnector> {
        &self.containers
    }

    /// The shared file system views. Private views are not listed.
    #[must_use]
    pub fn clients(&self) -> &HandleRegistry<ClientConnector> {
        &self.clients
    }

    /// Tears everything down and finalizes the storage backend.
    ///
    /// Teardown failures are logged, not returned. Returns `false` if the context had
    /// already been shut down.
    pub fn shutdown(&self) -> bool {
        self.shutdown.run()
    }

    /// Whether [`shutdown()`][Self::shutdown] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.has_run()
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        if self.shutdown.run() {
            tracing::debug!("client context shut down on drop");
        }
    }
}

impl fmt::Debug for ClientContext {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("storage", &self.storage)
            .field("event_queues", &self.event_queues)
            .field("pools", &self.pools)
            .field("containers", &self.containers)
            .field("clients", &self.clients)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// Builds a [`ClientContext`].
#[derive(Debug, Default)]
#[must_use]
pub struct ClientContextBuilder {
    event_queue: EventQueueConfig,
    clock: Clock,
    storage: Option<Arc<dyn StorageBackend>>,
    events: Option<Arc<dyn EventBackend>>,
}

impl ClientContextBuilder {
    /// Sets the configuration of every thread's event queue. Defaults to
    /// [`EventQueueConfig::default()`].
    pub fn event_queue(mut self, config: EventQueueConfig) -> Self {
        self.event_queue = config;
        self
    }

    /// Sets the clock the event queues measure time with. Defaults to [`Clock::system()`].
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the storage backend. Required.
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the backend of the event queues. Required.
    pub fn events(mut self, events: Arc<dyn EventBackend>) -> Self {
        self.events = Some(events);
        self
    }

    /// Creates the context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the storage or event backend is missing.
    pub fn build(self) -> Result<ClientContext> {
        let storage = self.storage.ok_or_else(|| Error::InvalidConfiguration {
            problem: "a storage backend is required".to_string(),
        })?;
        let events = self.events.ok_or_else(|| Error::InvalidConfiguration {
            problem: "an event backend is required".to_string(),
        })?;

        let event_queues = EventQueueRegistry::with_clock(events, self.event_queue, self.clock);
        let pools = HandleRegistry::new(PoolConnector::new(Arc::clone(&storage)));
        let containers = HandleRegistry::new(ContainerConnector::new(Arc::clone(&storage)));
        let clients = HandleRegistry::new(ClientConnector::new(Arc::clone(&storage)));

        // Registered bottom-up, so they run top-down.
        let shutdown = ShutdownSequence::new();

        shutdown.set_backend_finalizer("storage backend", {
            let storage = Arc::clone(&storage);
            move || {
                if let Err(error) = storage.finalize() {
                    tracing::error!(%error, "failed to finalize storage backend");
                }
            }
        })?;

        shutdown.register("event queues", {
            let event_queues = event_queues.clone();
            move || {
                if let Err(error) = event_queues.shutdown() {
                    tracing::error!(%error, "failed to shut down event queues");
                }
            }
        })?;

        shutdown.register("pools", force_close(pools.clone()))?;
        shutdown.register("containers", force_close(containers.clone()))?;
        shutdown.register("clients", force_close(clients.clone()))?;

        Ok(ClientContext {
            storage,
            event_queues,
            pools,
            containers,
            clients,
            shutdown,
        })
    }
}

fn force_close<C>(registry: HandleRegistry<C>) -> impl FnOnce() + Send + 'static
where
    C: shared_handle::Connector,
{
    move || {
        let closed = registry.force_close_all();
        tracing::debug!(kind = registry.connector().kind(), closed, "closed handles at shutdown");
    }
}
