use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{self, AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use foldhash::{HashMap, HashMapExt};

use crate::event_queue::Lifeline;
use crate::{
    Attachment, Clock, ERR_POISONED_LOCK, Error, EventBackend, EventQueue, EventQueueConfig,
    QueueHandle, Result,
};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Registry ID -> Rc<RefCell<EventQueue<A>>> for whatever `A` that registry uses.
    //
    // The queues themselves are single-threaded so they can only live here. The registry
    // only keeps a thread-safe record of each queue, enough to destroy the backend queue.
    static LOCAL_QUEUES: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Hands out one [`EventQueue`] per thread, creating it on first use.
///
/// All queues share the backend, configuration and clock given to the registry. The registry
/// itself is thread-safe and cheap to clone; clones share the same set of queues.
///
/// ```
/// use std::sync::Arc;
///
/// use event_queue::{EventQueueConfig, EventQueueRegistry, LoopbackBackend, TaggedAttachment};
///
/// let registry = EventQueueRegistry::<TaggedAttachment<u8>>::new(
///     Arc::new(LoopbackBackend::new()),
///     EventQueueConfig::default(),
/// );
///
/// let queue = registry.current().unwrap();
/// let event = queue.borrow_mut().acquire_event().unwrap();
/// assert!(event.is_some());
///
/// // Same thread, same queue.
/// assert_eq!(
///     registry.current().unwrap().borrow().backend_queue(),
///     queue.borrow().backend_queue()
/// );
///
/// registry.shutdown().unwrap();
/// ```
///
/// # Lifecycle
///
/// A thread's queue lives until the thread calls [`destroy_current()`][Self::destroy_current],
/// until the thread exits, or until [`shutdown()`][Self::shutdown] destroys the backend
/// queues of all threads. Shutdown can be called from any thread. Queues whose backend queue
/// was destroyed by shutdown reject further use and release their attachments once their
/// owning thread drops them.
pub struct EventQueueRegistry<A>
where
    A: Attachment,
{
    shared: Arc<RegistryShared>,

    _attachment: PhantomData<fn() -> A>,
}

struct RegistryShared {
    id: u64,

    backend: Arc<dyn EventBackend>,
    config: EventQueueConfig,
    clock: Clock,

    // In registration order.
    records: Mutex<Vec<QueueRecord>>,
    shut_down: AtomicBool,
}

#[derive(Debug)]
struct QueueRecord {
    thread_id: ThreadId,
    queue: QueueHandle,
    lifeline: Arc<Lifeline>,
}

impl<A> EventQueueRegistry<A>
where
    A: Attachment,
{
    /// Creates a registry whose queues use the system clock.
    #[must_use]
    pub fn new(backend: Arc<dyn EventBackend>, config: EventQueueConfig) -> Self {
        Self::with_clock(backend, config, Clock::system())
    }

    /// Creates a registry whose queues use the given clock.
    #[must_use]
    pub fn with_clock(
        backend: Arc<dyn EventBackend>,
        config: EventQueueConfig,
        clock: Clock,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                id: NEXT_REGISTRY_ID.fetch_add(1, atomic::Ordering::Relaxed),
                backend,
                config,
                clock,
                records: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
            _attachment: PhantomData,
        }
    }

    /// The configuration every queue of this registry is created with.
    #[must_use]
    pub fn config(&self) -> EventQueueConfig {
        self.shared.config
    }

    /// The queue of the current thread, created if the thread does not have one yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the registry has been shut down.
    ///
    /// Returns [`Error::Backend`] if creating the backend queue fails.
    pub fn current(&self) -> Result<LocalEventQueue<A>> {
        self.ensure_running()?;

        if let Some(queue) = self.local_queue() {
            // A queue that is mutably borrowed further up the stack is alive by definition.
            if queue.try_borrow().map_or(true, |q| !q.is_destroyed()) {
                return Ok(LocalEventQueue { inner: queue });
            }

            // Shut down after we checked, or torn down some other way. Either way it is
            // dead and cannot be resurrected.
            return Err(Error::invalid_state(
                "the event queue of the current thread has been destroyed",
            ));
        }

        let lifeline = Arc::new(Lifeline::new());

        let queue = EventQueue::<A>::with_lifeline(
            Arc::clone(&self.shared.backend),
            self.shared.config,
            self.shared.clock.clone(),
            Arc::clone(&lifeline),
        )?;

        let thread_id = thread::current().id();

        {
            let mut records = self.shared.lock_records();

            // Threads that exited already destroyed their queue on the way out.
            records.retain(|r| !r.lifeline.is_destroyed());

            records.push(QueueRecord {
                thread_id,
                queue: queue.backend_queue(),
                lifeline,
            });
        }

        // Shutdown may have raced with us. If so, it either saw our record and destroyed the
        // backend queue (the queue is then poisoned) or it did not, and we must not keep it.
        if self.shared.shut_down.load(atomic::Ordering::Acquire) {
            queue.destroy()?;
            return Err(shut_down_error());
        }

        tracing::debug!(
            ?thread_id,
            queue = ?queue.backend_queue(),
            "registered event queue for thread"
        );

        let queue = Rc::new(RefCell::new(queue));

        LOCAL_QUEUES.with_borrow_mut(|queues| {
            queues.insert(self.shared.id, Rc::clone(&queue) as Rc<dyn Any>);
        });

        Ok(LocalEventQueue { inner: queue })
    }

    /// Destroys the queue of the current thread, if it has one.
    ///
    /// Attachments still bound to events or detained are released without delivery.
    /// A later call to [`current()`][Self::current] creates a fresh queue.
    ///
    /// Returns whether there was a queue to destroy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the queue is currently borrowed.
    ///
    /// Returns [`Error::Backend`] if destroying the backend queue fails.
    pub fn destroy_current(&self) -> Result<bool> {
        let Some(queue) = self.local_queue() else {
            return Ok(false);
        };

        let mut queue_ref = queue.try_borrow_mut().map_err(|_| {
            Error::invalid_state("cannot destroy the event queue while it is being used")
        })?;

        LOCAL_QUEUES.with_borrow_mut(|queues| queues.remove(&self.shared.id));

        let thread_id = thread::current().id();
        self.shared
            .lock_records()
            .retain(|r| r.thread_id != thread_id);

        queue_ref.destroy_in_place()?;

        Ok(true)
    }

    /// Destroys the backend queues of all threads, newest first, and rejects further use.
    ///
    /// The queue of the calling thread is also dropped, releasing its attachments. The queues
    /// of other threads release theirs when those threads drop them.
    ///
    /// Calling this more than once has no further effect.
    ///
    /// # Errors
    ///
    /// Every backend queue is destroyed even if some fail; the first failure is returned.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.shut_down.swap(true, atomic::Ordering::AcqRel) {
            return Ok(());
        }

        let records = std::mem::take(&mut *self.shared.lock_records());

        tracing::debug!(queues = records.len(), "shutting down event queue registry");

        let mut first_error = None;

        for record in records.iter().rev() {
            if !record.lifeline.claim_teardown() {
                continue;
            }

            if let Err(error) = self.shared.backend.destroy_queue(record.queue) {
                tracing::error!(
                    thread_id = ?record.thread_id,
                    queue = ?record.queue,
                    %error,
                    "failed to destroy event queue during shutdown"
                );

                first_error.get_or_insert(error);
            }
        }

        // Our own queue can be dropped right away. If it happens to be borrowed up the stack,
        // it stays poisoned until the thread exits.
        if let Some(queue) = self.local_queue() {
            if queue.try_borrow_mut().is_ok() {
                LOCAL_QUEUES.with_borrow_mut(|queues| queues.remove(&self.shared.id));
            }
        }

        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Whether [`shutdown()`][Self::shutdown] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(atomic::Ordering::Acquire)
    }

    /// Number of threads with a live queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .lock_records()
            .iter()
            .filter(|r| !r.lifeline.is_destroyed())
            .count()
    }

    /// Whether no thread has a live queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn local_queue(&self) -> Option<Rc<RefCell<EventQueue<A>>>> {
        LOCAL_QUEUES
            .with_borrow(|queues| queues.get(&self.shared.id).cloned())
            .and_then(|queue| queue.downcast::<RefCell<EventQueue<A>>>().ok())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(shut_down_error());
        }

        Ok(())
    }
}

impl<A> Clone for EventQueueRegistry<A>
where
    A: Attachment,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _attachment: PhantomData,
        }
    }
}

impl<A> fmt::Debug for EventQueueRegistry<A>
where
    A: Attachment,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(std::any::type_name::<Self>())
            .field("id", &self.shared.id)
            .field("backend", &self.shared.backend)
            .field("config", &self.shared.config)
            .field("records", &self.shared.records)
            .field("shut_down", &self.shared.shut_down)
            .finish_non_exhaustive()
    }
}

impl RegistryShared {
    fn lock_records(&self) -> MutexGuard<'_, Vec<QueueRecord>> {
        self.records.lock().expect(ERR_POISONED_LOCK)
    }
}

fn shut_down_error() -> Error {
    Error::invalid_state("the event queue registry has been shut down")
}

/// The current thread's queue, as handed out by [`EventQueueRegistry::current()`].
///
/// Clones refer to the same queue. The handle cannot leave the thread.
#[derive(Debug)]
pub struct LocalEventQueue<A>
where
    A: Attachment,
{
    inner: Rc<RefCell<EventQueue<A>>>,
}

impl<A> LocalEventQueue<A>
where
    A: Attachment,
{
    /// Borrows the queue for inspection.
    ///
    /// # Panics
    ///
    /// Panics if the queue is currently mutably borrowed.
    #[must_use]
    pub fn borrow(&self) -> Ref<'_, EventQueue<A>> {
        self.inner.borrow()
    }

    /// Borrows the queue for operating on it.
    ///
    /// # Panics
    ///
    /// Panics if the queue is currently borrowed.
    #[must_use]
    pub fn borrow_mut(&self) -> RefMut<'_, EventQueue<A>> {
        self.inner.borrow_mut()
    }
}

impl<A> Clone for LocalEventQueue<A>
where
    A: Attachment,
{
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}
