//! In-process backend whose operations complete only when told to.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use foldhash::{HashMap, HashMapExt};

use crate::{
    BackendError, Completion, ERR_POISONED_LOCK, EventBackend, EventId, QueueHandle, ResultCode,
};

/// The queue handle does not name a live queue.
const CODE_NO_SUCH_QUEUE: i32 = -2;

/// The event is beyond the capacity the queue was created with.
const CODE_OUT_OF_RANGE: i32 = -34;

/// An operation is already in flight under the event.
const CODE_BUSY: i32 = -16;

/// An [`EventBackend`] that keeps everything in memory and completes operations on command.
///
/// Submitted operations stay in flight until [`complete()`][Self::complete] is called for
/// them, from any thread. Aborting an in-flight operation completes it immediately with
/// [`ResultCode::CANCELED`]. Completions are reported in the order they happened.
///
/// This makes the backend suitable for examples, benchmarks and tests that need precise
/// control over when and in which order operations finish.
#[derive(Debug)]
pub struct LoopbackBackend {
    state: Mutex<LoopbackState>,
    completions_available: Condvar,
}

#[derive(Debug)]
struct LoopbackState {
    next_queue: u64,
    queues: HashMap<QueueHandle, LoopbackQueue>,
}

#[derive(Debug)]
struct LoopbackQueue {
    capacity: u16,

    /// Operations in submission order, with their descriptors.
    in_flight: Vec<(EventId, Vec<u8>)>,

    completed: VecDeque<Completion>,
}

impl LoopbackBackend {
    /// Creates a backend with no queues.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                next_queue: 1,
                queues: HashMap::new(),
            }),
            completions_available: Condvar::new(),
        }
    }

    /// Completes the in-flight operation submitted with `event` on `queue`.
    ///
    /// Returns `false` if no such operation is in flight.
    pub fn complete(&self, queue: QueueHandle, event: EventId, result: ResultCode) -> bool {
        let mut state = self.lock();

        let Some(target) = state.queues.get_mut(&queue) else {
            return false;
        };

        let Some(position) = target.in_flight.iter().position(|(e, _)| *e == event) else {
            return false;
        };

        target.in_flight.remove(position);
        target.completed.push_back(Completion::new(event, result));

        drop(state);
        self.completions_available.notify_all();

        true
    }

    /// Completes every in-flight operation on `queue` in submission order.
    ///
    /// Returns the number of operations completed.
    pub fn complete_all(&self, queue: QueueHandle, result: ResultCode) -> usize {
        let mut state = self.lock();

        let Some(target) = state.queues.get_mut(&queue) else {
            return 0;
        };

        let count = target.in_flight.len();

        for (event, _) in target.in_flight.drain(..) {
            target.completed.push_back(Completion::new(event, result));
        }

        drop(state);
        self.completions_available.notify_all();

        count
    }

    /// The events with operations in flight on `queue`, in submission order.
    #[must_use]
    pub fn in_flight(&self, queue: QueueHandle) -> Vec<EventId> {
        self.lock()
            .queues
            .get(&queue)
            .map(|q| q.in_flight.iter().map(|(event, _)| *event).collect())
            .unwrap_or_default()
    }

    /// The descriptor submitted with the in-flight operation of `event` on `queue`.
    #[must_use]
    pub fn descriptor(&self, queue: QueueHandle, event: EventId) -> Option<Vec<u8>> {
        self.lock().queues.get(&queue).and_then(|q| {
            q.in_flight
                .iter()
                .find(|(e, _)| *e == event)
                .map(|(_, descriptor)| descriptor.clone())
        })
    }

    /// Whether `queue` exists and has not been destroyed.
    #[must_use]
    pub fn has_queue(&self, queue: QueueHandle) -> bool {
        self.lock().queues.contains_key(&queue)
    }

    /// The queues that exist, in creation order.
    #[must_use]
    pub fn queues(&self) -> Vec<QueueHandle> {
        let mut queues: Vec<_> = self.lock().queues.keys().copied().collect();
        queues.sort_unstable_by_key(|queue| queue.raw());
        queues
    }

    /// Number of queues that exist.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBackend for LoopbackBackend {
    fn create_queue(&self, capacity: u16) -> Result<QueueHandle, BackendError> {
        let mut state = self.lock();

        let handle = QueueHandle::new(state.next_queue);
        state.next_queue = state.next_queue.wrapping_add(1);

        state.queues.insert(
            handle,
            LoopbackQueue {
                capacity,
                in_flight: Vec::new(),
                completed: VecDeque::new(),
            },
        );

        Ok(handle)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<(), BackendError> {
        let removed = self.lock().queues.remove(&queue);

        // Wake up anyone polling the queue so they can observe that it is gone.
        self.completions_available.notify_all();

        removed
            .map(|_| ())
            .ok_or(BackendError::new("destroy_queue", CODE_NO_SUCH_QUEUE))
    }

    fn submit(
        &self,
        queue: QueueHandle,
        event: EventId,
        descriptor: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.lock();

        let target = state
            .queues
            .get_mut(&queue)
            .ok_or(BackendError::new("submit", CODE_NO_SUCH_QUEUE))?;

        if event.index() >= target.capacity {
            return Err(BackendError::new("submit", CODE_OUT_OF_RANGE));
        }

        if target.in_flight.iter().any(|(e, _)| *e == event) {
            return Err(BackendError::new("submit", CODE_BUSY));
        }

        target.in_flight.push((event, descriptor.to_vec()));

        Ok(())
    }

    fn abort(&self, queue: QueueHandle, event: EventId) -> Result<bool, BackendError> {
        let mut state = self.lock();

        let target = state
            .queues
            .get_mut(&queue)
            .ok_or(BackendError::new("abort", CODE_NO_SUCH_QUEUE))?;

        let Some(position) = target.in_flight.iter().position(|(e, _)| *e == event) else {
            return Ok(false);
        };

        target.in_flight.remove(position);
        target
            .completed
            .push_back(Completion::new(event, ResultCode::CANCELED));

        drop(state);
        self.completions_available.notify_all();

        Ok(true)
    }

    fn poll(
        &self,
        queue: QueueHandle,
        max_completions: usize,
        timeout: Duration,
    ) -> Result<Vec<Completion>, BackendError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();

        loop {
            let target = state
                .queues
                .get_mut(&queue)
                .ok_or(BackendError::new("poll", CODE_NO_SUCH_QUEUE))?;

            if !target.completed.is_empty() {
                let count = max_completions.min(target.completed.len());
                return Ok(target.completed.drain(..count).collect());
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };

            if remaining.is_zero() {
                return Ok(Vec::new());
            }

            state = self
                .completions_available
                .wait_timeout(state, remaining)
                .expect(ERR_POISONED_LOCK)
                .0;
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(LoopbackBackend: Send, Sync);

    const E0: EventId = EventId::new(0);
    const E1: EventId = EventId::new(1);

    #[test]
    fn completes_in_completion_order() {
        let backend = LoopbackBackend::new();
        let queue = backend.create_queue(4).unwrap();

        backend.submit(queue, E0, b"a").unwrap();
        backend.submit(queue, E1, b"b").unwrap();
        assert_eq!(backend.in_flight(queue), [E0, E1]);
        assert_eq!(backend.descriptor(queue, E1).unwrap(), b"b");

        assert!(backend.complete(queue, E1, ResultCode::SUCCESS));
        assert!(backend.complete(queue, E0, ResultCode::new(-1)));
        assert!(!backend.complete(queue, E0, ResultCode::SUCCESS));

        let completions = backend.poll(queue, 10, Duration::ZERO).unwrap();

        assert_eq!(
            completions,
            [
                Completion::new(E1, ResultCode::SUCCESS),
                Completion::new(E0, ResultCode::new(-1)),
            ]
        );
    }

    #[test]
    fn poll_respects_max_completions() {
        let backend = LoopbackBackend::new();
        let queue = backend.create_queue(4).unwrap();
        backend.submit(queue, E0, &[]).unwrap();
        backend.submit(queue, E1, &[]).unwrap();
        assert_eq!(backend.complete_all(queue, ResultCode::SUCCESS), 2);

        assert_eq!(backend.poll(queue, 1, Duration::ZERO).unwrap().len(), 1);
        assert_eq!(backend.poll(queue, 1, Duration::ZERO).unwrap().len(), 1);
        assert!(backend.poll(queue, 1, Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn abort_in_flight_completes_as_canceled() {
        let backend = LoopbackBackend::new();
        let queue = backend.create_queue(1).unwrap();
        backend.submit(queue, E0, &[]).unwrap();

        assert!(backend.abort(queue, E0).unwrap());
        assert!(!backend.abort(queue, E0).unwrap());

        assert_eq!(
            backend.poll(queue, 1, Duration::ZERO).unwrap(),
            [Completion::new(E0, ResultCode::CANCELED)]
        );
    }

    #[test]
    fn rejects_busy_and_out_of_range_events() {
        let backend = LoopbackBackend::new();
        let queue = backend.create_queue(1).unwrap();
        backend.submit(queue, E0, &[]).unwrap();

        assert_eq!(backend.submit(queue, E0, &[]).unwrap_err().code(), CODE_BUSY);
        assert_eq!(
            backend.submit(queue, E1, &[]).unwrap_err().code(),
            CODE_OUT_OF_RANGE
        );
    }

    #[test]
    fn queues_are_listed_in_creation_order() {
        let backend = LoopbackBackend::new();
        let first = backend.create_queue(1).unwrap();
        let second = backend.create_queue(1).unwrap();
        let third = backend.create_queue(1).unwrap();
        backend.destroy_queue(second).unwrap();

        assert_eq!(backend.queues(), [first, third]);
    }

    #[test]
    fn unknown_queue_is_an_error() {
        let backend = LoopbackBackend::new();
        let queue = backend.create_queue(1).unwrap();
        backend.destroy_queue(queue).unwrap();

        assert!(!backend.has_queue(queue));
        assert_eq!(backend.queue_count(), 0);
        assert!(backend.destroy_queue(queue).is_err());
        assert!(backend.submit(queue, E0, &[]).is_err());
        assert!(backend.poll(queue, 1, Duration::ZERO).is_err());
    }

    #[test]
    fn poll_wakes_up_on_completion_from_other_thread() {
        testing::with_watchdog(|| {
            let backend = Arc::new(LoopbackBackend::new());
            let queue = backend.create_queue(1).unwrap();
            backend.submit(queue, E0, &[]).unwrap();

            let completer = thread::spawn({
                let backend = Arc::clone(&backend);
                move || {
                    thread::sleep(Duration::from_millis(20));
                    backend.complete(queue, E0, ResultCode::SUCCESS);
                }
            });

            let completions = backend.poll(queue, 1, Duration::from_secs(5)).unwrap();
            assert_eq!(completions.len(), 1);

            completer.join().unwrap();
        });
    }

    #[test]
    fn poll_with_timeout_returns_empty_when_nothing_completes() {
        let backend = LoopbackBackend::new();
        let queue = backend.create_queue(1).unwrap();

        let start = Instant::now();
        let completions = backend.poll(queue, 1, Duration::from_millis(10)).unwrap();

        assert!(completions.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
