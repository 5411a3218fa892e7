use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};
use std::time::Duration;

use crate::detained::{DetainBuffer, accepts};
use crate::watchdog::Watchdog;
use crate::{
    Attachment, Candidates, Clock, Completion, Error, Event, EventBackend, EventId,
    EventQueueConfig, EventStatus, QueueHandle, Result, TimeoutCause,
};

const BACKOFF_STEP: Duration = Duration::from_millis(1);

/// A bounded pool of reusable event slots bound to one backend completion queue.
///
/// The queue is the reactor for one thread's asynchronous operations. A caller acquires an
/// event, [attaches][Self::attach] the state of the operation to it, [submits][Self::submit]
/// the operation to the backend and later [polls][Self::poll_completed] for completions, which
/// hands the completed attachments back and returns the events to the free pool.
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use event_queue::{
///     Clock, EventQueue, EventQueueConfig, LoopbackBackend, ResultCode, TaggedAttachment,
/// };
///
/// let backend = Arc::new(LoopbackBackend::new());
/// let config = EventQueueConfig::builder().capacity(4).build();
/// let mut queue = EventQueue::new(backend.clone(), config, Clock::system()).unwrap();
///
/// let event = queue.acquire_event().unwrap().unwrap();
/// queue.attach(event, TaggedAttachment::new("fetch", 1)).unwrap();
/// queue.submit(event, b"encoded request").unwrap();
///
/// backend.complete(queue.backend_queue(), event, ResultCode::SUCCESS);
///
/// let mut completed = Vec::new();
/// let count = queue
///     .poll_completed(&mut completed, "fetch", None, 1, Duration::ZERO)
///     .unwrap();
///
/// assert_eq!(count, 1);
/// assert_eq!(completed[0].result(), Some(ResultCode::SUCCESS));
/// assert_eq!(queue.acquired(), 0);
/// ```
///
/// # Thread safety
///
/// The queue is single-threaded. It performs no internal locking and cannot be moved to or
/// shared with other threads. Use an [`EventQueueRegistry`][crate::EventQueueRegistry] to give
/// every thread its own queue.
///
/// # Resource management
///
/// Dropping the queue releases every attachment still bound to an event or held in the detain
/// buffer, without delivering it, and destroys the backend queue. Use [`destroy()`][Self::destroy]
/// to observe a backend failure during destruction.
#[derive(Debug)]
pub struct EventQueue<A>
where
    A: Attachment,
{
    backend: Arc<dyn EventBackend>,
    queue: QueueHandle,
    clock: Clock,
    max_backoff: Duration,

    events: Box<[Event<A>]>,

    /// Number of events currently `InUse` or `Aborted`.
    acquired: usize,

    /// Where the next scan for a free event starts.
    next_scan: usize,

    detained: DetainBuffer<A>,
    watchdog: Watchdog,

    lifeline: Arc<Lifeline>,

    _single_threaded: PhantomData<*const ()>,
}

impl<A> EventQueue<A>
where
    A: Attachment,
{
    /// Creates a queue with its own backend completion queue, owned by the current thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the backend cannot create the completion queue.
    pub fn new(
        backend: Arc<dyn EventBackend>,
        config: EventQueueConfig,
        clock: Clock,
    ) -> Result<Self> {
        Self::with_lifeline(backend, config, clock, Arc::new(Lifeline::new()))
    }

    pub(crate) fn with_lifeline(
        backend: Arc<dyn EventBackend>,
        config: EventQueueConfig,
        clock: Clock,
        lifeline: Arc<Lifeline>,
    ) -> Result<Self> {
        let queue = backend.create_queue(config.capacity())?;

        let events = (0..config.capacity())
            .map(|index| Event::new(EventId::new(index)))
            .collect();

        let now = clock.now();

        tracing::debug!(?queue, capacity = config.capacity(), "event queue created");

        Ok(Self {
            backend,
            queue,
            max_backoff: config.max_backoff(),
            events,
            acquired: 0,
            next_scan: 0,
            detained: DetainBuffer::new(),
            watchdog: Watchdog::new(
                config.timeout_low_watermark(),
                config.timeout_high_watermark(),
                config.no_progress_ceiling(),
                now,
            ),
            clock,
            lifeline,
            _single_threaded: PhantomData,
        })
    }

    /// Number of events in the queue.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    /// Number of events currently acquired, including those with a pending abort.
    #[must_use]
    pub fn acquired(&self) -> usize {
        self.acquired
    }

    /// The backend completion queue this queue is bound to.
    #[must_use]
    pub fn backend_queue(&self) -> QueueHandle {
        self.queue
    }

    /// Number of completions of `kind` waiting in the detain buffer.
    #[must_use]
    pub fn detained_len(&self, kind: A::Kind) -> usize {
        self.detained.len(kind)
    }

    /// Number of completions of all kinds waiting in the detain buffer.
    #[must_use]
    pub fn detained_total(&self) -> usize {
        self.detained.total_len()
    }

    /// Timeouts raised in a row without an intervening completion.
    #[must_use]
    pub fn consecutive_timeouts(&self) -> u32 {
        self.watchdog.consecutive_timeouts()
    }

    /// The status of an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the event is beyond the capacity of the queue.
    pub fn status(&self, event: EventId) -> Result<EventStatus> {
        self.events
            .get(event.as_usize())
            .map(|e| e.status)
            .ok_or_else(|| self.out_of_range(event))
    }

    /// Acquires a free event without blocking.
    ///
    /// Returns `None` if every event is in use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the queue has been destroyed.
    pub fn acquire_event(&mut self) -> Result<Option<EventId>> {
        self.ensure_usable()?;

        Ok(self.try_acquire())
    }

    /// Acquires a free event, polling for completions to free one up if necessary.
    ///
    /// Completions harvested while waiting are delivered to `out` if they are of `kind` and
    /// accepted by `candidates`; all others are detained.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if no event became free within `max_wait`, or earlier if the
    /// progress watchdog determines that the queue has stopped making progress.
    ///
    /// Returns [`Error::Backend`] if polling the backend fails.
    pub fn acquire_event_blocking(
        &mut self,
        max_wait: Duration,
        kind: A::Kind,
        candidates: Candidates<'_, A>,
        out: &mut Vec<A>,
    ) -> Result<EventId> {
        self.ensure_usable()?;

        if let Some(event) = self.try_acquire() {
            return Ok(event);
        }

        let start = self.clock.now();
        self.watchdog.check(start, self.acquired, self.capacity())?;

        let mut backoff = Duration::ZERO;

        loop {
            self.poll_completed(out, kind, candidates, usize::MAX, Duration::ZERO)?;

            if let Some(event) = self.try_acquire() {
                return Ok(event);
            }

            let elapsed = self.clock.now().saturating_duration_since(start);

            let Some(remaining) = max_wait.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
                return Err(self.deadline_exceeded(elapsed));
            };

            self.clock.sleep(backoff.min(remaining));
            backoff = backoff.saturating_add(BACKOFF_STEP).min(self.max_backoff);
        }
    }

    /// Binds an attachment to an acquired event.
    ///
    /// A sticky attachment left bound from a previous use of the slot is released first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the event is not in use.
    pub fn attach(&mut self, event: EventId, mut attachment: A) -> Result<()> {
        self.ensure_usable()?;
        let slot = self.in_use_event_mut(event, "attach to")?;

        attachment.bind(event);

        if let Some(mut previous) = slot.attachment.replace(attachment) {
            previous.release();
        }

        Ok(())
    }

    /// Prepares the sticky attachment still bound to an acquired event for another operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the event is not in use or has no attachment.
    pub fn reuse_attachment(&mut self, event: EventId) -> Result<()> {
        self.ensure_usable()?;
        let slot = self.in_use_event_mut(event, "reuse the attachment of")?;

        let Some(attachment) = slot.attachment.as_mut() else {
            return Err(Error::invalid_state(format!(
                "event {event} has no attachment to reuse"
            )));
        };

        attachment.reuse();
        attachment.bind(event);

        Ok(())
    }

    /// Submits the operation described by `descriptor` to the backend under `event`.
    ///
    /// If submission fails the event stays in use; return it with
    /// [`return_event()`][Self::return_event].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the event is not in use.
    ///
    /// Returns [`Error::Backend`] if the backend rejects the submission.
    pub fn submit(&mut self, event: EventId, descriptor: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        self.in_use_event_mut(event, "submit with")?;

        self.backend.submit(self.queue, event, descriptor)?;

        Ok(())
    }

    /// Returns an event that will not be polled for, for example because its operation was
    /// never submitted.
    ///
    /// The detached attachment, if any, is handed back to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the event is not in use.
    pub fn return_event(&mut self, event: EventId) -> Result<Option<A>> {
        self.ensure_usable()?;
        let slot = self.in_use_event_mut(event, "return")?;

        let attachment = slot.recycle();
        self.acquired = self.acquired.saturating_sub(1);

        Ok(attachment)
    }

    /// Requests cancellation of the operation submitted with `event`.
    ///
    /// Returns `false` without doing anything if the event is not in use. Otherwise returns
    /// whether the backend found an in-flight operation to cancel. If it did not, the operation
    /// has already completed and its completion will be delivered by the next poll as usual;
    /// this is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the event is beyond the capacity of the queue.
    ///
    /// Returns [`Error::Backend`] if the backend fails to process the request. The event is
    /// then left in use.
    pub fn abort_event(&mut self, event: EventId) -> Result<bool> {
        self.ensure_usable()?;

        let capacity = self.capacity();
        let Some(slot) = self.events.get_mut(event.as_usize()) else {
            return Err(out_of_range_error(event, capacity));
        };

        if slot.status != EventStatus::InUse {
            return Ok(false);
        }

        slot.status = EventStatus::Aborted;

        match self.backend.abort(self.queue, event) {
            Ok(true) => Ok(true),
            Ok(false) => {
                slot.status = EventStatus::InUse;
                Ok(false)
            }
            Err(error) => {
                slot.status = EventStatus::InUse;
                Err(error.into())
            }
        }
    }

    /// Marks the attachment bound to an acquired event as discarded, so that it is released
    /// instead of delivered when the operation completes.
    ///
    /// Returns whether an attachment was bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the event is beyond the capacity of the queue.
    pub fn discard(&mut self, event: EventId) -> Result<bool> {
        self.ensure_usable()?;

        let capacity = self.capacity();
        let slot = self
            .events
            .get_mut(event.as_usize())
            .ok_or_else(|| out_of_range_error(event, capacity))?;

        if slot.status == EventStatus::Free {
            return Ok(false);
        }

        Ok(slot
            .attachment
            .as_mut()
            .map(Attachment::discard)
            .is_some())
    }

    /// Collects completed operations of `kind`, up to `expected` of them, into `out`.
    ///
    /// Completions detained by earlier calls are delivered first, oldest first, without
    /// contacting the backend if they satisfy the request. Otherwise the backend is asked for
    /// completions, waiting up to `timeout`. Completions the caller did not ask for (beyond
    /// `expected`, of another kind or rejected by `candidates`) are detained for a later call.
    /// Completions of aborted events are never delivered and do not count.
    ///
    /// Returns the number of attachments appended to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if polling the backend fails.
    ///
    /// Returns [`Error::InvalidState`] if the backend reports a completion for an event that
    /// is not in use. All valid completions from the same batch are still processed and any
    /// delivered attachments remain in `out`.
    pub fn poll_completed(
        &mut self,
        out: &mut Vec<A>,
        kind: A::Kind,
        candidates: Candidates<'_, A>,
        expected: usize,
        timeout: Duration,
    ) -> Result<usize> {
        self.ensure_usable()?;

        let mut delivered = self.detained.drain_into(kind, candidates, expected, out);

        if delivered >= expected {
            return Ok(delivered);
        }

        while self.acquired > 0 {
            let completions = self.backend.poll(self.queue, self.acquired, timeout)?;

            if completions.is_empty() {
                break;
            }

            let round = self.process_completions(
                completions,
                kind,
                candidates,
                expected,
                &mut delivered,
                out,
            );

            if round.completed > 0 {
                self.watchdog.record_progress(self.clock.now());
            }

            if let Some(problem) = round.problem {
                return Err(problem);
            }

            if round.completed > 0 {
                break;
            }

            // Only aborted operations came back. That is not progress but not failure either,
            // so keep going while there is still something outstanding.
        }

        Ok(delivered)
    }

    /// Polls until no event is outstanding, delivering completions of `kind` to `out`.
    ///
    /// Aborted operations count as finished for this purpose even though they are not delivered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if events are still outstanding after `max_wait`, or earlier
    /// if the progress watchdog determines that the queue has stopped making progress.
    ///
    /// Returns [`Error::Backend`] if polling the backend fails.
    pub fn wait_for_completion(
        &mut self,
        max_wait: Duration,
        kind: A::Kind,
        out: &mut Vec<A>,
    ) -> Result<()> {
        self.ensure_usable()?;

        let start = self.clock.now();

        if self.acquired > 0 {
            self.watchdog.check(start, self.acquired, self.capacity())?;
        }

        let mut backoff = Duration::ZERO;

        loop {
            self.poll_completed(out, kind, None, usize::MAX, Duration::ZERO)?;

            if self.acquired == 0 {
                return Ok(());
            }

            let elapsed = self.clock.now().saturating_duration_since(start);

            let Some(remaining) = max_wait.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
                return Err(self.deadline_exceeded(elapsed));
            };

            self.clock.sleep(backoff.min(remaining));
            backoff = backoff.saturating_add(BACKOFF_STEP).min(self.max_backoff);
        }
    }

    /// Polls until at least one completion of `kind` accepted by `candidates` has been
    /// delivered to `out`, or until no event is outstanding.
    ///
    /// Detained completions are delivered first. Completions of other kinds are detained and
    /// do not end the wait.
    ///
    /// Returns the number of attachments appended to `out`, which is zero only if nothing
    /// was outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if nothing was delivered within `max_wait`, or earlier if
    /// the progress watchdog determines that the queue has stopped making progress.
    ///
    /// Returns [`Error::Backend`] if polling the backend fails.
    pub fn wait_for_any(
        &mut self,
        max_wait: Duration,
        kind: A::Kind,
        candidates: Candidates<'_, A>,
        out: &mut Vec<A>,
    ) -> Result<usize> {
        self.ensure_usable()?;

        let start = self.clock.now();

        let delivered = self.poll_completed(out, kind, candidates, usize::MAX, Duration::ZERO)?;

        if delivered > 0 || self.acquired == 0 {
            return Ok(delivered);
        }

        self.watchdog.check(start, self.acquired, self.capacity())?;

        let mut backoff = Duration::ZERO;

        loop {
            let elapsed = self.clock.now().saturating_duration_since(start);

            let Some(remaining) = max_wait.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
                return Err(self.deadline_exceeded(elapsed));
            };

            self.clock.sleep(backoff.min(remaining));
            backoff = backoff.saturating_add(BACKOFF_STEP).min(self.max_backoff);

            let delivered = self.poll_completed(out, kind, candidates, usize::MAX, Duration::ZERO)?;

            if delivered > 0 || self.acquired == 0 {
                return Ok(delivered);
            }
        }
    }

    /// Destroys the queue, releasing all attachments it still holds without delivering them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the backend fails to destroy the completion queue. The
    /// attachments are released regardless.
    pub fn destroy(mut self) -> Result<()> {
        self.destroy_in_place()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.lifeline.is_destroyed()
    }

    pub(crate) fn destroy_in_place(&mut self) -> Result<()> {
        let released = self.release_attachments();

        if !self.lifeline.claim_teardown() {
            return Ok(());
        }

        tracing::debug!(queue = ?self.queue, released, "destroying event queue");

        self.backend.destroy_queue(self.queue)?;

        Ok(())
    }

    fn release_attachments(&mut self) -> usize {
        let mut released: usize = 0;

        for event in &mut self.events {
            if let Some(mut attachment) = event.attachment.take() {
                attachment.release();
                released = released.saturating_add(1);
            }
        }

        released.saturating_add(self.detained.release_all())
    }

    fn try_acquire(&mut self) -> Option<EventId> {
        let capacity = self.events.len();

        if self.acquired >= capacity {
            return None;
        }

        for offset in 0..capacity {
            let index = self.next_scan.wrapping_add(offset) % capacity;

            let event = self.events.get_mut(index)?;

            if event.status == EventStatus::Free {
                event.status = EventStatus::InUse;
                self.next_scan = index.wrapping_add(1) % capacity;
                self.acquired = self.acquired.saturating_add(1);

                return Some(event.id);
            }
        }

        None
    }

    fn process_completions(
        &mut self,
        completions: Vec<Completion>,
        kind: A::Kind,
        candidates: Candidates<'_, A>,
        expected: usize,
        delivered: &mut usize,
        out: &mut Vec<A>,
    ) -> Round {
        let capacity = self.capacity();
        let mut round = Round::default();

        for Completion { event, result } in completions {
            let Some(slot) = self.events.get_mut(event.as_usize()) else {
                tracing::error!(
                    queue = ?self.queue,
                    %event,
                    "completion for event beyond capacity"
                );
                round.problem.get_or_insert(out_of_range_error(event, capacity));
                continue;
            };

            match slot.status {
                EventStatus::Free => {
                    tracing::error!(
                        queue = ?self.queue,
                        %event,
                        "completion for event that is not in use"
                    );
                    round.problem.get_or_insert(Error::invalid_state(format!(
                        "backend reported a completion for event {event} which is not in use"
                    )));
                }
                EventStatus::Aborted => {
                    slot.status = EventStatus::Free;

                    // The caller gave up on the result. Whatever was attached is released
                    // here, unless it is sticky and therefore owned by the slot.
                    let sticky = slot
                        .attachment
                        .as_ref()
                        .is_some_and(Attachment::sticky_to_event);

                    if !sticky {
                        if let Some(mut attachment) = slot.attachment.take() {
                            attachment.release();
                        }
                    }

                    self.acquired = self.acquired.saturating_sub(1);
                }
                EventStatus::InUse => {
                    if let Some(attachment) = slot.attachment.as_mut() {
                        attachment.on_ready(result);
                    }

                    let attachment = slot.recycle();
                    self.acquired = self.acquired.saturating_sub(1);
                    round.completed = round.completed.saturating_add(1);

                    let Some(mut attachment) = attachment else {
                        continue;
                    };

                    if attachment.is_discarded() {
                        attachment.release();
                    } else if *delivered < expected
                        && attachment.kind() == kind
                        && accepts(candidates, &attachment)
                    {
                        out.push(attachment);
                        *delivered = delivered.saturating_add(1);
                    } else {
                        self.detained.detain(attachment);
                    }
                }
            }
        }

        round
    }

    fn deadline_exceeded(&mut self, elapsed: Duration) -> Error {
        let consecutive_timeouts = self.watchdog.record_timeout();

        Error::TimedOut {
            cause: TimeoutCause::Deadline,
            elapsed,
            outstanding: self.acquired,
            capacity: self.capacity(),
            consecutive_timeouts,
        }
    }

    fn in_use_event_mut(&mut self, event: EventId, action: &str) -> Result<&mut Event<A>> {
        let capacity = self.capacity();
        let slot = self
            .events
            .get_mut(event.as_usize())
            .ok_or_else(|| out_of_range_error(event, capacity))?;

        if slot.status != EventStatus::InUse {
            return Err(Error::invalid_state(format!(
                "cannot {action} event {event} in status {:?}",
                slot.status
            )));
        }

        Ok(slot)
    }

    fn out_of_range(&self, event: EventId) -> Error {
        out_of_range_error(event, self.capacity())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.lifeline.is_destroyed() {
            return Err(Error::invalid_state(format!(
                "event queue {:?} has been destroyed",
                self.queue
            )));
        }

        Ok(())
    }
}

impl<A> Drop for EventQueue<A>
where
    A: Attachment,
{
    fn drop(&mut self) {
        if let Err(error) = self.destroy_in_place() {
            tracing::error!(queue = ?self.queue, %error, "failed to destroy event queue");
        }
    }
}

fn out_of_range_error(event: EventId, capacity: usize) -> Error {
    Error::invalid_state(format!(
        "event {event} is beyond the queue capacity of {capacity}"
    ))
}

#[derive(Debug, Default)]
struct Round {
    completed: usize,
    problem: Option<Error>,
}

/// Shared between a queue and the registry that created it, so the registry can destroy the
/// backend queue from any thread while the queue itself stays on its owning thread.
/// Whoever flips the flag first performs the backend teardown.
#[derive(Debug, Default)]
pub(crate) struct Lifeline {
    destroyed: AtomicBool,
}

impl Lifeline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(atomic::Ordering::Acquire)
    }

    /// Returns `true` exactly once, to the caller that should tear down the backend queue.
    pub(crate) fn claim_teardown(&self) -> bool {
        !self.destroyed.swap(true, atomic::Ordering::AcqRel)
    }
}
