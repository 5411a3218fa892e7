use std::cell::Cell;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use crate::{EventId, ResultCode};

/// The state of one asynchronous operation, carried by an event while the operation is in flight.
///
/// An attachment is bound to at most one event at a time. The reactor calls
/// [`on_ready()`][Self::on_ready] exactly once per completed operation, immediately before the
/// event returns to the free pool, and never for an operation that was aborted.
///
/// Attachments are expected to be cheap handles to shared operation state (typically an `Rc`
/// around the request buffers and result fields). Cloning must produce another handle to the
/// same state, because a [sticky][Self::sticky_to_event] attachment stays bound to its event
/// while the caller receives a clone, and because both the caller and the reactor may try to
/// [`release()`][Self::release] the same operation.
///
/// The set of operation kinds is usually closed, so implementations tend to be an enum over
/// the known operations or a struct with a kind tag, sharing this trait as the common surface.
pub trait Attachment: Clone + Debug + 'static {
    /// Groups attachments for delivery. Completions are delivered to callers asking for the
    /// matching kind; completions of other kinds are detained until someone asks for them.
    type Kind: Copy + Debug + Eq + Hash + 'static;

    /// The kind of this attachment.
    fn kind(&self) -> Self::Kind;

    /// Records the event this attachment has been bound to.
    fn bind(&mut self, event: EventId);

    /// Clears the results of a previous operation so the same attachment can describe a new one.
    fn reuse(&mut self);

    /// Receives the backend's verdict on the operation. Called exactly once per completion.
    fn on_ready(&mut self, result: ResultCode);

    /// Whether the attachment stays bound to its event after the event returns to the free pool.
    fn sticky_to_event(&self) -> bool {
        false
    }

    /// Marks the attachment as no longer wanted. A discarded attachment that completes is
    /// released instead of being delivered.
    fn discard(&mut self);

    /// Whether [`discard()`][Self::discard] has been called.
    fn is_discarded(&self) -> bool;

    /// Releases the resources held by the operation.
    ///
    /// Must be idempotent: the aborting caller and the reactor's own teardown path may both
    /// end up releasing the same operation.
    fn release(&mut self);
}

/// A minimal attachment that carries a kind, a caller-chosen tag and the completion result.
///
/// Useful for operations whose payload lives elsewhere and for exercising a queue.
///
/// ```
/// use event_queue::{Attachment, EventId, ResultCode, TaggedAttachment};
///
/// let mut attachment = TaggedAttachment::new("fetch", 7);
/// attachment.bind(EventId::new(0));
/// attachment.on_ready(ResultCode::SUCCESS);
///
/// assert_eq!(attachment.result(), Some(ResultCode::SUCCESS));
/// assert_eq!(attachment.event(), Some(EventId::new(0)));
/// ```
#[derive(Clone, Debug)]
pub struct TaggedAttachment<K>
where
    K: Copy + Debug + Eq + Hash + 'static,
{
    state: Rc<TaggedState<K>>,
}

#[derive(Debug)]
struct TaggedState<K> {
    kind: K,
    tag: u64,
    sticky: bool,

    event: Cell<Option<EventId>>,
    result: Cell<Option<ResultCode>>,
    ready_count: Cell<u32>,
    discarded: Cell<bool>,
    released: Cell<bool>,
}

impl<K> TaggedAttachment<K>
where
    K: Copy + Debug + Eq + Hash + 'static,
{
    /// Creates an attachment that detaches from its event on completion.
    #[must_use]
    pub fn new(kind: K, tag: u64) -> Self {
        Self::with_stickiness(kind, tag, false)
    }

    /// Creates an attachment that stays bound to its event after completion.
    #[must_use]
    pub fn sticky(kind: K, tag: u64) -> Self {
        Self::with_stickiness(kind, tag, true)
    }

    fn with_stickiness(kind: K, tag: u64, sticky: bool) -> Self {
        Self {
            state: Rc::new(TaggedState {
                kind,
                tag,
                sticky,
                event: Cell::new(None),
                result: Cell::new(None),
                ready_count: Cell::new(0),
                discarded: Cell::new(false),
                released: Cell::new(false),
            }),
        }
    }

    /// The caller-chosen tag.
    #[must_use]
    pub fn tag(&self) -> u64 {
        self.state.tag
    }

    /// The event this attachment was most recently bound to.
    #[must_use]
    pub fn event(&self) -> Option<EventId> {
        self.state.event.get()
    }

    /// The result of the most recent completion, if any.
    #[must_use]
    pub fn result(&self) -> Option<ResultCode> {
        self.state.result.get()
    }

    /// How many times the reactor has reported a completion for this attachment.
    #[must_use]
    pub fn ready_count(&self) -> u32 {
        self.state.ready_count.get()
    }

    /// Whether the attachment has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.state.released.get()
    }

    /// Whether `other` is a handle to the same operation state.
    #[must_use]
    pub fn same_operation(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl<K> Attachment for TaggedAttachment<K>
where
    K: Copy + Debug + Eq + Hash + 'static,
{
    type Kind = K;

    fn kind(&self) -> K {
        self.state.kind
    }

    fn bind(&mut self, event: EventId) {
        self.state.event.set(Some(event));
    }

    fn reuse(&mut self) {
        self.state.result.set(None);
        self.state.discarded.set(false);
    }

    fn on_ready(&mut self, result: ResultCode) {
        self.state.result.set(Some(result));
        self.state
            .ready_count
            .set(self.state.ready_count.get().saturating_add(1));
    }

    fn sticky_to_event(&self) -> bool {
        self.state.sticky
    }

    fn discard(&mut self) {
        self.state.discarded.set(true);
    }

    fn is_discarded(&self) -> bool {
        self.state.discarded.get()
    }

    fn release(&mut self) {
        self.state.released.set(true);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let mut original = TaggedAttachment::new(0_u8, 1);
        let clone = original.clone();

        original.on_ready(ResultCode::new(-3));
        original.discard();

        assert_eq!(clone.result(), Some(ResultCode::new(-3)));
        assert_eq!(clone.ready_count(), 1);
        assert!(clone.is_discarded());
        assert!(clone.same_operation(&original));
    }

    #[test]
    fn reuse_clears_previous_result() {
        let mut attachment = TaggedAttachment::new(0_u8, 1);
        attachment.on_ready(ResultCode::SUCCESS);
        attachment.discard();

        attachment.reuse();

        assert_eq!(attachment.result(), None);
        assert!(!attachment.is_discarded());
    }

    #[test]
    fn release_is_idempotent() {
        let mut attachment = TaggedAttachment::new(0_u8, 1);
        let mut other_owner = attachment.clone();

        attachment.release();
        other_owner.release();

        assert!(attachment.is_released());
    }

    #[test]
    fn stickiness_is_chosen_at_construction() {
        assert!(!TaggedAttachment::new(0_u8, 1).sticky_to_event());
        assert!(TaggedAttachment::sticky(0_u8, 1).sticky_to_event());
    }
}
