use std::fmt::{self, Display};

use crate::Attachment;

/// Identifies one event slot of an [`EventQueue`][crate::EventQueue].
///
/// The identity is the slot's index and stays stable for the whole life of the queue. It is
/// what the caller passes to the backend when submitting an operation and what the backend
/// reports back on completion.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EventId(u16);

impl EventId {
    /// Wraps a raw slot index.
    #[must_use]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// The slot index.
    #[must_use]
    pub const fn index(self) -> u16 {
        self.0
    }

    pub(crate) fn as_usize(self) -> usize {
        usize::from(self.0)
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an event slot.
///
/// Slots move `Free -> InUse -> Free`, or `Free -> InUse -> Aborted -> Free` when the caller
/// abandons the operation before the backend reports it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum EventStatus {
    /// Available for acquisition.
    Free,

    /// Acquired by a caller, possibly with an operation in flight.
    InUse,

    /// The caller requested an abort; the slot is waiting for the backend to report
    /// the canceled operation.
    Aborted,
}

/// One reusable slot. Created once with the queue and recycled forever after.
#[derive(Debug)]
pub(crate) struct Event<A>
where
    A: Attachment,
{
    pub(crate) id: EventId,
    pub(crate) status: EventStatus,
    pub(crate) attachment: Option<A>,
}

impl<A> Event<A>
where
    A: Attachment,
{
    pub(crate) fn new(id: EventId) -> Self {
        Self {
            id,
            status: EventStatus::Free,
            attachment: None,
        }
    }

    /// Returns the slot to the free pool.
    ///
    /// A non-sticky attachment is detached and handed back so that stale results can never
    /// leak into the next user of the slot. A sticky attachment stays bound; the caller gets
    /// a clone of the handle.
    pub(crate) fn recycle(&mut self) -> Option<A> {
        self.status = EventStatus::Free;

        match self.attachment.as_ref() {
            Some(attachment) if attachment.sticky_to_event() => Some(attachment.clone()),
            _ => self.attachment.take(),
        }
    }
}
