use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt::{self, Display};
use std::rc::Rc;

use event_queue::{Attachment, EventId, ResultCode};

/// The kinds of asynchronous operations a client submits to its event queue.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum IoKind {
    /// Reads a byte range of a file.
    Read,

    /// Writes a byte range of a file.
    Write,

    /// Fetches the value of an object key.
    Fetch,

    /// Updates the value of an object key.
    Update,
}

impl IoKind {
    fn tag(self) -> u8 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
            Self::Fetch => 3,
            Self::Update => 4,
        }
    }
}

impl Display for IoKind {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Fetch => "fetch",
            Self::Update => "update",
        })
    }
}

/// One asynchronous I/O operation, carried by an event while it is in flight.
///
/// Cloning produces another handle to the same operation. The caller keeps one clone to look
/// at the result, the event queue carries another and hands it back on completion.
///
/// ```
/// use event_queue::{Attachment, ResultCode};
/// use storage_client::{IoAttachment, IoKind};
///
/// let read = IoAttachment::read(4096, 512);
/// assert_eq!(read.kind(), IoKind::Read);
/// assert_eq!(read.data().len(), 512);
///
/// let mut carried = read.clone();
/// carried.on_ready(ResultCode::SUCCESS);
///
/// assert_eq!(read.result(), Some(ResultCode::SUCCESS));
/// ```
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum IoAttachment {
    /// See [`IoAttachment::read()`].
    Read(Rc<IoRequest>),

    /// See [`IoAttachment::write()`].
    Write(Rc<IoRequest>),

    /// See [`IoAttachment::fetch()`].
    Fetch(Rc<IoRequest>),

    /// See [`IoAttachment::update()`].
    Update(Rc<IoRequest>),
}

/// The shared state behind an [`IoAttachment`].
#[derive(Debug)]
pub struct IoRequest {
    target: IoTarget,
    buffer: RefCell<Vec<u8>>,
    event: Cell<Option<EventId>>,
    result: Cell<Option<ResultCode>>,
    reusable: Cell<bool>,
    discarded: Cell<bool>,
    released: Cell<bool>,
}

#[derive(Debug)]
enum IoTarget {
    File { offset: u64 },
    Object { dkey: String, akey: String },
}

impl IoAttachment {
    /// Reads `len` bytes of a file starting at `offset` into a zeroed buffer.
    #[must_use]
    pub fn read(offset: u64, len: usize) -> Self {
        Self::Read(IoRequest::new(IoTarget::File { offset }, vec![0; len]))
    }

    /// Writes `data` to a file starting at `offset`.
    #[must_use]
    pub fn write(offset: u64, data: Vec<u8>) -> Self {
        Self::Write(IoRequest::new(IoTarget::File { offset }, data))
    }

    /// Fetches up to `len` bytes of the value stored under `dkey`/`akey`.
    #[must_use]
    pub fn fetch(dkey: impl Into<String>, akey: impl Into<String>, len: usize) -> Self {
        Self::Fetch(IoRequest::new(
            IoTarget::Object {
                dkey: dkey.into(),
                akey: akey.into(),
            },
            vec![0; len],
        ))
    }

    /// Stores `data` under `dkey`/`akey`.
    #[must_use]
    pub fn update(dkey: impl Into<String>, akey: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Update(IoRequest::new(
            IoTarget::Object {
                dkey: dkey.into(),
                akey: akey.into(),
            },
            data,
        ))
    }

    /// Keeps the operation bound to its event after completion, so that the event can be used
    /// again for the same operation without attaching it anew.
    #[must_use]
    pub fn reusable(self) -> Self {
        self.request().reusable.set(true);
        self
    }

    /// The event the operation was last bound to.
    #[must_use]
    pub fn event(&self) -> Option<EventId> {
        self.request().event.get()
    }

    /// The backend's verdict, once the operation has completed.
    #[must_use]
    pub fn result(&self) -> Option<ResultCode> {
        self.request().result.get()
    }

    /// Whether the operation completed successfully.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result().is_some_and(ResultCode::is_success)
    }

    /// Whether the resources of the operation have been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.request().released.get()
    }

    /// The operation's buffer: the data to write, or the space to read into.
    #[must_use]
    pub fn data(&self) -> Ref<'_, [u8]> {
        Ref::map(self.request().buffer.borrow(), Vec::as_slice)
    }

    /// Mutable access to the operation's buffer, for whoever carries out the operation.
    #[must_use]
    pub fn data_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.request().buffer.borrow_mut()
    }

    /// Whether `other` is a handle to the same operation.
    #[must_use]
    pub fn same_operation(&self, other: &Self) -> bool {
        Rc::ptr_eq(self.request(), other.request())
    }

    /// Encodes the operation for submission to the backend.
    ///
    /// The layout is a kind tag followed by the target and the buffer length, all integers
    /// little-endian: `[tag][offset: u64][len: u64]` for file operations and
    /// `[tag][dkey len: u32][dkey][akey len: u32][akey][len: u64]` for object operations.
    #[must_use]
    pub fn descriptor(&self) -> Vec<u8> {
        let request = self.request();
        let len = u64::try_from(request.buffer.borrow().len())
            .expect("buffer length always fits in u64 on supported targets");

        let mut descriptor = vec![self.kind().tag()];

        match &request.target {
            IoTarget::File { offset } => {
                descriptor.extend_from_slice(&offset.to_le_bytes());
            }
            IoTarget::Object { dkey, akey } => {
                for key in [dkey, akey] {
                    let key_len = u32::try_from(key.len())
                        .expect("object keys longer than 4 GiB are not supported");
                    descriptor.extend_from_slice(&key_len.to_le_bytes());
                    descriptor.extend_from_slice(key.as_bytes());
                }
            }
        }

        descriptor.extend_from_slice(&len.to_le_bytes());
        descriptor
    }

    fn request(&self) -> &Rc<IoRequest> {
        match self {
            Self::Read(request)
            | Self::Write(request)
            | Self::Fetch(request)
            | Self::Update(request) => request,
        }
    }
}

impl IoRequest {
    fn new(target: IoTarget, buffer: Vec<u8>) -> Rc<Self> {
        Rc::new(Self {
            target,
            buffer: RefCell::new(buffer),
            event: Cell::new(None),
            result: Cell::new(None),
            reusable: Cell::new(false),
            discarded: Cell::new(false),
            released: Cell::new(false),
        })
    }
}

impl Attachment for IoAttachment {
    type Kind = IoKind;

    fn kind(&self) -> IoKind {
        match self {
            Self::Read(_) => IoKind::Read,
            Self::Write(_) => IoKind::Write,
            Self::Fetch(_) => IoKind::Fetch,
            Self::Update(_) => IoKind::Update,
        }
    }

    fn bind(&mut self, event: EventId) {
        self.request().event.set(Some(event));
    }

    fn reuse(&mut self) {
        let request = self.request();
        request.result.set(None);
        request.discarded.set(false);
    }

    fn on_ready(&mut self, result: ResultCode) {
        self.request().result.set(Some(result));
    }

    fn sticky_to_event(&self) -> bool {
        self.request().reusable.get()
    }

    fn discard(&mut self) {
        self.request().discarded.set(true);
    }

    fn is_discarded(&self) -> bool {
        self.request().discarded.get()
    }

    fn release(&mut self) {
        let request = self.request();

        if request.released.replace(true) {
            return;
        }

        // Whoever else still holds a clone sees an empty buffer rather than stale data.
        let mut buffer = request.buffer.borrow_mut();
        buffer.clear();
        buffer.shrink_to_fit();
    }
}
