#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A single-threaded, fixed-capacity completion reactor for asynchronous storage operations.
//!
//! An [`EventQueue`] owns a bounded set of reusable event slots bound to one completion queue of
//! an [`EventBackend`]. Every asynchronous operation occupies one event from submission until
//! its completion is harvested. The state of the operation travels with the event as an
//! [`Attachment`], which the queue hands back to the caller once the backend reports the
//! operation as complete.
//!
//! # Lifecycle of an operation
//!
//! 1. [`acquire_event()`][EventQueue::acquire_event] (or the blocking variant) reserves a slot.
//! 2. [`attach()`][EventQueue::attach] binds the operation's attachment to the slot.
//! 3. [`submit()`][EventQueue::submit] hands the encoded operation to the backend.
//! 4. [`poll_completed()`][EventQueue::poll_completed] harvests completions, calls
//!    [`Attachment::on_ready()`] with the result and returns the slot to the free pool.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use event_queue::{
//!     EventQueueConfig, EventQueueRegistry, LoopbackBackend, ResultCode, TaggedAttachment,
//! };
//!
//! let backend = Arc::new(LoopbackBackend::new());
//! let registry = EventQueueRegistry::new(backend.clone(), EventQueueConfig::default());
//!
//! let queue = registry.current().unwrap();
//! let mut queue = queue.borrow_mut();
//!
//! let event = queue.acquire_event().unwrap().unwrap();
//! let operation = TaggedAttachment::new("update", 42);
//! queue.attach(event, operation.clone()).unwrap();
//! queue.submit(event, b"request").unwrap();
//!
//! // Something else completes the operation; here we do it by hand.
//! backend.complete(queue.backend_queue(), event, ResultCode::SUCCESS);
//!
//! let mut completed = Vec::new();
//! queue
//!     .wait_for_completion(Duration::from_secs(1), "update", &mut completed)
//!     .unwrap();
//!
//! assert!(completed[0].same_operation(&operation));
//! ```
//!
//! # Completions nobody asked for
//!
//! A poll may harvest more completions than the caller wants, or completions of a different
//! kind of operation. Those are kept in a per-kind detain buffer, in completion order, and are
//! handed out first by later polls for their kind. Nothing harvested is ever lost.
//!
//! # Aborts
//!
//! [`abort_event()`][EventQueue::abort_event] asks the backend to cancel an operation. The
//! attachment of an aborted operation is released rather than delivered. If the operation had
//! already completed, the abort is a no-op and the completion is delivered as usual.
//!
//! # Timeouts and the progress watchdog
//!
//! The blocking operations take a maximum wait and fail with [`Error::TimedOut`] when it
//! passes. Each queue counts such timeouts until its next completion. Once the count crosses a
//! low watermark the queue starts logging warnings, and once it crosses a high watermark a
//! queue that has not completed anything for longer than the configured ceiling fails
//! blocking calls immediately instead of letting callers keep waiting. See
//! [`EventQueueConfig`] for the knobs.
//!
//! # Threading
//!
//! An [`EventQueue`] belongs to the thread that created it. [`EventQueueRegistry`] gives each
//! thread its own queue and can destroy all of them at shutdown from any thread.

mod attachment;
mod backend;
mod clock;
mod config;
mod detained;
mod error;
mod event;
mod event_queue;
mod loopback;
mod registry;
mod watchdog;

pub use attachment::*;
pub use backend::*;
pub use clock::*;
pub use config::*;
pub use detained::Candidates;
pub use error::*;
pub use event::*;
pub use event_queue::EventQueue;
pub use loopback::*;
pub use registry::*;

pub(crate) const ERR_POISONED_LOCK: &str = "poisoned lock - safe execution no longer possible";
