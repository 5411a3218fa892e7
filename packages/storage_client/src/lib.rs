#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Process-wide client state for an object storage system.
//!
//! A [`ClientContext`] ties together what every user of the storage system in a process
//! shares:
//!
//! * One connection per pool ([`Pool`]), one open instance per container ([`Container`]) and
//!   one mount per file system view ([`Client`]), each reference-counted and closed when the
//!   last user lets go. These come from [`shared_handle`].
//! * One [event queue][event_queue::EventQueue] per thread for asynchronous I/O, carrying
//!   [`IoAttachment`] operations.
//! * An orderly shutdown that tears all of that down from the top and then finalizes the
//!   [`StorageBackend`].
//!
//! The storage library and the event machinery are both behind traits, so the same code runs
//! against a real storage system or against [`MemoryStorage`] and
//! [`LoopbackBackend`][event_queue::LoopbackBackend] in tests.
//!
//! ```
//! use std::sync::Arc;
//!
//! use event_queue::LoopbackBackend;
//! use storage_client::{ClientContext, ClientOptions, MemoryStorage, PoolOptions, ResourceKind};
//! use uuid::Uuid;
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let context = ClientContext::builder()
//!     .storage(storage.clone())
//!     .events(Arc::new(LoopbackBackend::new()))
//!     .build()
//!     .unwrap();
//!
//! let pool_id = Uuid::from_u128(7);
//!
//! let first = context.connect_pool(pool_id, &PoolOptions::default()).unwrap();
//! let second = context.connect_pool(pool_id, &PoolOptions::default()).unwrap();
//! assert_eq!(storage.opens(ResourceKind::Pool), 1);
//!
//! // A view of the pool's root container.
//! let client = context.mount(&first, None, &ClientOptions::default()).unwrap();
//! assert!(client.identity().is_root());
//!
//! drop((client, first, second));
//! assert_eq!(storage.closes(ResourceKind::Pool), 1);
//! ```

mod connectors;
mod context;
mod error;
mod io;
mod memory;
mod options;
mod storage;

pub use connectors::*;
pub use context::*;
pub use error::*;
pub use io::*;
pub use memory::*;
pub use options::*;
pub use storage::*;

pub(crate) const ERR_POISONED_LOCK: &str = "poisoned lock - safe execution no longer possible";
