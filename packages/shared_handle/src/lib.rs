#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Reference-counted, identity-keyed handles to expensive backend resources.
//!
//! Connecting to a storage pool or opening a container is expensive, and the backend expects
//! every process to hold at most one connection per resource. A [`HandleRegistry`] keeps one
//! open instance per identity and hands out [`SharedHandle`] tokens that count references to
//! it. The resource is opened by the first acquisition and closed when the last token is
//! released.
//!
//! The backend side of opening and closing is supplied by a [`Connector`], one per kind of
//! resource.
//!
//! # Parents and children
//!
//! Some resources are opened on top of another (a container inside a pool). A child records a
//! [`ParentLink`] to its parent. The link does not keep the parent open; whoever acquired the
//! child is expected to hold the parent's token for at least as long.
//!
//! # Shutdown
//!
//! At process shutdown some tokens may never be released. [`HandleRegistry::force_close_all()`]
//! closes everything a registry still has open, and [`ShutdownSequence`] runs the teardown of
//! several registries (and of the backend library itself) in a fixed order, exactly once.

mod connector;
mod error;
mod handle;
mod registry;
mod shutdown;

pub use connector::*;
pub use error::*;
pub use handle::*;
pub use registry::HandleRegistry;
pub use shutdown::*;

pub(crate) const ERR_POISONED_LOCK: &str = "poisoned lock - safe execution no longer possible";
