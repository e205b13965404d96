//! Object identity, lifecycle and the behavior traits.
//!
//! This module defines what an object *is*:
//!
//! - [`ObjectId`] and the allocator functions that produce it
//! - [`InstanceStatus`], the lifecycle of an object's in-memory instance
//! - [`ObjectBehavior`] / [`ObjectFactory`], implemented by application code
//! - [`ObjectContext`], passed to every turn
//! - [`Request`] / [`Response`], the envelopes exchanged with objects

mod behavior;
mod context;
pub mod id;
mod lifecycle;
mod message;

pub use behavior::{ObjectBehavior, ObjectFactory};
pub use context::ObjectContext;
pub use id::{
    id_from_name, id_from_string, new_unique_id, IdKind, Jurisdiction, ObjectId, ID_LEN,
    MAX_NAME_LEN,
};
pub use lifecycle::{EvictionReason, InstanceStatus};
pub use message::{Request, Response};

pub(crate) use id::namespace_tag;
pub(crate) use lifecycle::StatusCell;
