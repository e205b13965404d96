//! # Tidepool
//!
//! Addressable durable objects: named, single-instance actors, each with its
//! own private durable storage.
//!
//! Every object has a globally unique [`ObjectId`]. At most one instance of
//! an object is live at a time, and it processes requests strictly one at a
//! time, so its state never sees concurrent writers. Instances are activated
//! on the first request and evicted when idle. Storage outlives them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Runtime / RuntimeBuilder                                    │
//! │  • namespace bindings  • config (TOML)  • alarm recovery     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Namespace ──► ObjectStub ──► InstanceRouter                 │
//! │  • id_from_name           • one instance per id              │
//! │  • new_unique_id          • mailbox + turn loop per instance │
//! │  • jurisdiction views     • idle eviction, alarms            │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  ObjectBehavior (your code)  │  PlacementDirector            │
//! │  • invoke / alarm            │  • jurisdiction ─► region     │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │  Storage (per-object handle)                                 │
//! │  • get / put / delete / list / transaction / alarm           │
//! │  StorageBackend: MemoryBackend | FileBackend (fsynced log)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use tidepool::prelude::*;
//!
//! #[derive(Default)]
//! struct Counter;
//!
//! #[async_trait]
//! impl ObjectBehavior for Counter {
//!     async fn invoke(&mut self, ctx: &ObjectContext, req: Request) -> Result<Response, InvocationFault> {
//!         let n: u64 = ctx.storage().get::<u64>("n").await?.unwrap_or(0) + 1;
//!         ctx.storage().put("n", &n).await?;
//!         Ok(Response::json(&n)?)
//!     }
//! }
//!
//! let runtime = Runtime::builder()
//!     .bind("COUNTER", |_: &ObjectContext| Counter)
//!     .build()
//!     .await?;
//! let counter = runtime.namespace("COUNTER").unwrap().get_by_name("Cloudflare")?;
//! let n: u64 = counter.call("increment", &()).await?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
mod namespace;
pub mod object;
pub mod prelude;
pub mod router;
mod runtime;
pub mod storage;

pub use config::RuntimeConfig;
pub use error::{
    AllocationError, CallError, ConfigError, Error, InvocationFault, RoutingError, StorageError,
};
pub use namespace::{Namespace, ObjectStub};
pub use object::{
    id_from_name, id_from_string, new_unique_id, EvictionReason, IdKind, InstanceStatus,
    Jurisdiction, ObjectBehavior, ObjectContext, ObjectFactory, ObjectId, Request, Response,
};
pub use router::{
    AlarmPolicy, EvictionPolicy, InstanceRouter, PlacementDirector, PlacementError,
    RegionPlacement,
};
pub use runtime::{Runtime, RuntimeBuilder};
pub use storage::{
    FileBackend, ListOptions, MemoryBackend, Persisted, Storage, StorageBackend, Transaction,
    TransactionOutcome, TxnOp,
};
