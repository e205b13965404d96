//! Common imports for writing and hosting objects.
//!
//! ```ignore
//! use tidepool::prelude::*;
//! ```

pub use crate::error::{CallError, Error, InvocationFault, RoutingError, StorageError};
pub use crate::namespace::{Namespace, ObjectStub};
pub use crate::object::{
    InstanceStatus, Jurisdiction, ObjectBehavior, ObjectContext, ObjectFactory, ObjectId,
    Request, Response,
};
pub use crate::runtime::{Runtime, RuntimeBuilder};
pub use crate::storage::{
    FileBackend, ListOptions, MemoryBackend, Persisted, Storage, TransactionOutcome, TxnOp,
};

pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use std::time::Duration;
