//! Execution context handed to object behaviors.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::namespace::Namespace;
use crate::object::ObjectId;
use crate::router::InstanceRouter;
use crate::storage::Storage;

/// Everything a behavior can reach during a turn.
///
/// - its own [`ObjectId`]
/// - its [`Storage`], scoped to that id
/// - other namespaces of the same runtime, for calling other objects
///
/// Contexts are cheap to clone. They hold the router weakly, so a behavior
/// that outlives its runtime simply finds no namespaces.
#[derive(Clone)]
pub struct ObjectContext {
    id: ObjectId,
    storage: Storage,
    router: Weak<InstanceRouter>,
}

impl ObjectContext {
    pub(crate) fn new(id: ObjectId, storage: Storage, router: Weak<InstanceRouter>) -> Self {
        Self {
            id,
            storage,
            router,
        }
    }

    /// Identity of the object running this turn.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Durable storage of this object.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Look up a namespace bound in the same runtime.
    ///
    /// Returns `None` if no namespace has that name or the runtime is gone.
    /// Calling an object in your own namespace is allowed; calling *yourself*
    /// waits behind your own turn, so bound it with
    /// [`invoke_timeout`](crate::ObjectStub::invoke_timeout).
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        let router: Arc<InstanceRouter> = self.router.upgrade()?;
        router.namespace(name)
    }
}

impl fmt::Debug for ObjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
