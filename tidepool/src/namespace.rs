//! Namespaces and object stubs.
//!
//! A [`Namespace`] is the entry point for one object class: it allocates ids
//! and hands out [`ObjectStub`]s. Stubs are plain addresses; holding one
//! never activates anything. The first [`ObjectStub::invoke`] does.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AllocationError, CallError, RoutingError};
use crate::object::{
    namespace_tag, new_unique_id, InstanceStatus, Jurisdiction, ObjectFactory, ObjectId, Request,
    Response,
};
use crate::router::InstanceRouter;

/// A namespace name bound to the factory that builds its objects.
pub(crate) struct Binding {
    pub(crate) name: String,
    pub(crate) tag: [u8; 4],
    pub(crate) class: String,
    pub(crate) factory: Arc<dyn ObjectFactory>,
    /// Every id of this namespace is tagged with this jurisdiction.
    pub(crate) jurisdiction: Option<Jurisdiction>,
}

impl Binding {
    pub(crate) fn new(
        name: impl Into<String>,
        class: impl Into<String>,
        factory: Arc<dyn ObjectFactory>,
        jurisdiction: Option<Jurisdiction>,
    ) -> Self {
        let name = name.into();
        Self {
            tag: namespace_tag(&name),
            name,
            class: class.into(),
            factory,
            jurisdiction,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("jurisdiction", &self.jurisdiction)
            .finish_non_exhaustive()
    }
}

/// Id allocator and stub factory for one bound namespace.
///
/// # Example
///
/// ```rust,ignore
/// let counters = runtime.namespace("COUNTER").expect("bound");
/// let stub = counters.get_by_name("Cloudflare")?;
/// let n: u64 = stub.call("increment", &()).await?;
/// ```
#[derive(Clone)]
pub struct Namespace {
    binding: Arc<Binding>,
    router: Arc<InstanceRouter>,
    jurisdiction: Option<Jurisdiction>,
}

impl Namespace {
    pub(crate) fn new(binding: Arc<Binding>, router: Arc<InstanceRouter>) -> Self {
        let jurisdiction = binding.jurisdiction;
        Self {
            binding,
            router,
            jurisdiction,
        }
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.binding.name
    }

    /// Registered class name of the namespace's behavior.
    pub fn class(&self) -> &str {
        &self.binding.class
    }

    /// Jurisdiction every id from this view is tagged with.
    pub fn jurisdiction_tag(&self) -> Option<Jurisdiction> {
        self.jurisdiction
    }

    /// A view of this namespace whose ids are all tagged with `jurisdiction`.
    ///
    /// Named ids are derived per jurisdiction: the same name gives different
    /// objects in the EU view and in the unrestricted view.
    pub fn jurisdiction(&self, jurisdiction: Jurisdiction) -> Result<Namespace, AllocationError> {
        self.check_jurisdiction(Some(jurisdiction))?;
        Ok(Namespace {
            binding: self.binding.clone(),
            router: self.router.clone(),
            jurisdiction: Some(jurisdiction),
        })
    }

    /// Deterministic id for `name`.
    pub fn id_from_name(&self, name: &str) -> Result<ObjectId, AllocationError> {
        ObjectId::named(&self.binding.name, self.jurisdiction, name)
    }

    /// Fresh random id, tagged with this view's jurisdiction.
    pub fn new_unique_id(&self) -> ObjectId {
        new_unique_id(&self.binding.name, self.jurisdiction)
    }

    /// Fresh random id tagged with `jurisdiction`.
    ///
    /// Fails if the namespace is restricted to a different one.
    pub fn new_unique_id_in(&self, jurisdiction: Jurisdiction) -> Result<ObjectId, AllocationError> {
        self.check_jurisdiction(Some(jurisdiction))?;
        Ok(new_unique_id(&self.binding.name, Some(jurisdiction)))
    }

    /// Parse an id previously rendered with `to_string`/`to_hex`.
    pub fn id_from_string(&self, hex_id: &str) -> Result<ObjectId, AllocationError> {
        let id = crate::object::id_from_string(&self.binding.name, hex_id)?;
        self.check_jurisdiction(id.jurisdiction())?;
        Ok(id)
    }

    /// Stub addressing `id`. Does not activate anything.
    pub fn get(&self, id: &ObjectId) -> Result<ObjectStub, AllocationError> {
        if id.namespace_tag() != self.binding.tag {
            return Err(AllocationError::ForeignNamespace {
                id: id.to_hex(),
                namespace: self.binding.name.clone(),
            });
        }
        self.check_jurisdiction(id.jurisdiction())?;
        Ok(ObjectStub {
            id: id.clone(),
            binding: self.binding.clone(),
            router: self.router.clone(),
        })
    }

    /// Shorthand for `get(&id_from_name(name)?)`.
    pub fn get_by_name(&self, name: &str) -> Result<ObjectStub, AllocationError> {
        self.get(&self.id_from_name(name)?)
    }

    fn check_jurisdiction(&self, requested: Option<Jurisdiction>) -> Result<(), AllocationError> {
        match self.binding.jurisdiction {
            Some(restricted) if requested != Some(restricted) => {
                Err(AllocationError::JurisdictionConflict {
                    restricted,
                    requested,
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.binding.name)
            .field("jurisdiction", &self.jurisdiction)
            .finish()
    }
}

/// Address of one object. Cheap to clone and to pass around.
#[derive(Clone)]
pub struct ObjectStub {
    id: ObjectId,
    binding: Arc<Binding>,
    router: Arc<InstanceRouter>,
}

impl ObjectStub {
    /// The addressed object.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Send `request` and wait for the response.
    pub async fn invoke(&self, request: Request) -> Result<Response, RoutingError> {
        self.router.invoke(&self.binding, &self.id, request).await
    }

    /// Like [`invoke`](Self::invoke), but stop waiting after `timeout`.
    ///
    /// On timeout the request still runs to completion in the object, and
    /// its writes still commit.
    pub async fn invoke_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, RoutingError> {
        self.router
            .invoke_timeout(&self.binding, &self.id, request, timeout)
            .await
    }

    /// JSON-encode `payload`, invoke `method`, and decode a successful body.
    pub async fn call<Req, Resp>(&self, method: &str, payload: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self.invoke(Request::json(method, payload)?).await?;
        if !response.is_success() {
            return Err(CallError::Status {
                status: response.status,
                message: response.text(),
            });
        }
        Ok(response.json_body()?)
    }

    /// Current lifecycle status, or `None` if the object is not in memory.
    pub fn status(&self) -> Option<InstanceStatus> {
        self.router.status(&self.id)
    }
}

impl fmt::Debug for ObjectStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStub")
            .field("namespace", &self.binding.name)
            .field("id", &self.id)
            .finish()
    }
}
