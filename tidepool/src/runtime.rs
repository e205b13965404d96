//! Runtime assembly.
//!
//! [`RuntimeBuilder`] collects storage regions, policies and namespace
//! bindings, then [`build`](RuntimeBuilder::build) validates them, creates
//! the [`InstanceRouter`], and wakes every object whose alarm survived a
//! previous run.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, Error};
use crate::namespace::{Binding, Namespace};
use crate::object::{Jurisdiction, ObjectFactory};
use crate::router::{AlarmPolicy, EvictionPolicy, InstanceRouter, PlacementDirector, RegionPlacement};
use crate::storage::{MemoryBackend, StorageBackend};

struct PendingBinding {
    namespace: String,
    class: String,
    jurisdiction: Option<Jurisdiction>,
}

/// Builder for [`Runtime`].
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::builder()
///     .storage(Arc::new(FileBackend::open("/var/lib/tidepool").await?))
///     .bind("COUNTER", |_ctx: &ObjectContext| Counter::default())
///     .build()
///     .await?;
/// ```
pub struct RuntimeBuilder {
    eviction: EvictionPolicy,
    alarms: AlarmPolicy,
    storage: Option<Arc<dyn StorageBackend>>,
    regions: Vec<(Jurisdiction, Arc<dyn StorageBackend>)>,
    placement: Option<Arc<dyn PlacementDirector>>,
    classes: HashMap<String, Arc<dyn ObjectFactory>>,
    bindings: Vec<PendingBinding>,
    config: Option<RuntimeConfig>,
}

impl RuntimeBuilder {
    /// Empty builder: memory storage, default policies, no namespaces.
    pub fn new() -> Self {
        Self {
            eviction: EvictionPolicy::default(),
            alarms: AlarmPolicy::default(),
            storage: None,
            regions: Vec::new(),
            placement: None,
            classes: HashMap::new(),
            bindings: Vec::new(),
            config: None,
        }
    }

    /// Builder seeded from a configuration document.
    ///
    /// Policies are applied immediately. Storage sections are opened and
    /// bindings resolved during [`build`](Self::build), after classes have
    /// been registered. Storage set explicitly on the builder wins over the
    /// configured one.
    pub fn from_config(config: RuntimeConfig) -> Self {
        let mut builder = Self::new();
        builder.eviction = config.eviction.into();
        builder.alarms = config.alarms.into();
        builder.config = Some(config);
        builder
    }

    /// Set the eviction policy.
    pub fn eviction(mut self, policy: EvictionPolicy) -> Self {
        self.eviction = policy;
        self
    }

    /// Set the alarm retry policy.
    pub fn alarms(mut self, policy: AlarmPolicy) -> Self {
        self.alarms = policy;
        self
    }

    /// Set the default storage region.
    pub fn storage(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(backend);
        self
    }

    /// Add a storage region for `jurisdiction`.
    pub fn region(mut self, jurisdiction: Jurisdiction, backend: Arc<dyn StorageBackend>) -> Self {
        self.regions.push((jurisdiction, backend));
        self
    }

    /// Replace region-based placement with a custom director.
    ///
    /// Overrides [`storage`](Self::storage) and [`region`](Self::region).
    pub fn placement(mut self, director: Arc<dyn PlacementDirector>) -> Self {
        self.placement = Some(director);
        self
    }

    /// Register a class by name, for bindings that refer to it.
    pub fn class(mut self, name: impl Into<String>, factory: impl ObjectFactory) -> Self {
        self.classes.insert(name.into(), Arc::new(factory));
        self
    }

    /// Bind `namespace` to `factory`. The class is named after the namespace.
    pub fn bind(self, namespace: impl Into<String>, factory: impl ObjectFactory) -> Self {
        self.bind_class(namespace, None, factory)
    }

    /// Bind `namespace` to `factory`, restricting every id to `jurisdiction`.
    pub fn bind_in(
        self,
        namespace: impl Into<String>,
        jurisdiction: Jurisdiction,
        factory: impl ObjectFactory,
    ) -> Self {
        self.bind_class(namespace, Some(jurisdiction), factory)
    }

    /// Bind `namespace` to an already registered class.
    pub fn bind_to_class(
        mut self,
        namespace: impl Into<String>,
        class: impl Into<String>,
        jurisdiction: Option<Jurisdiction>,
    ) -> Self {
        self.bindings.push(PendingBinding {
            namespace: namespace.into(),
            class: class.into(),
            jurisdiction,
        });
        self
    }

    fn bind_class(
        mut self,
        namespace: impl Into<String>,
        jurisdiction: Option<Jurisdiction>,
        factory: impl ObjectFactory,
    ) -> Self {
        let namespace = namespace.into();
        self.classes.insert(namespace.clone(), Arc::new(factory));
        self.bind_to_class(namespace.clone(), namespace, jurisdiction)
    }

    /// Validate bindings, open storage, and start the runtime.
    ///
    /// Objects with alarms stored from a previous run are woken so their
    /// alarms fire.
    pub async fn build(mut self) -> Result<Runtime, Error> {
        if let Some(config) = self.config.take() {
            if self.storage.is_none() {
                self.storage = Some(config.storage.open().await?);
            }
            for region in &config.regions {
                self.regions.push((region.jurisdiction, region.open().await?));
            }
            for binding in config.bindings {
                self.bindings.push(PendingBinding {
                    namespace: binding.namespace,
                    class: binding.class,
                    jurisdiction: binding.jurisdiction,
                });
            }
        }

        let placement = match self.placement.take() {
            Some(director) => director,
            None => self.region_placement()?,
        };
        let bindings = self.resolve_bindings()?;

        let router = InstanceRouter::new(placement.clone(), bindings, self.eviction, self.alarms);
        tracing::info!(namespaces = ?router.namespaces(), "runtime started");

        let mut woken = 0usize;
        for backend in placement.backends() {
            for (id, at) in backend.scheduled_alarms().await? {
                tracing::debug!(object = %id, ?at, "recovering stored alarm");
                match router.wake(&id) {
                    Ok(()) => woken += 1,
                    Err(e) => tracing::warn!(object = %id, error = %e, "could not wake object for its alarm"),
                }
            }
        }
        if woken > 0 {
            tracing::info!(objects = woken, "woke objects with pending alarms");
        }

        Ok(Runtime { router })
    }

    fn region_placement(&mut self) -> Result<Arc<dyn PlacementDirector>, ConfigError> {
        let default = self
            .storage
            .take()
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let mut placement = RegionPlacement::new(default);
        let mut seen = HashSet::new();
        for (jurisdiction, backend) in self.regions.drain(..) {
            if !seen.insert(jurisdiction) {
                return Err(ConfigError::DuplicateRegion(jurisdiction));
            }
            placement = placement.with_region(jurisdiction, backend);
        }
        Ok(Arc::new(placement))
    }

    fn resolve_bindings(&mut self) -> Result<Vec<Arc<Binding>>, ConfigError> {
        let mut names = HashSet::new();
        let mut tags: HashMap<[u8; 4], String> = HashMap::new();
        let mut resolved = Vec::with_capacity(self.bindings.len());

        for pending in self.bindings.drain(..) {
            if !names.insert(pending.namespace.clone()) {
                return Err(ConfigError::DuplicateNamespace(pending.namespace));
            }
            let factory = self.classes.get(&pending.class).cloned().ok_or_else(|| {
                ConfigError::UnknownClass {
                    namespace: pending.namespace.clone(),
                    class: pending.class.clone(),
                }
            })?;
            let binding = Binding::new(pending.namespace, pending.class, factory, pending.jurisdiction);
            if let Some(first) = tags.insert(binding.tag, binding.name.clone()) {
                return Err(ConfigError::NamespaceTagCollision {
                    first,
                    second: binding.name,
                });
            }
            resolved.push(Arc::new(binding));
        }
        Ok(resolved)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("eviction", &self.eviction)
            .field("alarms", &self.alarms)
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

/// A running set of namespaces sharing one router.
///
/// Cloning is cheap. Dropping the last clone (and every namespace and stub
/// taken from it) lets instance tasks wind down; call
/// [`shutdown`](Self::shutdown) to wait for them.
#[derive(Clone, Debug)]
pub struct Runtime {
    router: Arc<InstanceRouter>,
}

impl Runtime {
    /// Start configuring a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Namespace bound under `name`.
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.router.namespace(name)
    }

    /// The router, for introspection and explicit eviction.
    pub fn router(&self) -> &Arc<InstanceRouter> {
        &self.router
    }

    /// Finish queued requests, stop every instance, and reject new requests.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::InvocationFault;
    use crate::object::{ObjectBehavior, ObjectContext, Request, Response};

    struct Echo;

    #[async_trait]
    impl ObjectBehavior for Echo {
        async fn invoke(
            &mut self,
            _ctx: &ObjectContext,
            request: Request,
        ) -> Result<Response, InvocationFault> {
            Ok(Response::ok(request.body))
        }
    }

    fn echo(_ctx: &ObjectContext) -> Echo {
        Echo
    }

    #[tokio::test]
    async fn test_duplicate_namespace_is_rejected() {
        let result = Runtime::builder()
            .bind("ECHO", echo)
            .bind("ECHO", echo)
            .build()
            .await;
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::DuplicateNamespace(ref name))) if name == "ECHO"
        ));
    }

    #[tokio::test]
    async fn test_unknown_class_is_rejected() {
        let result = Runtime::builder()
            .bind_to_class("ECHO", "Missing", None)
            .build()
            .await;
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::UnknownClass { .. }))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_region_is_rejected() {
        let result = Runtime::builder()
            .region(Jurisdiction::Eu, Arc::new(MemoryBackend::new()))
            .region(Jurisdiction::Eu, Arc::new(MemoryBackend::new()))
            .bind("ECHO", echo)
            .build()
            .await;
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::DuplicateRegion(Jurisdiction::Eu)))
        ));
    }

    #[tokio::test]
    async fn test_bindings_from_config_resolve_classes() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [[bindings]]
            namespace = "ECHO"
            class = "Echo"
            "#,
        )
        .expect("parse");

        let runtime = RuntimeBuilder::from_config(config)
            .class("Echo", echo)
            .build()
            .await
            .expect("build");

        let ns = runtime.namespace("ECHO").expect("bound");
        assert_eq!(ns.class(), "Echo");
        let response = ns
            .get_by_name("a")
            .expect("stub")
            .invoke(Request::new("echo", b"hi".to_vec()))
            .await
            .expect("invoke");
        assert_eq!(response.body, b"hi");
        runtime.shutdown().await;
    }
}
