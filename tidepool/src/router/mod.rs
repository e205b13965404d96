//! Instance router: one live instance per object id.
//!
//! The router owns the table of instance records. Every request goes
//! through [`InstanceRouter::invoke`], which finds or creates the record for
//! the target id and enqueues the request in its mailbox.
//!
//! # Single-instance guarantee
//!
//! The table is one `HashMap<ObjectId, InstanceSlot>` behind one mutex.
//! Two operations take that lock:
//!
//! - **enqueue**: look up (or create) the slot and push the envelope. The
//!   push on an unbounded channel is synchronous, so it completes under the
//!   lock.
//! - **retire**: an idle instance checks, under the lock, that its mailbox
//!   is empty and its slot is still the current generation, then removes the
//!   slot.
//!
//! Since both run under the same lock, a request is either enqueued before
//! the retire check (which then sees a non-empty mailbox and backs off) or
//! after it (and finds no slot, so it creates a new instance). No request is
//! lost and no id ever has two live instances.

mod instance;
pub mod placement;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::RoutingError;
use crate::namespace::{Binding, Namespace};
use crate::object::{InstanceStatus, ObjectId, Request, Response, StatusCell};
use crate::storage::Storage;

use instance::{Envelope, Instance};
pub use placement::{PlacementDirector, PlacementError, RegionPlacement};
pub use policy::{AlarmPolicy, EvictionPolicy};

/// Router-side handle to a live instance.
struct InstanceSlot {
    generation: u64,
    sender: mpsc::UnboundedSender<Envelope>,
    status: Arc<StatusCell>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RouterTable {
    slots: HashMap<ObjectId, InstanceSlot>,
    next_generation: u64,
    shutting_down: bool,
}

/// Routes requests to per-object instances, creating them on demand.
///
/// Built by [`RuntimeBuilder::build`](crate::RuntimeBuilder::build); use
/// [`Runtime::router`](crate::Runtime::router) for introspection.
pub struct InstanceRouter {
    table: Mutex<RouterTable>,
    placement: Arc<dyn PlacementDirector>,
    bindings: HashMap<String, Arc<Binding>>,
    by_tag: HashMap<[u8; 4], Arc<Binding>>,
    eviction: EvictionPolicy,
    alarms: AlarmPolicy,
}

impl InstanceRouter {
    pub(crate) fn new(
        placement: Arc<dyn PlacementDirector>,
        bindings: Vec<Arc<Binding>>,
        eviction: EvictionPolicy,
        alarms: AlarmPolicy,
    ) -> Arc<Self> {
        let by_tag = bindings.iter().map(|b| (b.tag, b.clone())).collect();
        let bindings = bindings.into_iter().map(|b| (b.name.clone(), b)).collect();
        Arc::new(Self {
            table: Mutex::new(RouterTable::default()),
            placement,
            bindings,
            by_tag,
            eviction,
            alarms,
        })
    }

    /// Namespace bound under `name`.
    pub fn namespace(self: &Arc<Self>, name: &str) -> Option<Namespace> {
        let binding = self.bindings.get(name)?;
        Some(Namespace::new(binding.clone(), self.clone()))
    }

    /// Names of every bound namespace, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliver `request` to the instance for `id`, activating it if needed.
    ///
    /// Fails with a [`RoutingError`] only when the request could not be run.
    /// Failures inside the object come back as an error [`Response`].
    pub(crate) async fn invoke(
        self: &Arc<Self>,
        binding: &Arc<Binding>,
        id: &ObjectId,
        request: Request,
    ) -> Result<Response, RoutingError> {
        let (reply, response) = oneshot::channel();
        self.enqueue(binding, id, Envelope::Invoke { request, reply })?;
        response
            .await
            .map_err(|_| RoutingError::InstanceGone(id.clone()))?
    }

    /// Activate `id` without a request, so its stored alarm gets scheduled.
    pub(crate) fn wake(self: &Arc<Self>, id: &ObjectId) -> Result<(), RoutingError> {
        let Some(binding) = self.by_tag.get(&id.namespace_tag()).cloned() else {
            tracing::warn!(object = %id, "no namespace for stored object, not waking");
            return Ok(());
        };
        self.enqueue(&binding, id, Envelope::Wake)
    }

    fn enqueue(
        self: &Arc<Self>,
        binding: &Arc<Binding>,
        id: &ObjectId,
        envelope: Envelope,
    ) -> Result<(), RoutingError> {
        let backend = self.placement.place(id)?;

        let mut table = self.table.lock();
        if table.shutting_down {
            return Err(RoutingError::ShuttingDown);
        }

        let envelope = match table.slots.get(id) {
            Some(slot) => match slot.sender.send(envelope) {
                Ok(()) => return Ok(()),
                // The task is gone without retiring its slot. Replace it.
                Err(mpsc::error::SendError(envelope)) => {
                    tracing::warn!(object = %id, "instance task ended unexpectedly, replacing");
                    envelope
                }
            },
            None => envelope,
        };

        let slot = self.spawn_instance(&mut table, binding, id, Storage::new(id.clone(), backend));
        let sent = slot.sender.send(envelope).is_ok();
        table.slots.insert(id.clone(), slot);
        if sent {
            Ok(())
        } else {
            Err(RoutingError::InstanceGone(id.clone()))
        }
    }

    fn spawn_instance(
        self: &Arc<Self>,
        table: &mut RouterTable,
        binding: &Arc<Binding>,
        id: &ObjectId,
        storage: Storage,
    ) -> InstanceSlot {
        table.next_generation += 1;
        let generation = table.next_generation;
        let (sender, mailbox) = mpsc::unbounded_channel();
        let status = Arc::new(StatusCell::new());

        let instance = Instance::new(
            id.clone(),
            generation,
            binding.clone(),
            storage,
            Arc::downgrade(self),
            status.clone(),
            mailbox,
            self.eviction,
            self.alarms,
        );
        let task = tokio::spawn(instance.run());

        InstanceSlot {
            generation,
            sender,
            status,
            task,
        }
    }

    /// Called by an idle instance. Removes its slot if it is still current
    /// and nothing is queued.
    fn retire(
        &self,
        id: &ObjectId,
        generation: u64,
        mailbox: &mpsc::UnboundedReceiver<Envelope>,
    ) -> bool {
        let mut table = self.table.lock();
        match table.slots.get(id) {
            Some(slot) if slot.generation == generation && mailbox.is_empty() => {
                table.slots.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Lifecycle status of the instance for `id`, or `None` if there is no
    /// record.
    pub fn status(&self, id: &ObjectId) -> Option<InstanceStatus> {
        self.table.lock().slots.get(id).map(|slot| slot.status.get())
    }

    /// Number of instance records currently in memory.
    pub fn active_count(&self) -> usize {
        self.table.lock().slots.len()
    }

    /// Evict `id` now if it is idle with nothing queued and no pending alarm.
    ///
    /// Returns whether the instance left memory. Waits for the current turn.
    pub async fn evict(&self, id: &ObjectId) -> bool {
        let (reply, retired) = oneshot::channel();
        {
            let table = self.table.lock();
            let Some(slot) = table.slots.get(id) else {
                return false;
            };
            if slot.sender.send(Envelope::Evict { reply }).is_err() {
                return false;
            }
        }
        retired.await.unwrap_or(false)
    }

    /// Stop accepting requests, let every instance drain its mailbox, and
    /// wait for all of them to exit.
    pub async fn shutdown(&self) {
        let slots: Vec<(ObjectId, InstanceSlot)> = {
            let mut table = self.table.lock();
            if table.shutting_down {
                return;
            }
            table.shutting_down = true;
            table.slots.drain().collect()
        };

        tracing::info!(instances = slots.len(), "router shutting down");
        let mut tasks = Vec::with_capacity(slots.len());
        for (id, slot) in slots {
            // Queued after everything already in the mailbox.
            let _ = slot.sender.send(Envelope::Shutdown);
            tasks.push((id, slot.task));
        }
        for (id, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!(object = %id, error = %e, "instance task failed during shutdown");
            }
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.table.lock().shutting_down
    }

    /// Deliver `request` to `id`, giving up after `timeout`.
    ///
    /// The request is not cancelled when the caller gives up.
    pub(crate) async fn invoke_timeout(
        self: &Arc<Self>,
        binding: &Arc<Binding>,
        id: &ObjectId,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, RoutingError> {
        let (reply, response) = oneshot::channel();
        self.enqueue(binding, id, Envelope::Invoke { request, reply })?;
        match tokio::time::timeout(timeout, response).await {
            Ok(result) => result.map_err(|_| RoutingError::InstanceGone(id.clone()))?,
            Err(_) => Err(RoutingError::Timeout(timeout)),
        }
    }
}

impl std::fmt::Debug for InstanceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRouter")
            .field("namespaces", &self.namespaces())
            .field("instances", &self.active_count())
            .field("eviction", &self.eviction)
            .finish_non_exhaustive()
    }
}
