//! The per-object instance task.
//!
//! Each instance record owns one tokio task running [`Instance::run`]. The
//! task is the only place an object's behavior executes, which is what makes
//! turns for one id strictly sequential.
//!
//! # Message loop
//!
//! ```text
//! loop {
//!     select! {
//!         envelope = mailbox.recv()      => invoke / wake / evict / shutdown
//!         _ = sleep_until(alarm)         => alarm turn        (if an alarm is set)
//!         _ = sleep(idle_timeout)        => try to retire     (idle eviction)
//!     }
//! }
//! ```
//!
//! # Turns
//!
//! A turn runs the behavior inside its own spawned task so a panic is caught
//! as a `JoinError` instead of killing the loop. The behavior value is moved
//! into that task and handed back on success. On a fault it is dropped and
//! the factory builds a fresh one for the next turn.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::policy::{AlarmPolicy, EvictionPolicy};
use super::InstanceRouter;
use crate::error::{InvocationFault, RoutingError};
use crate::namespace::Binding;
use crate::object::{
    EvictionReason, InstanceStatus, ObjectBehavior, ObjectContext, ObjectId, Request, Response,
    StatusCell,
};
use crate::storage::{ms_to_time, time_to_ms, ObjectSummary, Storage};

/// Messages delivered to an instance's mailbox.
pub(crate) enum Envelope {
    /// Run a request and send back its response.
    Invoke {
        request: Request,
        reply: oneshot::Sender<Result<Response, RoutingError>>,
    },
    /// Activate without a request, so a stored alarm gets scheduled.
    Wake,
    /// Leave memory if idle. Replies whether the instance retired.
    Evict { reply: oneshot::Sender<bool> },
    /// Finish and exit. Everything queued before it has been handled.
    Shutdown,
}

enum Turn {
    Invoke(Request),
    Alarm,
}

pub(crate) struct Instance {
    id: ObjectId,
    generation: u64,
    binding: Arc<Binding>,
    ctx: ObjectContext,
    router: Weak<InstanceRouter>,
    status: Arc<StatusCell>,
    mailbox: mpsc::UnboundedReceiver<Envelope>,
    behavior: Option<Box<dyn ObjectBehavior>>,
    activated: bool,
    summary: ObjectSummary,
    /// Monotonic deadline for `summary.alarm`, fixed when the alarm changes.
    alarm_at: Option<Instant>,
    alarm_failures: u32,
    eviction: EvictionPolicy,
    alarms: AlarmPolicy,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ObjectId,
        generation: u64,
        binding: Arc<Binding>,
        storage: Storage,
        router: Weak<InstanceRouter>,
        status: Arc<StatusCell>,
        mailbox: mpsc::UnboundedReceiver<Envelope>,
        eviction: EvictionPolicy,
        alarms: AlarmPolicy,
    ) -> Self {
        let ctx = ObjectContext::new(id.clone(), storage, router.clone());
        Self {
            id,
            generation,
            binding,
            ctx,
            router,
            status,
            mailbox,
            behavior: None,
            activated: false,
            summary: ObjectSummary::default(),
            alarm_at: None,
            alarm_failures: 0,
            eviction,
            alarms,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(
            object = %self.id,
            namespace = %self.binding.name,
            generation = self.generation,
            "instance started"
        );

        loop {
            let idle = self.eviction.timeout_for(self.summary.keys == 0);
            let alarm_at = self.alarm_at;

            tokio::select! {
                biased;

                envelope = self.mailbox.recv() => match envelope {
                    Some(Envelope::Invoke { request, reply }) => {
                        self.handle_invoke(request, reply).await;
                    }
                    Some(Envelope::Wake) => {
                        if let Err(e) = self.ensure_active().await {
                            tracing::warn!(object = %self.id, error = %e, "wake-up activation failed");
                        }
                    }
                    Some(Envelope::Evict { reply }) => {
                        let retired = self.try_retire(EvictionReason::Explicit);
                        let _ = reply.send(retired);
                        if retired {
                            break;
                        }
                    }
                    Some(Envelope::Shutdown) | None => {
                        self.stop(EvictionReason::Shutdown);
                        break;
                    }
                },

                _ = tokio::time::sleep_until(alarm_at.unwrap_or_else(Instant::now)), if alarm_at.is_some() => {
                    self.handle_alarm().await;
                }

                _ = tokio::time::sleep(idle) => {
                    if self.try_retire(EvictionReason::IdleTimeout) {
                        break;
                    }
                }
            }
        }
    }

    /// Probe storage and load the summary on the first turn.
    ///
    /// Failure leaves the instance uninitialized so the next request
    /// probes again.
    async fn ensure_active(&mut self) -> Result<(), RoutingError> {
        if self.activated {
            return Ok(());
        }

        let storage = self.ctx.storage();
        let unavailable = |e: crate::error::StorageError| RoutingError::StorageUnavailable {
            id: self.id.clone(),
            reason: e.to_string(),
        };
        storage.probe().await.map_err(unavailable)?;
        let summary = storage.summary().await.map_err(unavailable)?;
        self.activated = true;
        self.alarm_at = deadline(summary.alarm);
        self.summary = summary;

        tracing::info!(
            object = %self.id,
            namespace = %self.binding.name,
            keys = self.summary.keys,
            alarm = self.summary.alarm.is_some(),
            "object activated"
        );
        Ok(())
    }

    async fn handle_invoke(
        &mut self,
        request: Request,
        reply: oneshot::Sender<Result<Response, RoutingError>>,
    ) {
        if let Err(e) = self.ensure_active().await {
            tracing::warn!(object = %self.id, error = %e, "activation failed");
            let _ = reply.send(Err(e));
            return;
        }

        let method = request.method.clone();
        self.status.transition(InstanceStatus::Active);
        let response = match self.run_turn(Turn::Invoke(request)).await {
            Ok(Some(response)) => response,
            // Invoke turns always produce a response.
            Ok(None) => Response::ok(Vec::new()),
            Err(fault) => {
                tracing::warn!(object = %self.id, %method, error = %fault, "request failed");
                Response::from_fault(&fault)
            }
        };
        self.refresh_summary().await;
        self.status.transition(InstanceStatus::Idle);

        if reply.send(Ok(response)).is_err() {
            tracing::debug!(object = %self.id, %method, "caller stopped waiting");
        }
    }

    async fn handle_alarm(&mut self) {
        let storage = self.ctx.storage().clone();
        let cleared = storage.delete_alarm().await;
        self.summary.alarm = None;
        self.alarm_at = None;
        if let Err(e) = cleared {
            tracing::warn!(object = %self.id, error = %e, "could not clear alarm before running it");
            self.schedule_alarm_retry().await;
            return;
        }

        tracing::debug!(object = %self.id, attempt = self.alarm_failures + 1, "alarm firing");
        self.status.transition(InstanceStatus::Active);
        let result = self.run_turn(Turn::Alarm).await;
        self.refresh_summary().await;

        match result {
            Ok(_) => self.alarm_failures = 0,
            Err(fault) => {
                tracing::warn!(object = %self.id, error = %fault, "alarm handler failed");
                self.schedule_alarm_retry().await;
            }
        }
        self.status.transition(InstanceStatus::Idle);
    }

    /// Reschedule a failed alarm with backoff, unless the handler already
    /// set a new one or retries are exhausted.
    async fn schedule_alarm_retry(&mut self) {
        self.alarm_failures += 1;
        if self.alarm_failures > self.alarms.max_retries {
            tracing::error!(
                object = %self.id,
                attempts = self.alarm_failures,
                "alarm abandoned after exhausting retries"
            );
            self.alarm_failures = 0;
            return;
        }
        if self.summary.alarm.is_some() {
            return;
        }

        let delay = self.alarms.backoff(self.alarm_failures);
        let retry_at = ms_to_time(time_to_ms(SystemTime::now() + delay));
        if let Err(e) = self.ctx.storage().set_alarm(retry_at).await {
            tracing::warn!(object = %self.id, error = %e, "could not persist alarm retry");
        }
        // Keep the retry in memory even if storage refused it.
        self.summary.alarm = Some(retry_at);
        self.alarm_at = Some(Instant::now() + delay);
        tracing::debug!(object = %self.id, ?delay, attempt = self.alarm_failures, "alarm retry scheduled");
    }

    /// Run one turn on the behavior, isolating panics.
    async fn run_turn(&mut self, turn: Turn) -> Result<Option<Response>, InvocationFault> {
        let behavior = self.behavior.take();
        let factory = self.binding.factory.clone();
        let ctx = self.ctx.clone();

        let handle = tokio::spawn(async move {
            let mut behavior = match behavior {
                Some(behavior) => behavior,
                None => factory.create(&ctx),
            };
            let result = match turn {
                Turn::Invoke(request) => behavior.invoke(&ctx, request).await.map(Some),
                Turn::Alarm => behavior.alarm(&ctx).await.map(|()| None),
            };
            (behavior, result)
        });

        match handle.await {
            Ok((behavior, Ok(output))) => {
                self.behavior = Some(behavior);
                Ok(output)
            }
            Ok((_, Err(fault))) => {
                tracing::debug!(object = %self.id, "dropping behavior after fault");
                Err(fault)
            }
            Err(e) => {
                if e.is_panic() {
                    tracing::error!(object = %self.id, "object panicked during its turn");
                } else {
                    tracing::error!(object = %self.id, error = %e, "turn task cancelled");
                }
                Err(InvocationFault::Panicked)
            }
        }
    }

    async fn refresh_summary(&mut self) {
        match self.ctx.storage().summary().await {
            Ok(summary) => {
                if summary.alarm != self.summary.alarm {
                    self.alarm_at = deadline(summary.alarm);
                }
                self.summary = summary;
            }
            Err(e) => tracing::warn!(object = %self.id, error = %e, "could not refresh storage summary"),
        }
    }

    /// Remove this instance's record if nothing is queued and no alarm is
    /// pending.
    fn try_retire(&mut self, reason: EvictionReason) -> bool {
        if self.summary.alarm.is_some() {
            tracing::trace!(object = %self.id, ?reason, "eviction blocked by pending alarm");
            return false;
        }
        let Some(router) = self.router.upgrade() else {
            self.stop(reason);
            return true;
        };
        if !router.retire(&self.id, self.generation, &self.mailbox) {
            return false;
        }
        self.stop(reason);
        true
    }

    fn stop(&mut self, reason: EvictionReason) {
        self.behavior = None;
        self.status.transition(InstanceStatus::Evicted);
        tracing::info!(
            object = %self.id,
            namespace = %self.binding.name,
            ?reason,
            "object evicted"
        );
    }
}

/// Monotonic instant at which a wall-clock alarm is due. Past alarms are due
/// now.
fn deadline(alarm: Option<SystemTime>) -> Option<Instant> {
    let delay = alarm?
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    Some(Instant::now() + delay)
}
