//! Shared behaviors and helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use tidepool::prelude::*;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Counter that keeps its value in storage and a copy in memory.
///
/// | method | body | effect |
/// |--------|------|--------|
/// | `increment` | - | `count += 1`, returns the new value |
/// | `get` | - | stored `count` |
/// | `cached` | - | the in-memory copy, `null` after a rollback |
/// | `add_then_fail` | `u64` | commits `count += n`, then fails |
/// | `panic` | - | panics |
/// | `slow_increment` | `u64` ms | sleeps, then increments |
/// | `set_alarm` | `u64` ms | schedules the alarm that far ahead |
/// | `alarms` | - | how many alarm turns completed |
///
/// The alarm handler fails while the stored `fail_alarms` counter is
/// positive, decrementing it each time.
#[derive(Default)]
pub struct Counter {
    cached: Option<u64>,
}

impl Counter {
    pub fn factory(_ctx: &ObjectContext) -> Counter {
        Counter::default()
    }

    async fn increment(&mut self, storage: &Storage) -> Result<u64, InvocationFault> {
        let n = storage.get::<u64>("count").await?.unwrap_or(0) + 1;
        storage.put("count", &n).await?;
        self.cached = Some(n);
        Ok(n)
    }
}

#[async_trait]
impl ObjectBehavior for Counter {
    async fn invoke(
        &mut self,
        ctx: &ObjectContext,
        request: Request,
    ) -> Result<Response, InvocationFault> {
        let storage = ctx.storage();
        match request.method.as_str() {
            "increment" => Ok(Response::json(&self.increment(storage).await?)?),
            "get" => {
                let n = storage.get::<u64>("count").await?.unwrap_or(0);
                Ok(Response::json(&n)?)
            }
            "cached" => Ok(Response::json(&self.cached)?),
            "add_then_fail" => {
                let amount: u64 = request.json_body()?;
                let n = storage.get::<u64>("count").await?.unwrap_or(0) + amount;
                storage.put("count", &n).await?;
                self.cached = Some(n);
                Err(InvocationFault::failed("failed after write"))
            }
            "panic" => panic!("counter asked to panic"),
            "slow_increment" => {
                let ms: u64 = request.json_body()?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Response::json(&self.increment(storage).await?)?)
            }
            "set_alarm" => {
                let ms: u64 = request.json_body()?;
                storage
                    .set_alarm(SystemTime::now() + Duration::from_millis(ms))
                    .await?;
                Ok(Response::ok(Vec::new()))
            }
            "fail_alarms" => {
                let times: u64 = request.json_body()?;
                storage.put("fail_alarms", &times).await?;
                Ok(Response::ok(Vec::new()))
            }
            "alarms" => {
                let n = storage.get::<u64>("alarms").await?.unwrap_or(0);
                Ok(Response::json(&n)?)
            }
            other => Err(InvocationFault::UnknownMethod(other.to_string())),
        }
    }

    async fn alarm(&mut self, ctx: &ObjectContext) -> Result<(), InvocationFault> {
        let storage = ctx.storage();
        let pending_failures = storage.get::<u64>("fail_alarms").await?.unwrap_or(0);
        if pending_failures > 0 {
            storage.put("fail_alarms", &(pending_failures - 1)).await?;
            return Err(InvocationFault::failed("alarm asked to fail"));
        }
        let n = storage.get::<u64>("alarms").await?.unwrap_or(0) + 1;
        storage.put("alarms", &n).await?;
        Ok(())
    }
}

/// Records how many turns run at once, across every object it builds.
#[derive(Debug, Default)]
pub struct Overlap {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Overlap {
    pub fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Behavior whose `work` method sleeps while registered in an [`Overlap`].
pub struct Worker {
    overlap: Arc<Overlap>,
}

impl Worker {
    pub fn factory(overlap: Arc<Overlap>) -> impl Fn(&ObjectContext) -> Worker + Send + Sync + 'static {
        move |_ctx: &ObjectContext| Worker {
            overlap: overlap.clone(),
        }
    }
}

#[async_trait]
impl ObjectBehavior for Worker {
    async fn invoke(
        &mut self,
        ctx: &ObjectContext,
        request: Request,
    ) -> Result<Response, InvocationFault> {
        match request.method.as_str() {
            "work" => {
                self.overlap.enter();
                tokio::time::sleep(Duration::from_millis(20)).await;
                let log = ctx.storage().get::<Vec<u64>>("log").await?;
                let mut log = log.unwrap_or_default();
                let seq: u64 = request.json_body()?;
                log.push(seq);
                ctx.storage().put("log", &log).await?;
                self.overlap.exit();
                Ok(Response::json(&seq)?)
            }
            "log" => {
                let log = ctx.storage().get::<Vec<u64>>("log").await?;
                Ok(Response::json(&log.unwrap_or_default())?)
            }
            other => Err(InvocationFault::UnknownMethod(other.to_string())),
        }
    }
}

/// Calls `increment` on the COUNTER object named in the request body.
pub struct Relay;

#[async_trait]
impl ObjectBehavior for Relay {
    async fn invoke(
        &mut self,
        ctx: &ObjectContext,
        request: Request,
    ) -> Result<Response, InvocationFault> {
        match request.method.as_str() {
            "forward" => {
                let target: String = request.json_body()?;
                let counters = ctx
                    .namespace("COUNTER")
                    .ok_or_else(|| InvocationFault::failed("COUNTER not bound"))?;
                let stub = counters
                    .get_by_name(&target)
                    .map_err(|e| InvocationFault::bad_request(e.to_string()))?;
                let n: u64 = stub.call("increment", &()).await?;
                Ok(Response::json(&n)?)
            }
            "call_self" => {
                let relays = ctx
                    .namespace("RELAY")
                    .ok_or_else(|| InvocationFault::failed("RELAY not bound"))?;
                let me = relays
                    .get(ctx.id())
                    .map_err(|e| InvocationFault::bad_request(e.to_string()))?;
                let response = me
                    .invoke_timeout(Request::empty("noop"), Duration::from_millis(100))
                    .await?;
                Ok(response)
            }
            "noop" => Ok(Response::ok(Vec::new())),
            other => Err(InvocationFault::UnknownMethod(other.to_string())),
        }
    }
}

/// A runtime with COUNTER bound on the given storage.
pub async fn counter_runtime(storage: Arc<dyn tidepool::StorageBackend>) -> Runtime {
    Runtime::builder()
        .storage(storage)
        .bind("COUNTER", Counter::factory)
        .build()
        .await
        .expect("build runtime")
}
