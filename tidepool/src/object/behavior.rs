//! Behavior traits implemented by object classes.

use async_trait::async_trait;

use super::context::ObjectContext;
use super::message::{Request, Response};
use crate::error::InvocationFault;

/// Application code bound to a namespace.
///
/// One value lives per active object. The router guarantees that at most
/// one method runs on it at a time, so `&mut self` is never contended.
///
/// # Fault handling
///
/// Returning `Err` (or panicking) produces an error [`Response`] for the
/// caller. The value is then dropped and the next turn gets a fresh one from
/// the [`ObjectFactory`], so anything held only in memory rolls back to what
/// storage holds.
///
/// # Example
///
/// ```rust,ignore
/// use tidepool::prelude::*;
///
/// #[derive(Default)]
/// struct Counter;
///
/// #[async_trait]
/// impl ObjectBehavior for Counter {
///     async fn invoke(&mut self, ctx: &ObjectContext, req: Request) -> Result<Response, InvocationFault> {
///         match req.method.as_str() {
///             "increment" => {
///                 let n: u64 = ctx.storage().get::<u64>("n").await?.unwrap_or(0) + 1;
///                 ctx.storage().put("n", &n).await?;
///                 Ok(Response::json(&n)?)
///             }
///             other => Err(InvocationFault::UnknownMethod(other.to_string())),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ObjectBehavior: Send + 'static {
    /// Handle one request.
    async fn invoke(
        &mut self,
        ctx: &ObjectContext,
        request: Request,
    ) -> Result<Response, InvocationFault>;

    /// Called when the object's alarm fires.
    ///
    /// The alarm is already cleared in storage when this runs; set a new one
    /// to repeat. An error schedules a retry with backoff.
    async fn alarm(&mut self, ctx: &ObjectContext) -> Result<(), InvocationFault> {
        tracing::debug!(object = %ctx.id(), "alarm fired with no handler");
        Ok(())
    }
}

/// Builds behavior values for a namespace.
///
/// Called on activation and again after every fault. Implemented for any
/// `Fn(&ObjectContext) -> B` closure.
pub trait ObjectFactory: Send + Sync + 'static {
    /// Build a fresh behavior for the object in `ctx`.
    fn create(&self, ctx: &ObjectContext) -> Box<dyn ObjectBehavior>;
}

impl<F, B> ObjectFactory for F
where
    F: Fn(&ObjectContext) -> B + Send + Sync + 'static,
    B: ObjectBehavior,
{
    fn create(&self, ctx: &ObjectContext) -> Box<dyn ObjectBehavior> {
        Box::new(self(ctx))
    }
}
