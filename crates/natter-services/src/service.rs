//! Handler contract for message-code based services.
//!
//! Every envelope that survives the interceptor chain is routed by its code
//! to exactly one [`Handler`]. Handlers also see connection lifecycle events
//! and their own registration, so a handler can start background work when
//! it is added and stop it when it is removed.

use std::sync::Arc;

use async_trait::async_trait;
use natter_core::{Envelope, MessageCode};

use crate::registry::RegistryError;
use crate::session::Context;

/// A unit of business logic bound to one message code.
///
/// Every method has a no-op default so implementors override only what
/// they need.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one envelope routed to this handler's code.
    ///
    /// Runs on the connection's own read loop. Writes issued through
    /// `ctx` here reach the wire before the next envelope is read.
    async fn on_message(&self, _ctx: &Context, _env: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    /// A connection finished its handshake.
    async fn on_active(&self, _ctx: &Context) {}

    /// A connection's read loop exited.
    async fn on_close(&self, _ctx: &Context) {}

    /// The handler is being added to `env`. Returning an error aborts the
    /// registration.
    fn on_init(&self, _env: &dyn Env) -> Result<(), RegistryError> {
        Ok(())
    }

    /// The handler was removed from `env`.
    fn on_remove(&self, _env: &dyn Env) {}
}

/// Route table handlers can modify at runtime.
pub trait Env: Send + Sync {
    fn add_handler(&self, code: MessageCode, handler: Arc<dyn Handler>)
        -> Result<(), RegistryError>;

    fn remove_handler(&self, code: MessageCode) -> Option<Arc<dyn Handler>>;
}
