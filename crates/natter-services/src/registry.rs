//! Handler registry — message code → handler routing plus the interceptor
//! chain, shared by every connection of one server or client runtime.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use natter_core::{Envelope, MessageCode};

use crate::dispatch::DispatchError;
use crate::interceptor::{self, Interceptor};
use crate::service::{Env, Handler};
use crate::session::Context;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for code {0} already registered")]
    Duplicate(MessageCode),
}

#[derive(Default)]
pub struct Registry {
    handlers: DashMap<MessageCode, Arc<dyn Handler>>,
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handler(&self, code: MessageCode) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&code).map(|h| h.value().clone())
    }

    /// Snapshot of every registered handler.
    pub fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers.iter().map(|h| h.value().clone()).collect()
    }

    pub fn codes(&self) -> Vec<MessageCode> {
        let mut codes: Vec<_> = self.handlers.iter().map(|h| *h.key()).collect();
        codes.sort_unstable();
        codes
    }

    /// Append an interceptor to the end of the chain.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    pub fn interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn run_before(&self, ctx: &Context, env: &Envelope) -> Result<(), DispatchError> {
        interceptor::run_before(&self.interceptors(), ctx, env)
    }

    pub fn run_after(&self, ctx: &Context, env: &Envelope) {
        interceptor::run_after(&self.interceptors(), ctx, env)
    }
}

impl Env for Registry {
    /// Register `handler` under `code`, calling its `on_init` first.
    ///
    /// A code that is already taken is rejected before `on_init` runs. If
    /// another registration wins the code while `on_init` runs, the handler
    /// is given `on_remove` and the call still fails.
    fn add_handler(&self, code: MessageCode, handler: Arc<dyn Handler>) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&code) {
            return Err(RegistryError::Duplicate(code));
        }
        handler.on_init(self)?;
        match self.handlers.entry(code) {
            Entry::Vacant(slot) => {
                slot.insert(handler);
                tracing::debug!(code, "handler registered");
                Ok(())
            }
            Entry::Occupied(_) => {
                handler.on_remove(self);
                Err(RegistryError::Duplicate(code))
            }
        }
    }

    fn remove_handler(&self, code: MessageCode) -> Option<Arc<dyn Handler>> {
        let (_, handler) = self.handlers.remove(&code)?;
        handler.on_remove(self);
        tracing::debug!(code, "handler removed");
        Some(handler)
    }
}
