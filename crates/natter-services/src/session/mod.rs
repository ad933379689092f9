//! Session management — per-connection [`Context`] and the server's
//! connection table.

pub mod connection;
pub mod handshake;
pub mod initiator;
pub mod listener;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use natter_core::config::WireConfig;
use natter_core::{derive_id, Envelope, EnvelopeCodec, MessageCode, WireError};

use crate::registry::{Registry, RegistryError};
use crate::service::{Env, Handler};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to one live connection. Cheap to clone; all clones share the
/// same write half and closed flag.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    remote_addr: String,
    local_addr: String,
    peer_id: String,
    writer: Mutex<FramedWrite<BoxedWriter, EnvelopeCodec>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    registry: Arc<Registry>,
}

impl Context {
    pub fn new<W>(
        remote_addr: impl Into<String>,
        local_addr: impl Into<String>,
        writer: W,
        codec: EnvelopeCodec,
        registry: Arc<Registry>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let remote_addr = remote_addr.into();
        Self {
            inner: Arc::new(Inner {
                peer_id: derive_id(&remote_addr),
                remote_addr,
                local_addr: local_addr.into(),
                writer: Mutex::new(FramedWrite::new(Box::new(writer) as BoxedWriter, codec)),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                registry,
            }),
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Derived identity of the remote address.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// True when both handles refer to the same connection.
    pub fn same_session(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Encode and write one envelope after running the after-hooks.
    ///
    /// Writes from different tasks are serialized; a write blocked on a
    /// slow peer is abandoned when the context closes.
    pub async fn write(&self, env: Envelope) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.inner.registry.run_after(self, &env);
        let mut writer = tokio::select! {
            writer = self.inner.writer.lock() => writer,
            _ = self.inner.cancel.cancelled() => return Err(SessionError::Closed),
        };
        tokio::select! {
            result = writer.send(env) => result.map_err(SessionError::Wire),
            _ = self.inner.cancel.cancelled() => Err(SessionError::Closed),
        }
    }

    /// Mark the connection closed and shut down its write half.
    /// Only the first call has any effect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            tracing::debug!(remote = self.remote_addr(), error = %e, "shutdown failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }
}

impl Env for Context {
    fn add_handler(&self, code: MessageCode, handler: Arc<dyn Handler>) -> Result<(), RegistryError> {
        self.inner.registry.add_handler(code, handler)
    }

    fn remove_handler(&self, code: MessageCode) -> Option<Arc<dyn Handler>> {
        self.inner.registry.remove_handler(code)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("remote_addr", &self.inner.remote_addr)
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Live connections keyed by remote address — shared across all tasks.
pub type SessionTable = Arc<DashMap<String, Context>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// Wire-level knobs shared by the listener and the initiator.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub max_envelope_bytes: usize,
}

impl SessionSettings {
    pub fn from_config(wire: &WireConfig) -> Self {
        Self {
            handshake_timeout: wire.handshake_timeout(),
            max_envelope_bytes: wire.max_envelope_bytes,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&WireConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A context over an in-memory pipe. The returned half reads what the
/// context writes.
#[cfg(test)]
pub(crate) fn test_context() -> (Context, tokio::io::DuplexStream) {
    test_context_with(Registry::new())
}

#[cfg(test)]
pub(crate) fn test_context_with(registry: Arc<Registry>) -> (Context, tokio::io::DuplexStream) {
    test_context_at(&registry, "127.0.0.1:40001", 1 << 20)
}

/// Like [`test_context_with`], with a chosen remote address and pipe size.
#[cfg(test)]
pub(crate) fn test_context_at(
    registry: &Arc<Registry>,
    remote_addr: &str,
    capacity: usize,
) -> (Context, tokio::io::DuplexStream) {
    let (ours, theirs) = tokio::io::duplex(capacity);
    let ctx = Context::new(
        remote_addr,
        "127.0.0.1:8080",
        ours,
        EnvelopeCodec::default(),
        registry.clone(),
    );
    (ctx, theirs)
}
