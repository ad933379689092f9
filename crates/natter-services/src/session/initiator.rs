//! Client runtime — dials a server and decouples application sends from
//! network writes through a bounded outbound queue.

use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::FramedRead;

use natter_core::config::ClientConfig;
use natter_core::{CodecType, Envelope, EnvelopeCodec, QueuePolicy};

use super::connection::{self, UnknownCodePolicy};
use super::handshake::write_handshake;
use super::{Context, SessionError, SessionSettings};
use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub session: SessionSettings,
    pub outbound_capacity: usize,
    pub queue_policy: QueuePolicy,
}

impl ClientSettings {
    pub fn from_config(client: &ClientConfig, session: SessionSettings) -> Self {
        Self {
            session,
            outbound_capacity: client.outbound_capacity,
            queue_policy: client.queue_policy,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default(), SessionSettings::default())
    }
}

/// Cloneable handle for queueing envelopes to the server.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Envelope>,
    policy: QueuePolicy,
}

impl Outbound {
    pub fn channel(capacity: usize, policy: QueuePolicy) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, policy }, rx)
    }

    /// Queue one envelope. Never waits on network I/O; under
    /// [`QueuePolicy::Block`] it waits only for queue capacity.
    pub async fn send(&self, env: Envelope) -> Result<(), SendError> {
        match self.policy {
            QueuePolicy::Block => self.tx.send(env).await.map_err(|_| SendError::Closed),
            QueuePolicy::Reject => self.tx.try_send(env).map_err(|e| match e {
                TrySendError::Full(_) => SendError::Full,
                TrySendError::Closed(_) => SendError::Closed,
            }),
            QueuePolicy::DropNewest => match self.tx.try_send(env) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(env)) => {
                    tracing::warn!(code = env.code, "outbound queue full, dropping envelope");
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(SendError::Closed),
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct Client {
    ctx: Context,
    reader: FramedRead<OwnedReadHalf, EnvelopeCodec>,
    outbound: Outbound,
    queue: mpsc::Receiver<Envelope>,
}

impl Client {
    /// Connect and send the handshake header.
    pub async fn dial(
        addr: &str,
        registry: Arc<Registry>,
        settings: ClientSettings,
    ) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr).await?;
        let remote = stream.peer_addr()?.to_string();
        let local = stream.local_addr()?.to_string();
        let (read_half, mut write_half) = stream.into_split();

        write_handshake(&mut write_half, CodecType::Json).await?;
        tracing::info!(remote = %remote, local = %local, "connected");

        let codec =
            EnvelopeCodec::new(CodecType::Json).with_max_len(settings.session.max_envelope_bytes);
        let ctx = Context::new(remote, local, write_half, codec.clone(), registry);
        let (outbound, queue) = Outbound::channel(settings.outbound_capacity, settings.queue_policy);

        Ok(Self {
            ctx,
            reader: FramedRead::new(read_half, codec),
            outbound,
            queue,
        })
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    /// Run the connection until it closes: start the writer task, activate
    /// handlers, read and dispatch, then deactivate.
    pub async fn start(self) {
        let Self {
            ctx,
            reader,
            outbound,
            queue,
        } = self;
        drop(outbound);

        let writer = tokio::spawn(drain(ctx.clone(), queue));

        connection::activate(&ctx).await;
        connection::read_loop(&ctx, reader, UnknownCodePolicy::Skip).await;

        ctx.close().await;
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "outbound writer task failed");
        }
        connection::deactivate(&ctx).await;
        tracing::info!(remote = ctx.remote_addr(), "disconnected");
    }
}

/// Single writer for the outbound queue.
async fn drain(ctx: Context, mut queue: mpsc::Receiver<Envelope>) {
    loop {
        let env = tokio::select! {
            _ = ctx.closed() => break,
            next = queue.recv() => match next {
                Some(env) => env,
                None => break,
            },
        };
        if let Err(e) = ctx.write(env).await {
            tracing::warn!(remote = ctx.remote_addr(), error = %e, "outbound write failed");
            ctx.close().await;
            break;
        }
    }
}
