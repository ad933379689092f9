//! Server runtime — accepts connections and runs one task per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

use natter_core::EnvelopeCodec;

use super::connection::{self, UnknownCodePolicy};
use super::handshake::read_handshake;
use super::{new_session_table, Context, SessionError, SessionSettings, SessionTable};
use crate::registry::Registry;

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    sessions: SessionTable,
    settings: SessionSettings,
}

impl Server {
    pub async fn bind(
        addr: &str,
        registry: Arc<Registry>,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            registry,
            sessions: new_session_table(),
            settings,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live connections keyed by remote address.
    pub fn sessions(&self) -> SessionTable {
        self.sessions.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept connections forever. Accept errors are logged and retried.
    pub async fn serve(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            tokio::spawn(handle_connection(
                stream,
                peer,
                self.registry.clone(),
                self.sessions.clone(),
                self.settings.clone(),
            ));
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    sessions: SessionTable,
    settings: SessionSettings,
) {
    let remote = peer.to_string();
    let local = stream
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let (mut read_half, write_half) = stream.into_split();

    let codec = match read_handshake(&mut read_half, settings.handshake_timeout).await {
        Ok(codec) => codec,
        Err(e) => {
            tracing::warn!(remote = %remote, error = %e, "handshake failed");
            return;
        }
    };
    let codec = EnvelopeCodec::new(codec).with_max_len(settings.max_envelope_bytes);

    let ctx = Context::new(remote.clone(), local, write_half, codec.clone(), registry);
    sessions.insert(remote.clone(), ctx.clone());
    tracing::info!(remote = %remote, "connection active");

    connection::activate(&ctx).await;
    connection::read_loop(
        &ctx,
        FramedRead::new(read_half, codec),
        UnknownCodePolicy::Terminate,
    )
    .await;

    ctx.close().await;
    sessions.remove_if(&remote, |_, c| c.same_session(&ctx));
    connection::deactivate(&ctx).await;
    tracing::info!(remote = %remote, "connection closed");
}
