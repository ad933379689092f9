//! File transfer state machine — stop-and-wait chunked transfer between
//! two logged-in clients, relayed by the server.
//!
//! Each client keeps two independent tracks, each behind its own lock:
//!
//! - **send**: `notify_send_file` offers a file (`WAITING_SEND`). Every
//!   `ACK` from the receiver pulls the next chunk (`SENDING`) until the last
//!   one (`COMPLETED`). A `REJECT` before the first chunk drops the offer.
//! - **receive**: an offer is stored until the user calls `confirm` (which
//!   creates the destination and replies `ACK`) or `reject`. While one
//!   receive is pending, further offers are rejected automatically.
//!
//! Records that do not match the stored transfer are logged and dropped.
//! A sweep task abandons a track once it has been idle longer than the
//! configured timeout; an abandoned receive deletes its partial file.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use natter_core::config::TransferConfig;
use natter_core::{Envelope, FileTransferEntity, MessageType, TransferState};

use crate::registry::RegistryError;
use crate::service::{Env, Handler};
use crate::session::initiator::{Outbound, SendError};
use crate::session::Context;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("a file is already being sent, wait for it to finish")]
    Busy,
    #[error("{0} is a directory, only regular files can be sent")]
    IsDirectory(PathBuf),
    #[error("{0} already exists")]
    DestinationExists(PathBuf),
    #[error("invalid destination {0}")]
    InvalidDestination(PathBuf),
    #[error("no pending file offer")]
    NoPendingReceive,
    #[error("pending transfer is in state {0:?}")]
    WrongState(TransferState),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] SendError),
}

// ── Tracks ────────────────────────────────────────────────────────────────────

struct SendState {
    entity: FileTransferEntity,
    file: File,
    sent_bytes: u64,
    blocks: u64,
}

struct ReceiveState {
    entity: FileTransferEntity,
    file: Option<File>,
    path: Option<PathBuf>,
    blocks: u64,
}

/// One side of the state machine: its state plus the time of its last
/// activity, in milliseconds since the transfer origin (0 = idle).
///
/// `last_activity` is readable without the lock so the sweep can skip idle
/// tracks cheaply, then re-check under the lock.
struct Track<S> {
    state: Mutex<Option<S>>,
    last_activity: AtomicU64,
}

impl<S> Track<S> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            last_activity: AtomicU64::new(0),
        }
    }

    fn touch(&self, origin: Instant) {
        let ms = origin.elapsed().as_millis() as u64 + 1;
        self.last_activity.store(ms, Ordering::Release);
    }

    fn idle(&self) {
        self.last_activity.store(0, Ordering::Release);
    }

    fn expired(&self, origin: Instant, timeout: Duration) -> bool {
        let last = self.last_activity.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        let now = origin.elapsed().as_millis() as u64 + 1;
        now.saturating_sub(last) > timeout.as_millis() as u64
    }
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// Client-side file transfer handler, registered under
/// [`MessageType::FileTransfer`].
pub struct FileTransfer {
    inner: Arc<Transfers>,
}

struct Transfers {
    outbound: Outbound,
    chunk_size: usize,
    timeout: Duration,
    sweep_interval: Duration,
    origin: Instant,
    send: Track<SendState>,
    receive: Track<ReceiveState>,
    generation: AtomicU64,
}

impl FileTransfer {
    pub fn new(outbound: Outbound, config: &TransferConfig) -> Self {
        Self {
            inner: Arc::new(Transfers {
                outbound,
                chunk_size: config.chunk_size.max(1),
                timeout: config.timeout(),
                sweep_interval: config.sweep_interval(),
                origin: Instant::now(),
                send: Track::new(),
                receive: Track::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Offer `path` to `remote_id`. Returns once the offer is queued.
    pub async fn notify_send_file(
        &self,
        local_id: &str,
        remote_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), TransferError> {
        let path = path.as_ref();
        let inner = &self.inner;
        let mut state = inner.send.state.lock().await;
        if state.is_some() {
            return Err(TransferError::Busy);
        }

        let meta = tokio::fs::metadata(path).await?;
        if meta.is_dir() {
            return Err(TransferError::IsDirectory(path.to_path_buf()));
        }
        let file = File::open(path).await?;
        let entity = FileTransferEntity {
            file_size: meta.len(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            to: remote_id.to_string(),
            from: local_id.to_string(),
            content: String::new(),
            state: TransferState::WaitingSend,
        };

        inner
            .outbound
            .send(Envelope::new(MessageType::FileTransfer, &entity)?)
            .await?;
        tracing::info!(
            file = %entity.file_name,
            size = entity.file_size,
            to = %entity.to,
            "file offered"
        );
        *state = Some(SendState {
            entity,
            file,
            sent_bytes: 0,
            blocks: 0,
        });
        inner.send.touch(inner.origin);
        Ok(())
    }

    /// Accept the pending offer, writing it to `path`.
    pub async fn confirm(&self, path: impl AsRef<Path>) -> Result<(), TransferError> {
        let path = path.as_ref();
        let inner = &self.inner;
        let mut guard = inner.receive.state.lock().await;
        let pending = guard.as_mut().ok_or(TransferError::NoPendingReceive)?;
        if pending.entity.state != TransferState::WaitingSend {
            return Err(TransferError::WrongState(pending.entity.state));
        }
        if path.as_os_str().is_empty()
            || path.as_os_str().to_string_lossy().ends_with(MAIN_SEPARATOR)
        {
            return Err(TransferError::InvalidDestination(path.to_path_buf()));
        }
        if path.is_dir() {
            return Err(TransferError::IsDirectory(path.to_path_buf()));
        }
        if path.exists() {
            return Err(TransferError::DestinationExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let ack = pending.entity.reply(TransferState::Ack);
        pending.file = Some(file);
        pending.path = Some(path.to_path_buf());
        pending.entity.state = TransferState::Accept;

        if let Err(e) = inner
            .outbound
            .send(Envelope::new(MessageType::FileTransfer, &ack)?)
            .await
        {
            if let Some(state) = guard.take() {
                discard_receive(state).await;
            }
            inner.receive.idle();
            return Err(e.into());
        }
        tracing::info!(path = %path.display(), "receiving file");
        inner.receive.touch(inner.origin);
        Ok(())
    }

    /// Decline the pending offer.
    pub async fn reject(&self) -> Result<(), TransferError> {
        let inner = &self.inner;
        let mut guard = inner.receive.state.lock().await;
        let pending = guard.as_ref().ok_or(TransferError::NoPendingReceive)?;
        if pending.entity.state != TransferState::WaitingSend {
            return Err(TransferError::WrongState(pending.entity.state));
        }
        let reply = pending.entity.reply(TransferState::Reject);
        *guard = None;
        inner.receive.idle();
        inner
            .outbound
            .send(Envelope::new(MessageType::FileTransfer, &reply)?)
            .await?;
        Ok(())
    }

    pub async fn is_sending(&self) -> bool {
        self.inner.send.state.lock().await.is_some()
    }

    pub async fn is_receiving(&self) -> bool {
        self.inner.receive.state.lock().await.is_some()
    }

    /// The stored receive-track record, if any.
    pub async fn pending_receive(&self) -> Option<FileTransferEntity> {
        self.inner
            .receive
            .state
            .lock()
            .await
            .as_ref()
            .map(|s| s.entity.clone())
    }

    /// Abandon any track idle for longer than the timeout.
    pub async fn expire_stale(&self) {
        self.inner.expire_stale().await;
    }
}

impl Transfers {
    /// Advance the state machine with one inbound record. Returns the reply
    /// to write back, if any.
    async fn handle(&self, entity: FileTransferEntity) -> anyhow::Result<Option<Envelope>> {
        let reply = match entity.state {
            TransferState::WaitingSend => self.on_offer(entity).await,
            TransferState::Reject => {
                self.on_reject(entity).await;
                None
            }
            TransferState::Ack => self.on_ack(entity).await?,
            TransferState::Sending => self.on_chunk(entity, false).await?,
            TransferState::Completed => self.on_chunk(entity, true).await?,
            TransferState::Accept => {
                tracing::warn!("unexpected ACCEPT record, dropping");
                None
            }
        };
        reply
            .map(|e| Envelope::new(MessageType::FileTransfer, &e))
            .transpose()
            .map_err(Into::into)
    }

    async fn on_offer(&self, offer: FileTransferEntity) -> Option<FileTransferEntity> {
        let mut guard = self.receive.state.lock().await;
        if guard.is_some() {
            tracing::info!(
                from = %offer.from,
                file = %offer.file_name,
                size = offer.file_size,
                "busy receiving, rejecting file offer"
            );
            return Some(offer.reply(TransferState::Reject));
        }
        tracing::info!(
            from = %offer.from,
            file = %offer.file_name,
            size = offer.file_size,
            "file offered, reply with confirm <path> or reject"
        );
        *guard = Some(ReceiveState {
            entity: offer,
            file: None,
            path: None,
            blocks: 0,
        });
        self.receive.touch(self.origin);
        None
    }

    async fn on_reject(&self, reply: FileTransferEntity) {
        let mut guard = self.send.state.lock().await;
        let Some(state) = guard.as_ref() else {
            tracing::warn!("REJECT with no outstanding offer, dropping");
            return;
        };
        if !state.entity.answered_by(&reply) {
            tracing::warn!(from = %reply.from, "REJECT from unexpected peer, dropping");
            return;
        }
        if state.entity.state != TransferState::WaitingSend {
            tracing::warn!(state = ?state.entity.state, "REJECT after transfer started, dropping");
            return;
        }
        *guard = None;
        self.send.idle();
        tracing::info!(to = %reply.from, "file offer rejected");
    }

    async fn on_ack(&self, ack: FileTransferEntity) -> anyhow::Result<Option<FileTransferEntity>> {
        let mut guard = self.send.state.lock().await;
        let Some(state) = guard.as_mut() else {
            tracing::warn!("ACK with no outstanding send, dropping");
            return Ok(None);
        };
        if !state.entity.answered_by(&ack) {
            tracing::warn!(from = %ack.from, "ACK from unexpected peer, dropping");
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let n = read_full(&mut state.file, &mut buf).await?;
        state.sent_bytes += n as u64;
        state.blocks += 1;
        let done = n < buf.len() || state.sent_bytes >= state.entity.file_size;

        state.entity.content = STANDARD.encode(&buf[..n]);
        state.entity.state = if done {
            TransferState::Completed
        } else {
            TransferState::Sending
        };
        tracing::info!(
            bytes = n,
            block = state.blocks,
            total = state.entity.expected_blocks(self.chunk_size),
            "sent file block"
        );
        let chunk = state.entity.clone();
        state.entity.content.clear();

        if done {
            *guard = None;
            self.send.idle();
            tracing::info!(file = %chunk.file_name, "file sent");
        } else {
            self.send.touch(self.origin);
        }
        Ok(Some(chunk))
    }

    async fn on_chunk(
        &self,
        chunk: FileTransferEntity,
        last: bool,
    ) -> anyhow::Result<Option<FileTransferEntity>> {
        let mut guard = self.receive.state.lock().await;
        let Some(state) = guard.as_mut() else {
            tracing::warn!("file block with no pending receive, dropping");
            return Ok(None);
        };
        if !state.entity.same_transfer(&chunk) {
            tracing::warn!(from = %chunk.from, file = %chunk.file_name, "file block does not match pending receive, dropping");
            return Ok(None);
        }
        if state.entity.state != TransferState::Accept {
            tracing::warn!(state = ?state.entity.state, "file block before confirm, dropping");
            return Ok(None);
        }
        let Some(file) = state.file.as_mut() else {
            tracing::warn!("file block with no destination open, dropping");
            return Ok(None);
        };

        let bytes = STANDARD.decode(chunk.content.as_bytes())?;
        file.write_all(&bytes).await?;
        state.blocks += 1;
        self.receive.touch(self.origin);
        tracing::info!(
            bytes = bytes.len(),
            block = state.blocks,
            total = state.entity.expected_blocks(self.chunk_size),
            "received file block"
        );

        if !last {
            return Ok(Some(state.entity.reply(TransferState::Ack)));
        }

        file.flush().await?;
        file.sync_all().await?;
        if let Some(path) = &state.path {
            tracing::info!(path = %path.display(), "file received");
        }
        *guard = None;
        self.receive.idle();
        Ok(None)
    }

    async fn expire_stale(&self) {
        if self.send.expired(self.origin, self.timeout) {
            let mut guard = self.send.state.lock().await;
            if self.send.expired(self.origin, self.timeout) {
                if let Some(state) = guard.take() {
                    tracing::warn!(file = %state.entity.file_name, "file send timed out, releasing file");
                }
                self.send.idle();
            }
        }

        if self.receive.expired(self.origin, self.timeout) {
            let mut guard = self.receive.state.lock().await;
            if self.receive.expired(self.origin, self.timeout) {
                if let Some(state) = guard.take() {
                    tracing::warn!(file = %state.entity.file_name, "file receive timed out");
                    discard_receive(state).await;
                }
                self.receive.idle();
            }
        }
    }
}

/// Close and delete a partially written destination.
async fn discard_receive(state: ReceiveState) {
    let ReceiveState { file, path, .. } = state;
    drop(file);
    if let Some(path) = path {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::info!(path = %path.display(), "removed partial file"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove partial file"),
        }
    }
}

/// Fill `buf` unless the file ends first. Returns the number of bytes read.
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn sweep(transfers: Weak<Transfers>, interval: Duration, generation: u64) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(transfers) = transfers.upgrade() else {
            break;
        };
        if transfers.generation.load(Ordering::Acquire) != generation {
            break;
        }
        transfers.expire_stale().await;
    }
}

#[async_trait]
impl Handler for FileTransfer {
    async fn on_message(&self, ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        let entity: FileTransferEntity = env.decode()?;
        if let Some(reply) = self.inner.handle(entity).await? {
            ctx.write(reply).await?;
        }
        Ok(())
    }

    fn on_init(&self, _env: &dyn Env) -> Result<(), RegistryError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(sweep(
                    Arc::downgrade(&self.inner),
                    self.inner.sweep_interval,
                    generation,
                ));
            }
            Err(_) => tracing::warn!("no async runtime, transfer sweep not started"),
        }
        Ok(())
    }

    fn on_remove(&self, _env: &dyn Env) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }
}
