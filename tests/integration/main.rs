//! natter integration test harness.
//!
//! Every test starts its own server on `127.0.0.1:0` and talks to it with
//! real client runtimes (or raw sockets for protocol-violation cases), so
//! tests never share state and can run in parallel.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use natter_core::config::{LivenessConfig, TransferConfig};
use natter_core::{derive_id, Envelope, LoginMsg, MessageType};
use natter_services::{
    Client, ClientSettings, Context, CountInterceptor, DisplayHandler, Env, FileTransfer,
    OnlineUsers, Outbound, PingHandler, PongHandler, Registry, Server, SessionSettings,
    SessionTable, UserHandler, USER_HANDLER_CODE,
};

mod files;
mod liveness;
mod messaging;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: String,
    pub sessions: SessionTable,
    pub users: OnlineUsers,
    pub pong: Arc<PongHandler>,
    pub counter: Arc<CountInterceptor>,
}

/// Chat server wired the way natterd wires it.
pub async fn start_server(liveness: LivenessConfig) -> TestServer {
    let registry = Registry::new();
    let counter = Arc::new(CountInterceptor::new());
    let pong = Arc::new(PongHandler::from_config(&liveness));
    let users = OnlineUsers::new();
    registry.add_interceptor(counter.clone());
    registry
        .add_handler(MessageType::Display.code(), Arc::new(DisplayHandler::logging()))
        .unwrap();
    registry.add_handler(MessageType::Pong.code(), pong.clone()).unwrap();
    registry
        .add_handler(USER_HANDLER_CODE, Arc::new(UserHandler::new(users.clone())))
        .unwrap();

    let (addr, sessions) = serve(registry).await;
    TestServer {
        addr,
        sessions,
        users,
        pong,
        counter,
    }
}

/// Serve `registry` on an ephemeral port.
pub async fn serve(registry: Arc<Registry>) -> (String, SessionTable) {
    let server = Server::bind("127.0.0.1:0", registry, SessionSettings::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let sessions = server.sessions();
    tokio::spawn(server.serve());
    (addr, sessions)
}

pub struct TestClient {
    pub ctx: Context,
    pub outbound: Outbound,
    pub transfers: Arc<FileTransfer>,
    displays: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl TestClient {
    pub async fn connect(addr: &str, transfer: TransferConfig) -> Self {
        let (tx, displays) = mpsc::unbounded_channel();
        let registry = Registry::new();
        registry
            .add_handler(MessageType::Ping.code(), Arc::new(PingHandler))
            .unwrap();
        registry
            .add_handler(
                MessageType::Display.code(),
                Arc::new(DisplayHandler::new(move |text| {
                    let _ = tx.send(text.to_string());
                })),
            )
            .unwrap();

        let client = Client::dial(addr, registry.clone(), ClientSettings::default())
            .await
            .unwrap();
        let transfers = Arc::new(FileTransfer::new(client.outbound(), &transfer));
        registry
            .add_handler(MessageType::FileTransfer.code(), transfers.clone())
            .unwrap();

        let ctx = client.context();
        let outbound = client.outbound();
        let task = tokio::spawn(client.start());
        Self {
            ctx,
            outbound,
            transfers,
            displays,
            task,
        }
    }

    /// Identity the server derives for this client.
    pub fn id(&self) -> String {
        derive_id(self.ctx.local_addr())
    }

    pub async fn send(&self, env: Envelope) {
        self.outbound.send(env).await.unwrap();
    }

    /// Log in and consume the greeting, the welcome and our own
    /// "is online" broadcast.
    pub async fn login(&mut self, nickname: &str) {
        self.expect_display(|t| t == "hello, please login").await;
        self.send(
            Envelope::new(
                MessageType::UserLogin,
                &LoginMsg {
                    nickname: nickname.into(),
                },
            )
            .unwrap(),
        )
        .await;
        self.expect_display(|t| t.starts_with("login success")).await;
        let online = format!("{nickname} is online");
        self.expect_display(|t| t == online).await;
    }

    pub async fn next_display(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.displays.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skip display lines until one matches.
    pub async fn expect_display(&mut self, mut matches: impl FnMut(&str) -> bool) -> String {
        loop {
            match self.next_display().await {
                Some(text) if matches(&text) => return text,
                Some(_) => continue,
                None => panic!("expected display line never arrived"),
            }
        }
    }

    /// True if no display line arrives within `window`.
    pub async fn quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.displays.recv())
            .await
            .is_err()
    }

    pub async fn close(self) {
        self.ctx.close().await;
        let _ = self.task.await;
    }
}

/// Raw socket that has completed the handshake.
pub async fn raw_connect(addr: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    natter_services::session::handshake::write_handshake(
        &mut stream,
        natter_core::CodecType::Json,
    )
    .await
    .unwrap();
    stream
}

/// Poll `check` until it returns true or `WAIT` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("natter-it-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn quick_transfers() -> TransferConfig {
    TransferConfig {
        timeout_secs: 1,
        sweep_interval_ms: 100,
        ..TransferConfig::default()
    }
}
