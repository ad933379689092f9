//! Online-user directory and the server handlers built on it.
//!
//! [`UserHandler`] is registered under [`USER_HANDLER_CODE`], which no
//! envelope ever carries. Its `on_init` registers the login, logout,
//! user-list, send-message and file-relay handlers, all sharing one
//! [`OnlineUsers`] table keyed by derived identity.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use natter_core::{derive_id, Envelope, FileTransferEntity, LoginMsg, MessageCode, MessageType};

use crate::registry::RegistryError;
use crate::service::{Env, Handler};
use crate::session::Context;

/// Pseudo code for the aggregate user handler.
pub const USER_HANDLER_CODE: MessageCode = -100;

const USER_LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct OnlineUser {
    pub ctx: Context,
    pub nickname: String,
    pub id: String,
}

/// Logged-in users keyed by derived identity.
#[derive(Debug, Clone, Default)]
pub struct OnlineUsers {
    users: Arc<DashMap<String, OnlineUser>>,
}

impl OnlineUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<OnlineUser> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Up to `limit` users, in no particular order.
    pub fn snapshot(&self, limit: usize) -> Vec<OnlineUser> {
        self.users
            .iter()
            .take(limit)
            .map(|u| u.value().clone())
            .collect()
    }

    fn insert(&self, user: OnlineUser) {
        self.users.insert(user.id.clone(), user);
    }

    fn remove(&self, id: &str) -> Option<OnlineUser> {
        self.users.remove(id).map(|(_, u)| u)
    }

    /// Remove `ctx`'s entry only if it still belongs to that session.
    fn remove_session(&self, ctx: &Context) -> Option<OnlineUser> {
        self.users
            .remove_if(ctx.peer_id(), |_, u| u.ctx.same_session(ctx))
            .map(|(_, u)| u)
    }

    /// The caller's user, or a "please login" reply and `None`.
    async fn check_login(&self, ctx: &Context) -> Option<OnlineUser> {
        let user = self.get(ctx.peer_id());
        if user.is_none() {
            if let Err(e) = ctx.write(Envelope::display("please login")).await {
                tracing::debug!(remote = ctx.remote_addr(), error = %e, "write failed");
                ctx.close().await;
            }
        }
        user
    }

    /// Send `env` to every logged-in user. Recipients whose write fails are
    /// closed and removed.
    pub async fn broadcast(&self, env: Envelope) {
        for user in self.snapshot(USER_LIST_LIMIT) {
            if let Err(e) = user.ctx.write(env.clone()).await {
                tracing::debug!(remote = user.ctx.remote_addr(), error = %e, "broadcast write failed");
                self.remove_session(&user.ctx);
                user.ctx.close().await;
            }
        }
    }

    /// Broadcast from a background task so a slow recipient cannot stall
    /// the caller's read loop.
    fn spawn_broadcast(&self, text: String) {
        let users = self.clone();
        tokio::spawn(async move { users.broadcast(Envelope::display(text)).await });
    }
}

// ── Aggregate handler ─────────────────────────────────────────────────────────

pub struct UserHandler {
    users: OnlineUsers,
    routes: Vec<(MessageCode, Arc<dyn Handler>)>,
}

impl UserHandler {
    pub fn new(users: OnlineUsers) -> Self {
        let routes: Vec<(MessageCode, Arc<dyn Handler>)> = vec![
            (MessageType::UserLogin.code(), Arc::new(LoginHandler { users: users.clone() })),
            (MessageType::UserLogout.code(), Arc::new(LogoutHandler { users: users.clone() })),
            (MessageType::GetOnlineUserList.code(), Arc::new(UserListHandler { users: users.clone() })),
            (MessageType::SendMessage.code(), Arc::new(SendMessageHandler { users: users.clone() })),
            (MessageType::FileTransfer.code(), Arc::new(FileRelayHandler { users: users.clone() })),
        ];
        Self { users, routes }
    }

    pub fn users(&self) -> &OnlineUsers {
        &self.users
    }
}

#[async_trait]
impl Handler for UserHandler {
    async fn on_active(&self, ctx: &Context) {
        if let Err(e) = ctx.write(Envelope::display("hello, please login")).await {
            tracing::debug!(remote = ctx.remote_addr(), error = %e, "greeting failed");
        }
    }

    fn on_init(&self, env: &dyn Env) -> Result<(), RegistryError> {
        for (i, (code, handler)) in self.routes.iter().enumerate() {
            if let Err(e) = env.add_handler(*code, handler.clone()) {
                for (added, _) in &self.routes[..i] {
                    env.remove_handler(*added);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_remove(&self, env: &dyn Env) {
        for (code, _) in &self.routes {
            env.remove_handler(*code);
        }
    }
}

// ── Route handlers ────────────────────────────────────────────────────────────

struct LoginHandler {
    users: OnlineUsers,
}

#[async_trait]
impl Handler for LoginHandler {
    async fn on_message(&self, ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        let login = match env.decode::<LoginMsg>() {
            Ok(login) => login,
            Err(_) => {
                self.users.remove_session(ctx);
                let _ = ctx.write(Envelope::display("invalid data")).await;
                ctx.close().await;
                anyhow::bail!("invalid login payload");
            }
        };
        if login.nickname.trim().is_empty() {
            ctx.write(Envelope::display("nickname must not be empty")).await?;
            return Ok(());
        }

        let id = ctx.peer_id().to_string();
        if let Some(existing) = self.users.get(&id) {
            if !existing.ctx.is_closed() {
                ctx.write(Envelope::display("you are already logged in")).await?;
                return Ok(());
            }
        }

        let nickname = login.nickname.trim().to_string();
        self.users.insert(OnlineUser {
            ctx: ctx.clone(),
            nickname: nickname.clone(),
            id: id.clone(),
        });
        let welcome = format!(
            "login success, your address is {}, ID={}",
            ctx.remote_addr(),
            id
        );
        if let Err(e) = ctx.write(Envelope::display(welcome)).await {
            self.users.remove_session(ctx);
            ctx.close().await;
            return Err(e.into());
        }
        tracing::info!(remote = ctx.remote_addr(), nickname = %nickname, id = %id, "user logged in");
        self.users.spawn_broadcast(format!("{nickname} is online"));
        Ok(())
    }

    async fn on_close(&self, ctx: &Context) {
        if let Some(user) = self.users.remove_session(ctx) {
            tracing::info!(remote = ctx.remote_addr(), nickname = %user.nickname, "user went offline");
            self.users.spawn_broadcast(format!("{} went offline", user.nickname));
        }
    }
}

struct LogoutHandler {
    users: OnlineUsers,
}

#[async_trait]
impl Handler for LogoutHandler {
    async fn on_message(&self, ctx: &Context, _env: &Envelope) -> anyhow::Result<()> {
        let Some(user) = self.users.check_login(ctx).await else {
            return Ok(());
        };
        self.users.remove(&user.id);
        ctx.write(Envelope::display("logout success")).await?;
        self.users.spawn_broadcast(format!("{} left", user.nickname));
        Ok(())
    }
}

struct UserListHandler {
    users: OnlineUsers,
}

#[async_trait]
impl Handler for UserListHandler {
    async fn on_message(&self, ctx: &Context, _env: &Envelope) -> anyhow::Result<()> {
        if self.users.check_login(ctx).await.is_none() {
            return Ok(());
        }
        let users = self.users.snapshot(USER_LIST_LIMIT);
        let mut text = format!("online user number: {}\n", users.len());
        for user in &users {
            text.push_str(&format!("ID={}, nickname={}\n", user.id, user.nickname));
        }
        if let Err(e) = ctx.write(Envelope::display(text)).await {
            ctx.close().await;
            return Err(e.into());
        }
        Ok(())
    }
}

struct SendMessageHandler {
    users: OnlineUsers,
}

#[async_trait]
impl Handler for SendMessageHandler {
    async fn on_message(&self, ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        let Some(user) = self.users.check_login(ctx).await else {
            return Ok(());
        };
        let text: String = env.decode()?;
        self.users
            .spawn_broadcast(format!("{}, ID:{}\n\t{}", user.nickname, user.id, text));
        Ok(())
    }
}

/// Forwards file-transfer records between logged-in users after checking
/// the declared sender.
struct FileRelayHandler {
    users: OnlineUsers,
}

#[async_trait]
impl Handler for FileRelayHandler {
    async fn on_message(&self, ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        if self.users.check_login(ctx).await.is_none() {
            return Ok(());
        }
        let entity: FileTransferEntity = env.decode()?;
        let own_id = derive_id(ctx.remote_addr());
        if entity.from != own_id {
            tracing::warn!(remote = ctx.remote_addr(), claimed = %entity.from, "spoofed file transfer sender");
            ctx.write(Envelope::display(format!(
                "dont send fake message, your id is {own_id}"
            )))
            .await?;
            return Ok(());
        }
        let Some(receiver) = self.users.get(&entity.to) else {
            ctx.write(Envelope::display("not found receiver")).await?;
            return Ok(());
        };
        if let Err(e) = receiver.ctx.write(env.clone()).await {
            tracing::debug!(remote = receiver.ctx.remote_addr(), error = %e, "relay write failed");
            self.users.remove_session(&receiver.ctx);
            receiver.ctx.close().await;
        }
        Ok(())
    }
}
