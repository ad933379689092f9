//! natter-services — handler runtime, connection sessions, and the chat
//! services that run on top of them.

pub mod directory;
pub mod dispatch;
pub mod display;
pub mod file_transfer;
pub mod interceptor;
pub mod liveness;
pub mod registry;
pub mod service;
pub mod session;

pub use directory::{OnlineUser, OnlineUsers, UserHandler, USER_HANDLER_CODE};
pub use dispatch::DispatchError;
pub use display::DisplayHandler;
pub use file_transfer::{FileTransfer, TransferError};
pub use interceptor::{CountInterceptor, Interceptor};
pub use liveness::{PingHandler, PongHandler};
pub use registry::{Registry, RegistryError};
pub use service::{Env, Handler};
pub use session::connection::UnknownCodePolicy;
pub use session::initiator::{Client, ClientSettings, Outbound, SendError};
pub use session::listener::Server;
pub use session::{new_session_table, Context, SessionError, SessionSettings, SessionTable};
