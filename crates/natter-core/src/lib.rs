//! natter-core — wire format, message types, identity, and configuration.
//! All other natter crates depend on this one.

pub mod config;
pub mod identity;
pub mod message;
pub mod wire;

pub use config::{NatterConfig, QueuePolicy};
pub use identity::derive_id;
pub use message::{FileTransferEntity, LoginMsg, MessageCode, MessageType, TransferState};
pub use wire::{CodecType, Envelope, EnvelopeCodec, Header, WireError};
