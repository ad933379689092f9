//! Message codes and the payload types carried inside envelopes.

use serde::{Deserialize, Serialize};

/// Raw message code as carried on the wire.
pub type MessageCode = i64;

/// Well-known message codes. Values are stable and start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum MessageType {
    Display = 1,
    UserLogin = 2,
    UserLogout = 3,
    GetOnlineUserList = 4,
    Ping = 5,
    Pong = 6,
    SendMessage = 7,
    FileTransfer = 8,
}

impl MessageType {
    pub fn from_code(code: MessageCode) -> Option<Self> {
        match code {
            1 => Some(Self::Display),
            2 => Some(Self::UserLogin),
            3 => Some(Self::UserLogout),
            4 => Some(Self::GetOnlineUserList),
            5 => Some(Self::Ping),
            6 => Some(Self::Pong),
            7 => Some(Self::SendMessage),
            8 => Some(Self::FileTransfer),
            _ => None,
        }
    }

    pub fn code(self) -> MessageCode {
        self as MessageCode
    }
}

impl From<MessageType> for MessageCode {
    fn from(t: MessageType) -> MessageCode {
        t.code()
    }
}

/// Login request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginMsg {
    pub nickname: String,
}

// ── File transfer ─────────────────────────────────────────────────────────────

/// Stage of a file transfer, encoded as a small integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TransferState {
    /// Sender offers a file and waits for the receiver's decision.
    WaitingSend = 1,
    /// Receiver declined the offer.
    Reject = 2,
    /// Sender carries a chunk and more will follow.
    Sending = 3,
    /// Receiver accepted; only ever held locally.
    Accept = 4,
    /// Receiver asks for the next chunk.
    Ack = 5,
    /// Sender carries the final chunk.
    Completed = 6,
}

impl TryFrom<u8> for TransferState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::WaitingSend),
            2 => Ok(Self::Reject),
            3 => Ok(Self::Sending),
            4 => Ok(Self::Accept),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Completed),
            other => Err(format!("unknown transfer state {other}")),
        }
    }
}

impl From<TransferState> for u8 {
    fn from(s: TransferState) -> u8 {
        s as u8
    }
}

/// One file-transfer record. Each participant keeps its own copy; the two
/// copies are matched by field equality.
///
/// `from` and `to` are derived identities, `content` is a base64 chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferEntity {
    pub file_size: u64,
    pub file_name: String,
    pub to: String,
    pub from: String,
    #[serde(default)]
    pub content: String,
    pub state: TransferState,
}

impl FileTransferEntity {
    /// True when `other` describes the same file between the same peers.
    pub fn same_transfer(&self, other: &FileTransferEntity) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.file_size == other.file_size
            && self.file_name == other.file_name
    }

    /// Number of chunks needed for this file at `chunk_size`.
    pub fn expected_blocks(&self, chunk_size: usize) -> u64 {
        let chunk = chunk_size.max(1) as u64;
        self.file_size.div_ceil(chunk)
    }

    /// Record addressed back to the other participant, carrying `state`
    /// and no content.
    pub fn reply(&self, state: TransferState) -> Self {
        Self {
            file_size: self.file_size,
            file_name: self.file_name.clone(),
            to: self.from.clone(),
            from: self.to.clone(),
            content: String::new(),
            state,
        }
    }

    /// True when `reply` answers a transfer this record started.
    pub fn answered_by(&self, reply: &FileTransferEntity) -> bool {
        self.from == reply.to && self.to == reply.from
    }
}
