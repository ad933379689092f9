//! natter wire format — handshake header and streamed envelopes.
//!
//! A connection begins with exactly one 9-byte [`Header`] sent by the
//! dialing side: an 8-byte little-endian magic number followed by a codec
//! byte. After that, both directions carry [`Envelope`]s back to back with
//! no length prefix. Delimiting relies on the codec being self-delimiting:
//! with [`CodecType::Json`] every envelope is one JSON object followed by a
//! newline, and the decoder consumes exactly one object per call.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use tokio_util::codec::{Decoder, Encoder};
use zerocopy::byteorder::little_endian::I64;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::message::{MessageCode, MessageType};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Magic number carried in every handshake header.
pub const MAGIC_NUMBER: i64 = 0x10086;

/// Handshake header size on the wire.
pub const HEADER_LEN: usize = 9;

/// Default time the accepting side waits for the handshake header.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Default upper bound on a single buffered envelope.
pub const MAX_ENVELOPE_LEN: usize = 16 * 1024 * 1024;

// ── Codec type ────────────────────────────────────────────────────────────────

/// Envelope encoding selected by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecType {
    /// Newline-separated JSON objects.
    Json = 0x01,
}

impl TryFrom<u8> for CodecType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(CodecType::Json),
            other => Err(WireError::InvalidCodec(other)),
        }
    }
}

impl From<CodecType> for u8 {
    fn from(c: CodecType) -> u8 {
        c as u8
    }
}

// ── Handshake header ──────────────────────────────────────────────────────────

/// Handshake header, sent once by the client right after connecting.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Header {
    /// Always [`MAGIC_NUMBER`], little-endian.
    pub magic: I64,
    /// Raw [`CodecType`] byte.
    pub codec: u8,
}

assert_eq_size!(Header, [u8; HEADER_LEN]);

impl Header {
    pub fn new(codec: CodecType) -> Self {
        Self {
            magic: I64::new(MAGIC_NUMBER),
            codec: codec.into(),
        }
    }

    /// Interpret exactly [`HEADER_LEN`] bytes as a header.
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self::read_from(&bytes[..]).unwrap_or_else(Self::new_zeroed)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Fails with [`WireError::BadMagic`] unless the magic number matches.
    pub fn validate(&self) -> Result<(), WireError> {
        let magic = self.magic.get();
        if magic != MAGIC_NUMBER {
            return Err(WireError::BadMagic(magic));
        }
        Ok(())
    }

    pub fn codec_type(&self) -> Result<CodecType, WireError> {
        CodecType::try_from(self.codec)
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One protocol unit: a message code plus an opaque payload.
///
/// `raw_data` stays as an untyped JSON value until the handler that owns
/// `code` decodes it with [`Envelope::decode`]. A missing `raw_data` field
/// decodes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: MessageCode,
    #[serde(default)]
    pub raw_data: serde_json::Value,
}

impl Envelope {
    /// Build an envelope from any serializable payload.
    pub fn new<T: Serialize>(
        code: impl Into<MessageCode>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            code: code.into(),
            raw_data: serde_json::to_value(payload)?,
        })
    }

    /// Envelope with a `null` payload.
    pub fn empty(code: impl Into<MessageCode>) -> Self {
        Self {
            code: code.into(),
            raw_data: serde_json::Value::Null,
        }
    }

    /// A `Display` envelope carrying a text line for the peer's user.
    pub fn display(text: impl Into<String>) -> Self {
        Self {
            code: MessageType::Display.code(),
            raw_data: serde_json::Value::String(text.into()),
        }
    }

    /// Decode the payload into the handler's own type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.raw_data)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.code)
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Newline-delimited JSON codec for envelopes.
///
/// One instance is used per direction. Each envelope is one compact JSON
/// object terminated by `\n`. The decoder remembers how far it has already
/// scanned for the terminator, so a large envelope arriving in many reads is
/// parsed once, not once per read.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_len: usize,
    /// Bytes of the buffered partial record already known to hold no `\n`.
    next_index: usize,
}

impl EnvelopeCodec {
    pub fn new(codec: CodecType) -> Self {
        match codec {
            CodecType::Json => Self {
                max_len: MAX_ENVELOPE_LEN,
                next_index: 0,
            },
        }
    }

    /// Bound the buffered size of a single envelope.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Parse the first envelope in `record`, returning it with the number of
    /// bytes it occupied.
    fn parse(record: &[u8]) -> Result<Option<(Envelope, usize)>, serde_json::Error> {
        let mut stream = serde_json::Deserializer::from_slice(record).into_iter::<Envelope>();
        match stream.next() {
            Some(Ok(envelope)) => Ok(Some((envelope, stream.byte_offset()))),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(CodecType::Json)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        let skip = src
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(src.len());
        src.advance(skip);
        self.next_index = self.next_index.saturating_sub(skip);
        if src.is_empty() {
            return Ok(None);
        }

        let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
            self.next_index = src.len();
            if src.len() > self.max_len {
                return Err(WireError::EnvelopeTooLarge(src.len()));
            }
            return Ok(None);
        };
        let end = self.next_index + offset + 1;
        self.next_index = 0;

        match Self::parse(&src[..end]) {
            Ok(Some((envelope, consumed))) => {
                src.advance(consumed);
                Ok(Some(envelope))
            }
            Ok(None) => {
                src.advance(end);
                Ok(None)
            }
            Err(e) => Err(WireError::Malformed(e)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        if let Some(envelope) = self.decode(src)? {
            return Ok(Some(envelope));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // A final record may arrive without its terminator.
        self.next_index = 0;
        match Self::parse(&src[..]) {
            Ok(Some((envelope, consumed))) => {
                src.advance(consumed);
                Ok(Some(envelope))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(WireError::Malformed(e)),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = WireError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), WireError> {
        serde_json::to_writer(dst.writer(), &item).map_err(WireError::Malformed)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise while reading or writing the wire format.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid magic number: 0x{0:x}")]
    BadMagic(i64),

    #[error("invalid codec type: 0x{0:02x}")]
    InvalidCodec(u8),

    #[error("read header timeout after {0}s")]
    HandshakeTimeout(u64),

    #[error("malformed envelope: {0}")]
    Malformed(serde_json::Error),

    #[error("envelope of {0} bytes exceeds the buffer limit")]
    EnvelopeTooLarge(usize),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
