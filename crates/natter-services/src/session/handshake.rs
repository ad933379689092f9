//! Handshake header exchange.
//!
//! The dialing side writes one header right after connecting; the accepting
//! side reads it under a deadline before any envelope is decoded.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use natter_core::wire::HEADER_LEN;
use natter_core::{CodecType, Header, WireError};

pub async fn write_handshake<W>(writer: &mut W, codec: CodecType) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&Header::new(codec).to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and validate the header, returning the codec the peer selected.
pub async fn read_handshake<R>(reader: &mut R, timeout: Duration) -> Result<CodecType, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    match tokio::time::timeout(timeout, reader.read_exact(&mut buf)).await {
        Err(_) => return Err(WireError::HandshakeTimeout(timeout.as_secs())),
        Ok(Err(e)) => return Err(WireError::Io(e)),
        Ok(Ok(_)) => {}
    }
    let header = Header::from_bytes(buf);
    header.validate()?;
    header.codec_type()
}
