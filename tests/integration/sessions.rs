use crate::*;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use natter_core::{EnvelopeCodec, MessageCode};
use natter_services::{Handler, Interceptor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Framed;

const ECHO: MessageCode = 42;
const UNKNOWN: MessageCode = 77;

/// Echoes text back as a display line; panics on "boom"; answers
/// "unknown" with a code the client has no handler for.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn on_message(&self, ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        let text: String = env.decode()?;
        match text.as_str() {
            "boom" => panic!("echo handler exploded"),
            "unknown" => {
                ctx.write(Envelope::empty(UNKNOWN)).await?;
                ctx.write(Envelope::display("still here")).await?;
            }
            _ => ctx.write(Envelope::display(text)).await?,
        }
        Ok(())
    }
}

struct Blocklist;

impl Interceptor for Blocklist {
    fn name(&self) -> &str {
        "blocklist"
    }

    fn on_read(&self, _ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        if env.decode::<String>().ok().as_deref() == Some("blocked") {
            anyhow::bail!("blocked word");
        }
        Ok(())
    }
}

async fn echo_server() -> (String, SessionTable) {
    let registry = Registry::new();
    registry.add_interceptor(Arc::new(Blocklist));
    registry.add_handler(ECHO, Arc::new(Echo)).unwrap();
    serve(registry).await
}

fn echo(text: &str) -> Envelope {
    Envelope::new(ECHO, &text).unwrap()
}

async fn read_to_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1024];
    let drained = tokio::time::timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    drained.is_ok()
}

#[tokio::test]
async fn handshake_with_bad_magic_is_dropped() {
    let server = start_server(LivenessConfig::default()).await;
    let mut stream = TcpStream::connect(&server.addr).await.unwrap();
    let mut header = natter_core::Header::new(natter_core::CodecType::Json).to_bytes();
    header[0] ^= 0x01;
    stream.write_all(&header).await.unwrap();

    assert!(read_to_eof(&mut stream).await);
    assert!(server.sessions.is_empty());
}

#[tokio::test]
async fn handshake_with_unknown_codec_is_dropped() {
    let server = start_server(LivenessConfig::default()).await;
    let mut stream = TcpStream::connect(&server.addr).await.unwrap();
    let mut header = natter_core::Header::new(natter_core::CodecType::Json).to_bytes();
    header[8] = 9;
    stream.write_all(&header).await.unwrap();

    assert!(read_to_eof(&mut stream).await);
    assert!(server.sessions.is_empty());
}

#[tokio::test]
async fn unknown_code_terminates_server_connection() {
    let server = start_server(LivenessConfig::default()).await;
    let stream = raw_connect(&server.addr).await;
    let mut framed = Framed::new(stream, EnvelopeCodec::default());

    let greeting = framed.next().await.unwrap().unwrap();
    assert_eq!(greeting.decode::<String>().unwrap(), "hello, please login");
    assert!(eventually(|| async { server.sessions.len() == 1 }).await);

    framed.send(Envelope::empty(999)).await.unwrap();
    let rest = tokio::time::timeout(WAIT, async {
        while let Some(Ok(_)) = framed.next().await {}
    })
    .await;
    assert!(rest.is_ok());
    assert!(eventually(|| async { server.sessions.is_empty() }).await);
}

#[tokio::test]
async fn malformed_envelope_terminates_server_connection() {
    let server = start_server(LivenessConfig::default()).await;
    let mut stream = raw_connect(&server.addr).await;
    stream.write_all(b"{\"code\": \"not a number\"}\n").await.unwrap();
    assert!(read_to_eof(&mut stream).await);
    assert!(eventually(|| async { server.sessions.is_empty() }).await);
}

#[tokio::test]
async fn handler_panic_does_not_end_the_connection() {
    let (addr, sessions) = echo_server().await;
    let mut client = TestClient::connect(&addr, TransferConfig::default()).await;

    client.send(echo("boom")).await;
    client.send(echo("after the storm")).await;
    assert_eq!(client.next_display().await.as_deref(), Some("after the storm"));
    assert_eq!(sessions.len(), 1);
    assert!(!client.ctx.is_closed());
    client.close().await;
}

#[tokio::test]
async fn rejected_envelope_is_not_routed() {
    let (addr, _) = echo_server().await;
    let mut client = TestClient::connect(&addr, TransferConfig::default()).await;

    client.send(echo("blocked")).await;
    client.send(echo("allowed")).await;
    assert_eq!(client.next_display().await.as_deref(), Some("allowed"));
    client.close().await;
}

#[tokio::test]
async fn client_skips_unknown_codes() {
    let (addr, _) = echo_server().await;
    let mut client = TestClient::connect(&addr, TransferConfig::default()).await;

    client.send(echo("unknown")).await;
    assert_eq!(client.next_display().await.as_deref(), Some("still here"));
    assert!(!client.ctx.is_closed());
    client.close().await;
}

#[tokio::test]
async fn closed_client_leaves_the_session_table() {
    let server = start_server(LivenessConfig::default()).await;
    let client = TestClient::connect(&server.addr, TransferConfig::default()).await;
    assert!(eventually(|| async { server.sessions.len() == 1 }).await);
    assert!(server.pong.is_tracked(client.ctx.local_addr()));

    let local = client.ctx.local_addr().to_string();
    client.close().await;
    assert!(eventually(|| async { server.sessions.is_empty() }).await);
    assert!(!server.pong.is_tracked(&local));
    assert!(server.counter.sent() >= 1);
}
