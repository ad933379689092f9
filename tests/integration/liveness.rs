use crate::*;

use tokio::io::AsyncReadExt;

fn fast_liveness() -> LivenessConfig {
    LivenessConfig {
        ping_interval_ms: 100,
        max_no_reply_ms: 300,
    }
}

#[tokio::test]
async fn silent_peer_is_evicted() {
    let server = start_server(fast_liveness()).await;
    let mut stream = raw_connect(&server.addr).await;
    let local = stream.local_addr().unwrap().to_string();
    assert!(eventually(|| async { server.pong.is_tracked(&local) }).await);

    let started = tokio::time::Instant::now();
    let mut buf = [0u8; 1024];
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;

    assert!(closed.is_ok(), "server never hung up on a silent peer");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!server.pong.is_tracked(&local));
    assert!(eventually(|| async { server.sessions.is_empty() }).await);
}

#[tokio::test]
async fn answering_peer_is_kept() {
    let server = start_server(fast_liveness()).await;
    let client = TestClient::connect(&server.addr, TransferConfig::default()).await;
    let local = client.ctx.local_addr().to_string();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(server.pong.is_tracked(&local));
    assert!(!client.ctx.is_closed());
    assert_eq!(server.sessions.len(), 1);
    client.close().await;
}
