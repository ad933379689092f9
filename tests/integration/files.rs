use crate::*;

use natter_core::{FileTransferEntity, TransferState};

async fn pair(server: &TestServer, transfer: TransferConfig) -> (TestClient, TestClient) {
    let mut alice = TestClient::connect(&server.addr, transfer.clone()).await;
    let mut bob = TestClient::connect(&server.addr, transfer).await;
    alice.login("alice").await;
    bob.login("bob").await;
    (alice, bob)
}

#[tokio::test]
async fn file_crosses_the_relay_byte_identical() {
    let server = start_server(LivenessConfig::default()).await;
    let (alice, bob) = pair(&server, TransferConfig::default()).await;
    let dir = scratch_dir("relay");
    let data: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
    let src = dir.join("photo.raw");
    let dst = dir.join("copy.raw");
    std::fs::write(&src, &data).unwrap();

    alice
        .transfers
        .notify_send_file(&alice.id(), &bob.id(), &src)
        .await
        .unwrap();
    assert!(eventually(|| async { bob.transfers.pending_receive().await.is_some() }).await);
    let offer = bob.transfers.pending_receive().await.unwrap();
    assert_eq!(offer.file_name, "photo.raw");
    assert_eq!(offer.file_size, 150_000);
    assert_eq!(offer.from, alice.id());

    bob.transfers.confirm(&dst).await.unwrap();
    assert!(eventually(|| async { !bob.transfers.is_receiving().await }).await);
    assert!(!alice.transfers.is_sending().await);
    assert_eq!(std::fs::read(&dst).unwrap(), data);

    alice.close().await;
    bob.close().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn rejected_offer_resets_both_sides() {
    let server = start_server(LivenessConfig::default()).await;
    let (alice, bob) = pair(&server, TransferConfig::default()).await;
    let dir = scratch_dir("reject");
    let src = dir.join("notes.txt");
    std::fs::write(&src, b"not for you").unwrap();

    alice
        .transfers
        .notify_send_file(&alice.id(), &bob.id(), &src)
        .await
        .unwrap();
    assert!(eventually(|| async { bob.transfers.is_receiving().await }).await);
    bob.transfers.reject().await.unwrap();

    assert!(!bob.transfers.is_receiving().await);
    assert!(eventually(|| async { !alice.transfers.is_sending().await }).await);
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

    alice.close().await;
    bob.close().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn spoofed_sender_is_never_relayed() {
    let server = start_server(LivenessConfig::default()).await;
    let (mut alice, bob) = pair(&server, TransferConfig::default()).await;

    let forged = FileTransferEntity {
        file_size: 10,
        file_name: "evil.sh".into(),
        to: bob.id(),
        from: bob.id(),
        content: String::new(),
        state: TransferState::WaitingSend,
    };
    alice
        .send(Envelope::new(MessageType::FileTransfer, &forged).unwrap())
        .await;

    let reply = alice
        .expect_display(|t| t.starts_with("dont send fake message"))
        .await;
    assert_eq!(reply, format!("dont send fake message, your id is {}", alice.id()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bob.transfers.pending_receive().await.is_none());

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn unknown_receiver_is_reported() {
    let server = start_server(LivenessConfig::default()).await;
    let (mut alice, bob) = pair(&server, TransferConfig::default()).await;
    let dir = scratch_dir("nobody");
    let src = dir.join("a.txt");
    std::fs::write(&src, b"a").unwrap();

    alice
        .transfers
        .notify_send_file(&alice.id(), "0123456789abcdef0123456789abcdef", &src)
        .await
        .unwrap();
    alice.expect_display(|t| t == "not found receiver").await;

    alice.close().await;
    bob.close().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stalled_receive_times_out_and_removes_partial_file() {
    let server = start_server(LivenessConfig::default()).await;
    let (alice, bob) = pair(&server, quick_transfers()).await;
    let dir = scratch_dir("stall");
    let dst = dir.join("never.bin");

    // Offer sent by hand, so alice has no send state and ignores the ACK.
    let offer = FileTransferEntity {
        file_size: 1_000_000,
        file_name: "big.bin".into(),
        to: bob.id(),
        from: alice.id(),
        content: String::new(),
        state: TransferState::WaitingSend,
    };
    alice
        .send(Envelope::new(MessageType::FileTransfer, &offer).unwrap())
        .await;
    assert!(eventually(|| async { bob.transfers.is_receiving().await }).await);

    bob.transfers.confirm(&dst).await.unwrap();
    assert!(dst.exists());

    assert!(eventually(|| async { !bob.transfers.is_receiving().await }).await);
    assert!(!dst.exists());

    alice.close().await;
    bob.close().await;
    let _ = std::fs::remove_dir_all(&dir);
}
