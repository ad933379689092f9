use crate::*;

#[tokio::test]
async fn guarded_commands_require_login() {
    let server = start_server(LivenessConfig::default()).await;
    let mut alice = TestClient::connect(&server.addr, TransferConfig::default()).await;
    alice.expect_display(|t| t == "hello, please login").await;

    alice.send(Envelope::new(MessageType::SendMessage, &"hi").unwrap()).await;
    assert_eq!(alice.next_display().await.as_deref(), Some("please login"));
    alice.send(Envelope::empty(MessageType::UserLogout)).await;
    assert_eq!(alice.next_display().await.as_deref(), Some("please login"));
    assert!(server.users.is_empty());
    alice.close().await;
}

#[tokio::test]
async fn message_is_broadcast_to_every_logged_in_user() {
    let server = start_server(LivenessConfig::default()).await;
    let mut alice = TestClient::connect(&server.addr, TransferConfig::default()).await;
    let mut bob = TestClient::connect(&server.addr, TransferConfig::default()).await;
    alice.login("alice").await;
    bob.login("bob").await;
    alice.expect_display(|t| t == "bob is online").await;

    alice
        .send(Envelope::new(MessageType::SendMessage, &"hello everyone").unwrap())
        .await;
    let expected = format!("alice, ID:{}\n\thello everyone", alice.id());
    assert_eq!(bob.expect_display(|t| t.starts_with("alice, ID:")).await, expected);
    assert_eq!(alice.expect_display(|t| t.starts_with("alice, ID:")).await, expected);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn user_list_shows_everyone() {
    let server = start_server(LivenessConfig::default()).await;
    let mut alice = TestClient::connect(&server.addr, TransferConfig::default()).await;
    let mut bob = TestClient::connect(&server.addr, TransferConfig::default()).await;
    alice.login("alice").await;
    bob.login("bob").await;

    bob.send(Envelope::empty(MessageType::GetOnlineUserList)).await;
    let list = bob.expect_display(|t| t.starts_with("online user number")).await;
    assert!(list.starts_with("online user number: 2\n"));
    assert!(list.contains(&format!("ID={}, nickname=alice", alice.id())));
    assert!(list.contains(&format!("ID={}, nickname=bob", bob.id())));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn logout_and_disconnect_are_announced() {
    let server = start_server(LivenessConfig::default()).await;
    let mut alice = TestClient::connect(&server.addr, TransferConfig::default()).await;
    let mut bob = TestClient::connect(&server.addr, TransferConfig::default()).await;
    let mut carol = TestClient::connect(&server.addr, TransferConfig::default()).await;
    alice.login("alice").await;
    bob.login("bob").await;
    carol.login("carol").await;

    bob.send(Envelope::empty(MessageType::UserLogout)).await;
    bob.expect_display(|t| t == "logout success").await;
    alice.expect_display(|t| t == "bob left").await;

    carol.close().await;
    alice.expect_display(|t| t == "carol went offline").await;
    assert!(eventually(|| async { server.users.len() == 1 }).await);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn invalid_login_payload_closes_the_connection() {
    let server = start_server(LivenessConfig::default()).await;
    let mut alice = TestClient::connect(&server.addr, TransferConfig::default()).await;
    alice.expect_display(|t| t == "hello, please login").await;

    alice
        .send(Envelope::new(MessageType::UserLogin, &serde_json::json!([1, 2])).unwrap())
        .await;
    alice.expect_display(|t| t == "invalid data").await;
    assert!(eventually(|| async { alice.ctx.is_closed() }).await);
    assert!(server.users.is_empty());
}
