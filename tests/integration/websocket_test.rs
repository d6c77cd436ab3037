//! Protocol upgrades relayed over the duplex stream

use super::{start_named_service, start_ws_echo_service, TestGateway};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_websocket_echo_through_tunnel() {
    let gateway = TestGateway::start().await;
    let local = start_ws_echo_service().await;
    // Register the address the public caller dials, so its Host header matches
    let _client = gateway.connect("127.0.0.1", None, local).await;

    let (mut ws, response) = tokio::time::timeout(
        Duration::from_secs(10),
        tokio_tungstenite::connect_async(format!("ws://{}/ws", gateway.http_addr)),
    )
    .await
    .expect("handshake timed out")
    .expect("websocket handshake should succeed");
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS.as_u16());

    ws.send(Message::text("hello")).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::text("hello"));

    let blob: Vec<u8> = (0..=255).cycle().take(100_000).collect();
    ws.send(Message::binary(blob.clone())).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed.into_data().to_vec(), blob);

    // Closing one side tears down the other
    ws.close(None).await.unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    assert!(drained.is_ok(), "relay should close both sides");
}

#[tokio::test]
async fn test_many_messages_keep_order() {
    let gateway = TestGateway::start().await;
    let local = start_ws_echo_service().await;
    let _client = gateway.connect("127.0.0.1", None, local).await;

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gateway.http_addr))
        .await
        .unwrap();
    let (mut tx, mut rx) = ws.split();

    let sender = tokio::spawn(async move {
        for i in 0..200 {
            tx.send(Message::text(format!("msg-{i}"))).await.unwrap();
        }
        tx
    });

    for i in 0..200 {
        let msg = rx.next().await.unwrap().unwrap();
        assert_eq!(msg.into_text().unwrap().as_str(), format!("msg-{i}"));
    }
    drop(sender.await.unwrap());
}

#[tokio::test]
async fn test_declined_upgrade_is_ordinary_response() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("plain").await;
    let _client = gateway.connect("a.test", None, local).await;

    let response = super::make_client()
        .get(gateway.url("/ws"))
        .header(reqwest::header::HOST, "a.test")
        .header(reqwest::header::CONNECTION, "upgrade")
        .header(reqwest::header::UPGRADE, "websocket")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "plain GET /ws");
}
