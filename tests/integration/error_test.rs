//! Failure paths: what the public caller sees when the far side goes wrong

use super::{closed_addr, start_silent_service, TestGateway, SECRET_KEY, VERIFY_TOKEN};
use reqwest::StatusCode;
use std::time::Duration;
use wayport::Server;

#[tokio::test]
async fn test_unreachable_local_service_is_bad_gateway() {
    let gateway = TestGateway::start().await;
    let _client = gateway.connect("a.test", None, closed_addr().await).await;

    let response = tokio::time::timeout(Duration::from_secs(10), gateway.get("a.test", "/x"))
        .await
        .expect("request-error must end the exchange promptly");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // The tunnel survives a failed exchange
    let response = gateway.get("a.test", "/y").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(gateway.server().registry().len(), 1);
}

#[tokio::test]
async fn test_tunnel_disconnect_mid_request_is_server_error() {
    let gateway = TestGateway::start().await;
    let local = start_silent_service().await;
    let mut client = gateway.connect("a.test", None, local).await;

    let url = gateway.url("/slow");
    let pending = tokio::spawn(async move {
        super::make_client()
            .get(url)
            .header(reqwest::header::HOST, "a.test")
            .send()
            .await
            .unwrap()
            .status()
    });

    // Let the exchange reach the local service, then drop the tunnel
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.shutdown().await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), pending)
        .await
        .expect("disconnect must end the exchange")
        .unwrap();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_slow_tunnel_times_out() {
    let gateway = TestGateway::start_with(
        Server::builder()
            .jwt(SECRET_KEY, VERIFY_TOKEN)
            .response_timeout(Duration::from_millis(500)),
    )
    .await;
    let local = start_silent_service().await;
    let _client = gateway.connect("a.test", None, local).await;

    let response = gateway.get("a.test", "/").await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_missing_host_is_bad_request() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let gateway = TestGateway::start().await;
    let mut stream = tokio::net::TcpStream::connect(gateway.http_addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&buf);
    assert!(response.contains(" 400 "), "got {response}");
}
