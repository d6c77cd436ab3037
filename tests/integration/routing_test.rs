//! Host and path-prefix routing through the public ingress

use super::{start_named_service, start_raw_service, TestGateway};
use reqwest::StatusCode;

#[tokio::test]
async fn test_catch_all_route_relays_local_response() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _client = gateway.connect("a.test", None, local).await;

    let response = gateway.get("a.test", "/x?q=1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-served-by"], "app");
    assert_eq!(response.text().await.unwrap(), "app GET /x?q=1");

    // Status codes from the local service pass through untouched
    let response = gateway.get("a.test", "/status/418").await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn test_longest_prefix_wins() {
    let gateway = TestGateway::start().await;
    let short = start_named_service("short").await;
    let long = start_named_service("long").await;
    let _a = gateway.connect("h.test", Some("/a"), short).await;
    let _ab = gateway.connect("h.test", Some("/a/b"), long).await;

    let response = gateway.get("h.test", "/a/b/x").await;
    assert_eq!(response.headers()["x-served-by"], "long");

    let response = gateway.get("h.test", "/a/x").await;
    assert_eq!(response.headers()["x-served-by"], "short");

    let response = gateway.get("h.test", "/c").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _client = gateway.connect("a.test", None, local).await;

    let response = gateway.get("b.test", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_host_matching_ignores_case_and_port() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _client = gateway.connect("App.Test", None, local).await;

    let response = gateway.get("app.test:8080", "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-served-by"], "app");
}

#[tokio::test]
async fn test_forwarded_headers_reach_local_service() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _client = gateway.connect("a.test", None, local).await;

    let response = super::make_client()
        .get(gateway.url("/"))
        .header(reqwest::header::HOST, "a.test:8443")
        .header("x-forwarded-for", "203.0.113.7")
        .send()
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["x-seen-forwarded-for"], "203.0.113.7,127.0.0.1");
    assert_eq!(headers["x-seen-forwarded-host"], "a.test:8443");
    assert_eq!(headers["x-seen-forwarded-proto"], "http");
    assert_eq!(headers["x-seen-forwarded-port"], "8443");
}

#[tokio::test]
async fn test_request_body_streams_to_local_service() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _client = gateway.connect("a.test", None, local).await;

    let payload = "x".repeat(256 * 1024);
    let response = super::make_client()
        .post(gateway.url("/upload"))
        .header(reqwest::header::HOST, "a.test")
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), payload);
}

#[tokio::test]
async fn test_concurrent_exchanges_share_one_tunnel() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _client = gateway.connect("a.test", None, local).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let url = gateway.url(&format!("/item/{i}"));
        handles.push(tokio::spawn(async move {
            let response = super::make_client()
                .get(url)
                .header(reqwest::header::HOST, "a.test")
                .send()
                .await
                .unwrap();
            (i, response.text().await.unwrap())
        }));
    }

    for handle in handles {
        let (i, body) = handle.await.unwrap();
        assert_eq!(body, format!("app GET /item/{i}"));
    }
}

#[tokio::test]
async fn test_local_reason_phrase_reaches_caller() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let gateway = TestGateway::start().await;
    let local = start_raw_service(
        b"HTTP/1.1 200 Everything Fine\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
    )
    .await;
    let _client = gateway.connect("a.test", None, local).await;

    let mut stream = tokio::net::TcpStream::connect(gateway.http_addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(std::time::Duration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 200 Everything Fine\r\n"), "got {response}");
    assert!(response.ends_with("ok"));
}
