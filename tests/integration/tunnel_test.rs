//! Tunnel registration, authentication and lifecycle

use super::{
    closed_addr, make_client, start_named_service, valid_token, TestGateway, GENERATOR_PASSWORD,
    GENERATOR_USER,
};
use reqwest::StatusCode;
use std::time::Duration;
use wayport::{Server, TunnelError};

async fn wait_until_unrouted(gateway: &TestGateway) {
    for _ in 0..100 {
        if gateway.server().registry().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("route was never released");
}

#[tokio::test]
async fn test_clients_get_distinct_sessions() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;

    let mut first = gateway.client("one.test", None, local, &valid_token());
    let mut second = gateway.client("two.test", None, local, &valid_token());
    let info1 = first.start().await.unwrap();
    let info2 = second.start().await.unwrap();

    assert_ne!(info1.session_id, info2.session_id);
    assert_eq!(gateway.server().registry().len(), 2);
    assert!(first.is_running());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _owner = gateway.connect("a.test", Some("/api"), local).await;

    let mut intruder = gateway.client("A.test", Some("/api"), local, &valid_token());
    let err = intruder.start().await.unwrap_err();
    assert!(matches!(err, TunnelError::DuplicateRegistration(_)), "got {err}");

    // A different prefix on the same host is a different route
    let mut neighbour = gateway.client("a.test", Some("/web"), local, &valid_token());
    assert!(neighbour.start().await.is_ok());

    // The original owner still serves its route
    let response = gateway.get("a.test", "/api/ping").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_duplicate_is_not_retried() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let _owner = gateway.connect("a.test", None, local).await;

    let mut retrying = wayport::Client::builder()
        .server_addr(gateway.tunnel_addr.to_string())
        .token(valid_token())
        .host("a.test")
        .local_addr(local.to_string())
        .auto_reconnect(true)
        .build()
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), retrying.start())
        .await
        .expect("a taken route must fail fast");
    assert!(matches!(result, Err(TunnelError::DuplicateRegistration(_))));
}

#[tokio::test]
async fn test_invalid_jwt_rejected() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;

    let forged = wayport_core::issue_token("other-secret", super::VERIFY_TOKEN, None).unwrap();
    let mut client = gateway.client("a.test", None, local, &forged);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, TunnelError::Authentication(_)), "got {err}");

    let wrong_claim = wayport_core::issue_token(super::SECRET_KEY, "not-it", None).unwrap();
    let mut client = gateway.client("a.test", None, local, &wrong_claim);
    assert!(matches!(
        client.start().await,
        Err(TunnelError::Authentication(_))
    ));

    assert!(gateway.server().registry().is_empty());
}

#[tokio::test]
async fn test_static_token_gateway() {
    let gateway = TestGateway::start_with(Server::builder().token("shared-token")).await;
    let local = start_named_service("app").await;

    let mut client = gateway.client("a.test", None, local, "shared-token");
    client.start().await.unwrap();
    let response = gateway.get("a.test", "/").await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut wrong = gateway.client("b.test", None, local, "guess");
    assert!(wrong.start().await.is_err());
}

#[tokio::test]
async fn test_generated_token_connects() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;

    let response = make_client()
        .get(gateway.url(&format!(
            "/tunnel_jwt_generator?username={GENERATOR_USER}&password={GENERATOR_PASSWORD}"
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let token = response.text().await.unwrap();

    let mut client = gateway.client("gen.test", None, local, &token);
    client.start().await.unwrap();

    let response = make_client()
        .get(gateway.url("/tunnel_jwt_generator?username=admin&password=wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_shutdown_releases_route() {
    let gateway = TestGateway::start().await;
    let local = start_named_service("app").await;
    let mut client = gateway.connect("a.test", None, local).await;
    assert_eq!(gateway.server().registry().len(), 1);

    client.shutdown().await.unwrap();
    assert!(!client.is_running());
    wait_until_unrouted(&gateway).await;

    let response = gateway.get("a.test", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The route is free again for a new connection
    let again = gateway.connect("a.test", None, local).await;
    assert!(again.is_running());
}

#[tokio::test]
async fn test_unreachable_gateway_fails_start() {
    let gateway = TestGateway::start().await;
    let mut client = wayport::Client::builder()
        .server_addr(closed_addr().await.to_string())
        .token(valid_token())
        .host("a.test")
        .auto_reconnect(false)
        .build()
        .unwrap();
    assert!(client.start().await.is_err());
    assert!(gateway.server().registry().is_empty());
}
