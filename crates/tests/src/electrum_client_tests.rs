//! Integration tests for `ElectrumClient` against the mock Electrum server.

use crate::mock_infrastructure::{test_upstream_config, wait_until, MockElectrumServer, Transport};
use fulcrum_http_core::upstream::{ElectrumClient, UpstreamClient, UpstreamError};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use url::Url;

async fn start(transport: Transport) -> MockElectrumServer {
    match transport {
        Transport::WebSocket => MockElectrumServer::websocket().await,
        Transport::Tcp => MockElectrumServer::tcp().await,
    }
    .expect("mock should bind")
}

async fn connect(server: &MockElectrumServer) -> ElectrumClient {
    let url = Url::parse(&server.url()).unwrap();
    ElectrumClient::connect(&url, &test_upstream_config(&server.url()))
        .await
        .expect("client should connect")
}

#[tokio::test]
async fn test_connect_negotiates_version() {
    for transport in [Transport::WebSocket, Transport::Tcp] {
        let server = start(transport).await;

        let client = connect(&server).await;

        assert!(client.is_connected());
        assert_eq!(server.connections(), 1);
        assert_eq!(server.received_methods(), vec!["server.version".to_string()]);
    }
}

#[tokio::test]
async fn test_request_round_trip_over_both_transports() {
    for transport in [Transport::WebSocket, Transport::Tcp] {
        let server = start(transport).await;
        let client = connect(&server).await;

        let result = client
            .request("blockchain.scripthash.get_history", vec![json!("ab".repeat(32))])
            .await
            .unwrap();

        assert_eq!(result["method"], "blockchain.scripthash.get_history");
        assert_eq!(result["params"], json!(["ab".repeat(32)]));
        assert_eq!(client.pending_requests(), 0);
    }
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated_by_id() {
    let server = start(Transport::WebSocket).await;
    let client = connect(&server).await;

    let calls = (0..20).map(|i| client.request("echo", vec![json!(i)]));
    let results = futures_util::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap()["params"], json!([i]));
    }
}

#[tokio::test]
async fn test_error_value_becomes_rpc_error() {
    let server = start(Transport::Tcp).await;
    let client = connect(&server).await;

    let err = client.request("mock.error", vec![]).await.unwrap_err();

    assert_eq!(err, UpstreamError::Rpc { code: 2, message: "daemon error (code -5)".into() });
    assert_eq!(err.client_message(), "daemon error (code -5)");
}

#[tokio::test]
async fn test_notifications_are_ignored() {
    let server = start(Transport::WebSocket).await;
    let client = connect(&server).await;

    let result = client.request("blockchain.headers.subscribe", vec![]).await.unwrap();

    assert_eq!(result, json!({"height": 1, "hex": "00"}));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let server = start(Transport::Tcp).await;
    let url = Url::parse(&server.url()).unwrap();
    let config = {
        let mut config = test_upstream_config(&server.url());
        config.request_timeout_seconds = 1;
        config
    };
    let client = ElectrumClient::connect(&url, &config).await.unwrap();

    let err = client.request("mock.hang", vec![]).await.unwrap_err();

    assert_eq!(err, UpstreamError::Timeout);
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connection_loss_fails_pending_calls() {
    for transport in [Transport::WebSocket, Transport::Tcp] {
        let server = start(transport).await;
        let client = Arc::new(connect(&server).await);

        let pending = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request("mock.hang", vec![]).await }
        });
        assert!(wait_until(Duration::from_secs(1), || client.pending_requests() == 1).await);

        server.kick_clients();

        assert_eq!(pending.await.unwrap(), Err(UpstreamError::Closed));
        assert!(!client.is_connected());
        assert_eq!(client.request("server.ping", vec![]).await, Err(UpstreamError::Closed));
    }
}

#[tokio::test]
async fn test_disconnect_closes_the_socket() {
    let server = start(Transport::WebSocket).await;
    let client = connect(&server).await;
    assert_eq!(server.active_connections(), 1);

    client.disconnect().await;

    assert!(!client.is_connected());
    assert!(wait_until(Duration::from_secs(1), || server.active_connections() == 0).await);
}

#[tokio::test]
async fn test_refused_connection_is_connect_error() {
    let server = start(Transport::Tcp).await;
    let url = Url::parse(&server.url()).unwrap();
    drop(server);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = ElectrumClient::connect(&url, &test_upstream_config(url.as_str()))
        .await
        .map(|_| ())
        .unwrap_err();

    assert!(err.is_connect_error(), "unexpected error: {err:?}");
}
