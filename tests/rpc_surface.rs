//! Cluster API over HTTP, through the bundled client
mod common;

use common::{payload, Harness};
use reqwest::{Client, StatusCode};
use sds_controller::client::ControllerClient;
use sds_controller::common::ErrorKind;
use sds_controller::controller::http::{create_router, Envelope};
use sds_controller::controller::records::ResourceRecord;
use serde_json::json;
use std::time::Duration;

/// Serve the API for `h` on an ephemeral port and return its base URL.
async fn serve(h: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_router(h.services.clone());
    let shutdown = h.shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_resource_calls_over_http() {
    let h = Harness::new(&["n1", "n2"]).await;
    let base = serve(&h).await;
    let client = ControllerClient::new(&base, Duration::from_secs(10)).unwrap();

    let nodes = client.call("node", "list", &json!({})).await.unwrap().unwrap();
    assert_eq!(nodes.as_array().unwrap().len(), 2);
    assert_eq!(payload(&nodes[0], "liveness"), json!("healthy"));

    let record: ResourceRecord = client
        .call_as(
            "resource",
            "create",
            &json!({"name": "r0", "nodes": ["n1", "n2"], "pool": "vg0", "size_gib": 10}),
        )
        .await
        .unwrap();
    assert_eq!(record.name, "r0");
    assert_eq!(h.free_gib("n1"), 90);

    let listed = client.call("resource", "list", &json!({})).await.unwrap().unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let err = client
        .call("resource", "create", &json!({"name": "r0", "nodes": ["n1"], "pool": "vg0", "size_gib": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::AlreadyExists));
    assert_eq!(err.exit_code(), 2);

    // deletes answer without a payload
    let deleted = client.call("resource", "delete", &json!({"name": "r0"})).await.unwrap();
    assert!(deleted.is_none());
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_errors_keep_the_envelope() {
    let h = Harness::new(&["n1"]).await;
    let base = serve(&h).await;
    let http = Client::new();

    let response = http
        .post(format!("{}/v1/resource/teleport", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let envelope: Envelope = response.json().await.unwrap();
    assert!(!envelope.success);
    assert_eq!(envelope.kind, Some(ErrorKind::NotFound));

    let response = http
        .post(format!("{}/v1/resource/create", base))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope: Envelope = response.json().await.unwrap();
    assert_eq!(envelope.kind, Some(ErrorKind::InvalidArgument));

    // a well-formed body with the wrong shape is rejected the same way
    let response = http
        .post(format!("{}/v1/resource/add_volume", base))
        .json(&json!({"resource": "r0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let client = ControllerClient::new(&base, Duration::from_secs(5)).unwrap();
    let err = client.call("resource", "get", &json!({"name": "missing"})).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_failed_create_reports_rollback() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.sim.fail("n2", "replication_up", "kernel refused to attach device");
    let base = serve(&h).await;

    let response = Client::new()
        .post(format!("{}/v1/resource/create", base))
        .json(&json!({"name": "r0", "nodes": ["n1", "n2"], "pool": "vg0", "size_gib": 10}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let envelope: Envelope = response.json().await.unwrap();
    assert_eq!(envelope.kind, Some(ErrorKind::Internal));
    assert_eq!(
        serde_json::to_value(envelope.rollback_status).unwrap(),
        json!("complete")
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::new(&["n1", "n2", "n3"]).await;
    let base = serve(&h).await;
    let client = ControllerClient::new(&base, Duration::from_secs(5)).unwrap();

    let health = client.health().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["nodes"], 3);
    assert!(health["revision"].as_u64().unwrap() > 0);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_controller() {
    let client = ControllerClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
    let err = client.call("node", "list", &json!({})).await.unwrap_err();
    assert_eq!(err.kind(), None);
    assert_eq!(err.exit_code(), 3);
}
