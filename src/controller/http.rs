//! Cluster API
//!
//! Every operation is `POST /v1/<group>/<method>` with a JSON body and is
//! answered with the same envelope, successful or not. Store changes can be
//! followed on `/v1/watch` as server-sent events.

use super::agent_client::ZfsKind;
use super::gateway::GatewayRequest;
use super::ha::MakeHaRequest;
use super::placement::CreateRequest;
use super::pools::PoolRequest;
use super::server::Services;
use super::snapshot::{parse_volume_ref, SnapshotRequest};
use super::zfs::{ZfsDatasetRequest, ZfsPoolRequest, ZfsVolumeRequest};
use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, ErrorKind, NodeFailure, Result, RollbackStatus};
use async_stream::stream;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Reply to every API call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default)]
    pub retriable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_status: Option<RollbackStatus>,
    #[serde(default)]
    pub failures: Vec<NodeFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            message: "ok".into(),
            kind: None,
            retriable: false,
            rollback_status: None,
            failures: Vec::new(),
            payload: (!payload.is_null()).then_some(payload),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        Self {
            success: false,
            message: error.user_message(),
            kind: Some(error.kind()),
            retriable: error.is_retryable(),
            rollback_status: error.rollback_status(),
            failures: error.node_failures(),
            payload: None,
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub services: Arc<Services>,
}

pub fn create_router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/v1/watch", get(watch_sse))
        .route("/v1/:group/:method", post(call))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(ApiState { services })
}

/// Prometheus endpoint alone, for the dedicated metrics listener
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_text))
}

fn respond(result: Result<Value>) -> Response {
    match result {
        Ok(payload) => (StatusCode::OK, Json(Envelope::ok(payload))).into_response(),
        Err(e) => {
            if e.kind() == ErrorKind::Internal {
                tracing::error!(error = %e, "request failed");
            }
            (e.to_http_status(), Json(Envelope::from_error(&e))).into_response()
        }
    }
}

async fn call(
    State(state): State<ApiState>,
    Path((group, method)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = match parse_body(&body) {
        Ok(args) => dispatch(&state.services, &group, &method, args).await,
        Err(e) => Err(e),
    };
    respond(result)
}

fn parse_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| Error::InvalidArgument(format!("malformed JSON body: {}", e)))
}

fn args<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::InvalidArgument(e.to_string()))
}

fn payload<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// === Argument shapes ===

#[derive(Deserialize)]
struct Named {
    name: String,
}

#[derive(Deserialize)]
struct RegisterArgs {
    name: String,
    address: String,
    #[serde(default)]
    agent_port: Option<u16>,
}

#[derive(Deserialize)]
struct NodeObject {
    node: String,
    name: String,
}

#[derive(Deserialize)]
struct NodeFilter {
    #[serde(default)]
    node: Option<String>,
}

#[derive(Deserialize)]
struct ResourceFilter {
    #[serde(default)]
    resource: Option<String>,
}

#[derive(Deserialize)]
struct ResourceArg {
    resource: String,
}

#[derive(Deserialize)]
struct AddDiskArgs {
    node: String,
    name: String,
    devices: Vec<String>,
}

#[derive(Deserialize)]
struct AddVolumeArgs {
    resource: String,
    size_gib: u64,
}

#[derive(Deserialize)]
struct VolumeArgs {
    resource: String,
    volume: u32,
}

#[derive(Deserialize)]
struct ResizeArgs {
    resource: String,
    volume: u32,
    size_gib: u64,
}

#[derive(Deserialize)]
struct RoleArgs {
    resource: String,
    node: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct FilesystemArgs {
    resource: String,
    node: String,
    #[serde(default)]
    volume: u32,
    fstype: String,
}

#[derive(Deserialize)]
struct MountArgs {
    resource: String,
    node: String,
    #[serde(default)]
    volume: u32,
    path: String,
    #[serde(default)]
    fstype: Option<String>,
}

#[derive(Deserialize)]
struct UnmountArgs {
    resource: String,
    node: String,
    path: String,
}

/// Snapshot target, by resource and volume number or by backing volume path
#[derive(Deserialize)]
struct SnapshotArgs {
    #[serde(default)]
    resource: Option<String>,
    node: String,
    #[serde(default)]
    volume: u32,
    /// `pool/<resource>_vol<id>`
    #[serde(default)]
    volume_path: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size_gib: Option<u64>,
}

impl SnapshotArgs {
    fn target(&self) -> Result<(String, u32)> {
        match (&self.volume_path, &self.resource) {
            (Some(path), _) => parse_volume_ref(path),
            (None, Some(resource)) => Ok((resource.clone(), self.volume)),
            (None, None) => Err(Error::InvalidArgument(
                "either resource or volume_path is required".into(),
            )),
        }
    }

    fn name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("snapshot name is required".into()))
    }
}

#[derive(Deserialize)]
struct ZfsObject {
    node: String,
    name: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Deserialize)]
struct ZfsListArgs {
    node: String,
    kind: ZfsKind,
    #[serde(default)]
    root: Option<String>,
}

async fn dispatch(svc: &Services, group: &str, method: &str, body: Value) -> Result<Value> {
    match (group, method) {
        // === Nodes ===
        ("node", "register") => {
            let a: RegisterArgs = args(body)?;
            payload(svc.ctx.registry.register(&a.name, &a.address, a.agent_port).await?)
        }
        ("node", "unregister") => {
            let a: Named = args(body)?;
            svc.ctx.registry.unregister(&a.name)?;
            Ok(Value::Null)
        }
        ("node", "get") => payload(svc.ctx.registry.get(&args::<Named>(body)?.name)?),
        ("node", "list") => payload(svc.ctx.registry.list()?),
        ("node", "health_check") => payload(svc.ctx.registry.probe_all().await),

        // === Pools ===
        ("pool", "create") => payload(svc.pools.create(args::<PoolRequest>(body)?).await?),
        ("pool", "get") => {
            let a: NodeObject = args(body)?;
            payload(svc.pools.get(&a.node, &a.name)?)
        }
        ("pool", "list") => payload(svc.pools.list(args::<NodeFilter>(body)?.node.as_deref())?),
        ("pool", "delete") => {
            let a: NodeObject = args(body)?;
            svc.pools.delete(&a.node, &a.name).await?;
            Ok(Value::Null)
        }
        ("pool", "add_disk") => {
            let a: AddDiskArgs = args(body)?;
            payload(svc.pools.add_disks(&a.node, &a.name, &a.devices).await?)
        }

        // === Resources ===
        ("resource", "create") => {
            payload(svc.orchestrator.create_resource(args::<CreateRequest>(body)?).await?)
        }
        ("resource", "delete") => {
            svc.orchestrator.delete_resource(&args::<Named>(body)?.name).await?;
            Ok(Value::Null)
        }
        ("resource", "get") => payload(svc.orchestrator.get(&args::<Named>(body)?.name)?),
        ("resource", "list") => payload(svc.orchestrator.list()?),
        ("resource", "status") => payload(svc.orchestrator.status(&args::<Named>(body)?.name).await?),
        ("resource", "add_volume") => {
            let a: AddVolumeArgs = args(body)?;
            payload(svc.orchestrator.add_volume(&a.resource, a.size_gib).await?)
        }
        ("resource", "remove_volume") => {
            let a: VolumeArgs = args(body)?;
            svc.orchestrator.remove_volume(&a.resource, a.volume).await?;
            Ok(Value::Null)
        }
        ("resource", "resize_volume") => {
            let a: ResizeArgs = args(body)?;
            payload(svc.orchestrator.resize_volume(&a.resource, a.volume, a.size_gib).await?)
        }
        ("resource", "set_primary") => {
            let a: RoleArgs = args(body)?;
            payload(svc.orchestrator.set_primary(&a.resource, &a.node, a.force).await?)
        }
        ("resource", "set_secondary") => {
            let a: RoleArgs = args(body)?;
            payload(svc.orchestrator.set_secondary(&a.resource, &a.node).await?)
        }
        ("resource", "create_filesystem") => {
            let a: FilesystemArgs = args(body)?;
            payload(
                svc.orchestrator
                    .create_filesystem(&a.resource, &a.node, a.volume, &a.fstype)
                    .await?,
            )
        }
        ("resource", "mount") => {
            let a: MountArgs = args(body)?;
            payload(
                svc.orchestrator
                    .mount(&a.resource, &a.node, a.volume, &a.path, a.fstype.as_deref())
                    .await?,
            )
        }
        ("resource", "unmount") => {
            let a: UnmountArgs = args(body)?;
            payload(svc.orchestrator.unmount(&a.resource, &a.node, &a.path).await?)
        }
        ("resource", "intents") => payload(svc.ctx.intents.list()?),

        // === HA ===
        ("ha", "make") => payload(svc.ha.make_ha(args::<MakeHaRequest>(body)?).await?),
        ("ha", "delete") => {
            svc.ha.delete_ha(&args::<ResourceArg>(body)?.resource).await?;
            Ok(Value::Null)
        }
        ("ha", "get") => payload(svc.ha.get(&args::<ResourceArg>(body)?.resource)?),
        ("ha", "list") => payload(svc.ha.list()?),
        ("ha", "evict") => payload(svc.failover.evict(&args::<ResourceArg>(body)?.resource).await?),

        // === Snapshots ===
        ("snapshot", "create") => {
            let a: SnapshotArgs = args(body)?;
            let (resource, volume) = a.target()?;
            payload(
                svc.snapshots
                    .create(SnapshotRequest {
                        resource,
                        node: a.node.clone(),
                        volume,
                        name: a.name()?.to_string(),
                        size_gib: a.size_gib,
                    })
                    .await?,
            )
        }
        ("snapshot", "delete") => {
            let a: SnapshotArgs = args(body)?;
            let (resource, volume) = a.target()?;
            svc.snapshots.delete(&resource, &a.node, volume, a.name()?).await?;
            Ok(Value::Null)
        }
        ("snapshot", "restore") | ("snapshot", "rollback") => {
            let a: SnapshotArgs = args(body)?;
            let (resource, volume) = a.target()?;
            svc.snapshots.restore(&resource, &a.node, volume, a.name()?).await?;
            Ok(Value::Null)
        }
        ("snapshot", "list") => {
            payload(svc.snapshots.list(args::<ResourceFilter>(body)?.resource.as_deref())?)
        }
        ("snapshot", "list_node") => {
            let a: SnapshotArgs = args(body)?;
            let (resource, volume) = a.target()?;
            payload(svc.snapshots.list_on_node(&resource, &a.node, volume).await?)
        }

        // === Gateways ===
        ("gateway", "create") => payload(svc.gateways.create(args::<GatewayRequest>(body)?).await?),
        ("gateway", "get") => payload(svc.gateways.get(&args::<Named>(body)?.name)?),
        ("gateway", "list") => {
            payload(svc.gateways.list(args::<ResourceFilter>(body)?.resource.as_deref())?)
        }
        ("gateway", "start") => payload(svc.gateways.start(&args::<Named>(body)?.name).await?),
        ("gateway", "stop") => payload(svc.gateways.stop(&args::<Named>(body)?.name).await?),
        ("gateway", "delete") => {
            svc.gateways.delete(&args::<Named>(body)?.name).await?;
            Ok(Value::Null)
        }

        // === ZFS ===
        ("zfs", "pool_create") => {
            svc.zfs.pool_create(args::<ZfsPoolRequest>(body)?).await?;
            Ok(Value::Null)
        }
        ("zfs", "pool_destroy") => {
            let a: ZfsObject = args(body)?;
            svc.zfs.pool_destroy(&a.node, &a.name).await?;
            Ok(Value::Null)
        }
        ("zfs", "dataset_create") => {
            svc.zfs.dataset_create(args::<ZfsDatasetRequest>(body)?).await?;
            Ok(Value::Null)
        }
        ("zfs", "dataset_destroy") => {
            let a: ZfsObject = args(body)?;
            svc.zfs.dataset_destroy(&a.node, &a.name, a.recursive).await?;
            Ok(Value::Null)
        }
        ("zfs", "volume_create") => {
            svc.zfs.volume_create(args::<ZfsVolumeRequest>(body)?).await?;
            Ok(Value::Null)
        }
        ("zfs", "volume_destroy") => {
            let a: ZfsObject = args(body)?;
            svc.zfs.volume_destroy(&a.node, &a.name).await?;
            Ok(Value::Null)
        }
        ("zfs", "list") => {
            let a: ZfsListArgs = args(body)?;
            payload(svc.zfs.list(&a.node, a.kind, a.root.as_deref()).await?)
        }

        _ => Err(Error::NotFound(format!("no method {}/{}", group, method))),
    }
}

#[derive(Deserialize)]
struct WatchQuery {
    #[serde(default)]
    prefix: String,
}

/// Server-sent store changes under `prefix`
async fn watch_sse(
    State(state): State<ApiState>,
    Query(query): Query<WatchQuery>,
) -> Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>> {
    let mut changes = Box::pin(state.services.ctx.store.watch(&query.prefix));
    let shutdown = state.services.ctx.shutdown.clone();
    let stream = stream! {
        loop {
            let change = tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.next() => change,
            };
            let Some(change) = change else { break };
            match Event::default().event(change.key.clone()).json_data(&change) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!(key = %change.key, error = %e, "watch event not encodable"),
            }
        }
    };
    Sse::new(stream)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let ctx = &state.services.ctx;
    let nodes = ctx.registry.list().map(|n| n.len()).unwrap_or(0);
    let status = if ctx.shutdown.is_cancelled() { "stopping" } else { "healthy" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "revision": ctx.store.revision(),
        "nodes": nodes,
        "uptime_secs": METRICS.uptime_seconds(),
    }))
}

async fn metrics(State(_state): State<ApiState>) -> impl IntoResponse {
    metrics_text().await
}

async fn metrics_text() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_from_rolled_back_error() {
        let err = Error::RolledBack {
            error: Box::new(Error::PartialFailure {
                message: "bring-up failed on n2".into(),
                failures: vec![NodeFailure {
                    node: "n2".into(),
                    kind: ErrorKind::Unreachable,
                    message: "connection refused".into(),
                }],
            }),
            rollback: RollbackStatus::Complete,
        };
        let env = Envelope::from_error(&err);
        assert!(!env.success);
        assert_eq!(env.kind, Some(ErrorKind::PartialFailure));
        assert_eq!(env.rollback_status, Some(RollbackStatus::Complete));
        assert_eq!(env.failures.len(), 1);
        assert!(!env.retriable);

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "partial_failure");
        assert_eq!(json["rollback_status"], "complete");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_envelope_ok_omits_null_payload() {
        let env = Envelope::ok(Value::Null);
        assert!(env.success);
        assert!(env.payload.is_none());
        let env = Envelope::ok(json!({"name": "r0"}));
        assert_eq!(env.payload.unwrap()["name"], "r0");
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(b"").unwrap(), json!({}));
        assert_eq!(parse_body(b"  \n").unwrap(), json!({}));
        let err = parse_body(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_snapshot_args_target() {
        let a: SnapshotArgs = args(json!({"node": "n1", "volume_path": "vg0/r0_vol2", "name": "s"})).unwrap();
        assert_eq!(a.target().unwrap(), ("r0".to_string(), 2));
        let a: SnapshotArgs = args(json!({"node": "n1", "resource": "r1", "volume": 1})).unwrap();
        assert_eq!(a.target().unwrap(), ("r1".to_string(), 1));
        assert!(a.name().is_err());
        let a: SnapshotArgs = args(json!({"node": "n1"})).unwrap();
        assert!(a.target().is_err());
    }

    #[tokio::test]
    async fn test_metrics_router_serves_prometheus_text() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = metrics_router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("sds_"));
    }
}
