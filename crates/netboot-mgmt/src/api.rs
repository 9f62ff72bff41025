use crate::config::MgmtConfig;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use netboot_iscsi::{DeviceType, DeviceUpdate, ErrorKind, IscsiService, OperationResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// Boot log entries returned when no limit is given.
const DEFAULT_LOG_LIMIT: usize = 100;

/// Body of `POST /api/v1/iscsi/images`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateImageRequest {
    /// Image name.
    pub name: String,
    /// Size in GiB.
    pub size_gb: u64,
}

/// Body of `POST /api/v1/devices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceRequest {
    /// Device MAC address.
    pub mac: String,
    /// Hardware class.
    pub device_type: DeviceType,
    /// Display name; derived from the MAC when empty.
    #[serde(default)]
    pub name: String,
}

/// Body of `POST /api/v1/boot/logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootLogRequest {
    /// Device MAC address.
    pub mac: String,
    /// Event name.
    pub event: String,
    /// Free-form details.
    #[serde(default)]
    pub details: String,
    /// Client IP; taken from `x-forwarded-for` when empty.
    #[serde(default)]
    pub ip: String,
}

/// Body of `POST /api/v1/devices/:mac/transfer`, sent by the file server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransferRequest {
    /// Bytes served in this response.
    pub bytes: u64,
    /// Requested path.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct DestQuery {
    dest_name: String,
}

#[derive(Debug, Deserialize)]
struct MacQuery {
    mac: String,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    mac: Option<String>,
    limit: Option<usize>,
}

/// Admin HTTP API over the iSCSI service.
pub struct AdminApi {
    service: Arc<IscsiService>,
    config: Arc<MgmtConfig>,
}

impl AdminApi {
    /// API over `service`.
    pub fn new(service: Arc<IscsiService>, config: Arc<MgmtConfig>) -> Self {
        Self { service, config }
    }

    /// Full router: token-protected `/api/v1` plus public health and check-in routes.
    pub fn router(self: Arc<Self>) -> Router {
        let protected = Router::new()
            .route(
                "/api/v1/iscsi/images",
                get(list_images_handler).post(create_image_handler),
            )
            .route(
                "/api/v1/iscsi/images/:name",
                get(get_image_handler).delete(delete_image_handler),
            )
            .route("/api/v1/iscsi/images/:name/copy", post(copy_image_handler))
            .route("/api/v1/iscsi/images/:name/rename", post(rename_image_handler))
            .route("/api/v1/iscsi/images/:name/link", post(link_device_handler))
            .route("/api/v1/iscsi/images/:name/unlink", post(unlink_image_handler))
            .route("/api/v1/iscsi/images/:name/metrics", get(image_metrics_handler))
            .route(
                "/api/v1/devices",
                get(list_devices_handler).post(register_device_handler),
            )
            .route(
                "/api/v1/devices/:mac",
                get(get_device_handler)
                    .put(update_device_handler)
                    .delete(delete_device_handler),
            )
            .route(
                "/api/v1/devices/:mac/transfer",
                get(get_transfer_handler).post(record_transfer_handler),
            )
            .route(
                "/api/v1/devices/:mac/transfer/reset",
                post(reset_transfer_handler),
            )
            .route(
                "/api/v1/boot/logs",
                get(boot_logs_handler).post(add_boot_log_handler),
            )
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                auth_middleware,
            ));

        // Booting devices carry no token.
        let public = Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/api/v1/boot/check-in", get(check_in_handler));

        Router::new()
            .merge(protected)
            .merge(public)
            .layer(axum::middleware::from_fn(security_headers_middleware))
            .with_state(self)
    }

    /// Restores persisted targets, then serves until the listener fails.
    pub async fn serve(self) -> anyhow::Result<()> {
        let restored = self.service.restore_all().await;
        match restored.data {
            Some(outcomes) => info!("Restored target registrations for {} images", outcomes.len()),
            None => warn!(
                "Target restore failed: {}",
                restored.error.unwrap_or_default()
            ),
        }

        let addr = self.config.bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Admin API listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

fn status_for(kind: Option<ErrorKind>) -> StatusCode {
    match kind {
        Some(ErrorKind::AlreadyExists) | Some(ErrorKind::AlreadyAssigned) => StatusCode::CONFLICT,
        Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::InvalidArgument) | Some(ErrorKind::AmbiguousAttribution) => {
            StatusCode::BAD_REQUEST
        }
        Some(ErrorKind::DaemonCommandFailed) => StatusCode::BAD_GATEWAY,
        Some(ErrorKind::FileSystemError) | Some(ErrorKind::Store) | None => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn respond<T: Serialize>(result: OperationResult<T>, ok: StatusCode) -> Response {
    let status = if result.success {
        ok
    } else {
        status_for(result.error_kind)
    };
    (status, Json(result)).into_response()
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

async fn list_images_handler(State(state): State<Arc<AdminApi>>) -> Response {
    respond(state.service.list_images(), StatusCode::OK)
}

async fn create_image_handler(
    State(state): State<Arc<AdminApi>>,
    Json(req): Json<CreateImageRequest>,
) -> Response {
    respond(
        state.service.create_image(&req.name, req.size_gb).await,
        StatusCode::CREATED,
    )
}

async fn get_image_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
) -> Response {
    respond(state.service.get_image(&name), StatusCode::OK)
}

async fn delete_image_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
) -> Response {
    respond(state.service.delete_image(&name).await, StatusCode::OK)
}

async fn copy_image_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
    Query(query): Query<DestQuery>,
) -> Response {
    respond(
        state.service.copy_image(&name, &query.dest_name).await,
        StatusCode::CREATED,
    )
}

async fn rename_image_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
    Query(query): Query<DestQuery>,
) -> Response {
    respond(
        state.service.rename_image(&name, &query.dest_name).await,
        StatusCode::OK,
    )
}

async fn link_device_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
    Query(query): Query<MacQuery>,
) -> Response {
    respond(
        state.service.link_device(&name, &query.mac).await,
        StatusCode::OK,
    )
}

async fn unlink_image_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
) -> Response {
    let lookup = state.service.get_image(&name);
    match lookup.data.as_ref().and_then(|i| i.assigned_to.clone()) {
        Some(mac) => respond(state.service.unlink_device(&mac).await, StatusCode::OK),
        None if lookup.success => respond(OperationResult::ok(None::<String>), StatusCode::OK),
        None => respond(lookup.map(|_| None::<String>), StatusCode::OK),
    }
}

async fn image_metrics_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
) -> Response {
    respond(
        state.service.get_image_connection_metrics(&name).await,
        StatusCode::OK,
    )
}

async fn list_devices_handler(State(state): State<Arc<AdminApi>>) -> Response {
    respond(state.service.list_devices(), StatusCode::OK)
}

async fn register_device_handler(
    State(state): State<Arc<AdminApi>>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Response {
    respond(
        state
            .service
            .register_device(&req.mac, req.device_type, &req.name),
        StatusCode::CREATED,
    )
}

async fn get_device_handler(
    State(state): State<Arc<AdminApi>>,
    Path(mac): Path<String>,
) -> Response {
    respond(state.service.get_device(&mac), StatusCode::OK)
}

async fn update_device_handler(
    State(state): State<Arc<AdminApi>>,
    Path(mac): Path<String>,
    Json(update): Json<DeviceUpdate>,
) -> Response {
    respond(state.service.update_device(&mac, &update).await, StatusCode::OK)
}

async fn delete_device_handler(
    State(state): State<Arc<AdminApi>>,
    Path(mac): Path<String>,
) -> Response {
    respond(state.service.delete_device(&mac).await, StatusCode::OK)
}

async fn get_transfer_handler(
    State(state): State<Arc<AdminApi>>,
    Path(mac): Path<String>,
) -> Response {
    respond(state.service.get_device_transfer(&mac), StatusCode::OK)
}

async fn record_transfer_handler(
    State(state): State<Arc<AdminApi>>,
    Path(mac): Path<String>,
    headers: HeaderMap,
    Json(req): Json<HttpTransferRequest>,
) -> Response {
    respond(
        state
            .service
            .record_http_transfer(&mac, req.bytes, &req.path, &client_ip(&headers)),
        StatusCode::OK,
    )
}

async fn reset_transfer_handler(
    State(state): State<Arc<AdminApi>>,
    Path(mac): Path<String>,
) -> Response {
    respond(state.service.reset_device_transfer(&mac), StatusCode::OK)
}

async fn check_in_handler(
    State(state): State<Arc<AdminApi>>,
    headers: HeaderMap,
    Query(query): Query<MacQuery>,
) -> Response {
    respond(
        state.service.check_in(&query.mac, &client_ip(&headers)),
        StatusCode::OK,
    )
}

async fn boot_logs_handler(
    State(state): State<Arc<AdminApi>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    respond(
        state.service.boot_logs(
            query.mac.as_deref(),
            query.limit.unwrap_or(DEFAULT_LOG_LIMIT),
        ),
        StatusCode::OK,
    )
}

async fn add_boot_log_handler(
    State(state): State<Arc<AdminApi>>,
    headers: HeaderMap,
    Json(req): Json<BootLogRequest>,
) -> Response {
    let ip = if req.ip.is_empty() {
        client_ip(&headers)
    } else {
        req.ip.clone()
    };
    respond(
        state
            .service
            .add_boot_log(&req.mac, &req.event, &req.details, &ip),
        StatusCode::CREATED,
    )
}

async fn auth_middleware(
    State(state): State<Arc<AdminApi>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = state.config.admin_token.as_deref() else {
        warn!("[SECURITY WARNING] admin API is running without authentication, set admin_token in config");
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(provided) if bool::from(provided.as_bytes().ct_eq(token.as_bytes())) => {
            next.run(request).await
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Bearer realm="netboot-mgmt""#)],
            "Unauthorized",
        )
            .into_response(),
    }
}

async fn security_headers_middleware(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use netboot_iscsi::{FakeOp, FakeTargetDaemon, IscsiConfig, MemoryStore};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApi {
        _dir: TempDir,
        daemon: Arc<FakeTargetDaemon>,
        router: Router,
    }

    fn test_api(token: Option<&str>) -> TestApi {
        let dir = TempDir::new().unwrap();
        let daemon = Arc::new(FakeTargetDaemon::new());
        let service = Arc::new(IscsiService::new(
            IscsiConfig::with_root(dir.path()),
            daemon.clone(),
            Arc::new(MemoryStore::new()),
        ));
        let config = MgmtConfig {
            admin_token: token.map(|t| t.to_string()),
            ..MgmtConfig::default()
        };
        let router = Arc::new(AdminApi::new(service, Arc::new(config))).router();
        TestApi {
            _dir: dir,
            daemon,
            router,
        }
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn json_req(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn create(router: &Router, name: &str) -> (StatusCode, serde_json::Value) {
        send(
            router,
            json_req(
                "POST",
                "/api/v1/iscsi/images",
                serde_json::json!({ "name": name, "size_gb": 1 }),
            ),
        )
        .await
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let api = test_api(None);
        let response = api.router.clone().oneshot(get_req("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_endpoint_accessible_without_auth() {
        let api = test_api(Some("secret-token"));
        let (status, json) = send(&api.router, get_req("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.get("version").is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_request_rejected_with_token() {
        let api = test_api(Some("secret-token"));
        let response = api
            .router
            .clone()
            .oneshot(get_req("/api/v1/iscsi/images"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_invalid_token_and_scheme_rejected() {
        let api = test_api(Some("secret-token"));
        for value in ["Bearer wrong-token", "Basic dXNlcjpwYXNz", "Bearer secret-token-x"] {
            let request = Request::builder()
                .uri("/api/v1/iscsi/images")
                .header(header::AUTHORIZATION, value)
                .body(Body::empty())
                .unwrap();
            let (status, _) = send(&api.router, request).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", value);
        }
    }

    #[tokio::test]
    async fn test_authorized_request_accepted_with_token() {
        let api = test_api(Some("secret-token"));
        let request = Request::builder()
            .uri("/api/v1/iscsi/images")
            .header(header::AUTHORIZATION, "Bearer secret-token")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&api.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_create_then_duplicate_conflicts() {
        let api = test_api(None);
        let (status, json) = create(&api.router, "disk").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["name"], "disk");
        assert_eq!(json["data"]["status"], "available");

        let (status, json) = create(&api.router, "disk").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "already_exists");
        assert_eq!(api.daemon.target_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_is_bad_request() {
        let api = test_api(None);
        let (status, json) = create(&api.router, "../etc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error_kind"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_daemon_failure_is_bad_gateway() {
        let api = test_api(None);
        api.daemon.fail_next(FakeOp::NewTarget, None);
        let (status, json) = create(&api.router, "disk").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error_kind"], "daemon_command_failed");
    }

    #[tokio::test]
    async fn test_get_missing_image_is_not_found() {
        let api = test_api(None);
        let (status, json) = send(&api.router, get_req("/api/v1/iscsi/images/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error_kind"], "not_found");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let api = test_api(None);
        create(&api.router, "disk").await;
        for _ in 0..2 {
            let request = Request::builder()
                .method("DELETE")
                .uri("/api/v1/iscsi/images/disk")
                .body(Body::empty())
                .unwrap();
            let (status, json) = send(&api.router, request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["success"], true);
        }
        assert_eq!(api.daemon.target_count(), 0);
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let api = test_api(None);
        create(&api.router, "base").await;

        let (status, json) = send(
            &api.router,
            post_req("/api/v1/iscsi/images/base/copy?dest_name=clone"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["copied_from"], "base");

        let (status, json) = send(
            &api.router,
            post_req("/api/v1/iscsi/images/clone/rename?dest_name=renamed"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["name"], "renamed");

        let (status, _) = send(&api.router, get_req("/api/v1/iscsi/images/clone")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_link_conflict_and_unlink() {
        let api = test_api(None);
        create(&api.router, "disk").await;

        let (status, json) = send(
            &api.router,
            post_req("/api/v1/iscsi/images/disk/link?mac=AA-BB-CC-DD-EE-01"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["mac"], "aa:bb:cc:dd:ee:01");
        assert!(json["data"]["san_url"]
            .as_str()
            .unwrap()
            .starts_with("iscsi:"));

        let (status, json) = send(
            &api.router,
            post_req("/api/v1/iscsi/images/disk/link?mac=aa:bb:cc:dd:ee:02"),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error_kind"], "already_assigned");

        let (status, json) = send(&api.router, post_req("/api/v1/iscsi/images/disk/unlink")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], "disk");

        let (status, json) = send(&api.router, post_req("/api/v1/iscsi/images/disk/unlink")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["data"].is_null());

        let (status, _) = send(&api.router, post_req("/api/v1/iscsi/images/ghost/unlink")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_for_idle_image() {
        let api = test_api(None);
        create(&api.router, "disk").await;

        let (status, json) = send(&api.router, get_req("/api/v1/iscsi/images/disk/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["image"], "disk");
        assert_eq!(json["data"]["connection"]["active"], false);
        assert_eq!(json["data"]["connection"]["session_count"], 0);
    }

    #[tokio::test]
    async fn test_devices_register_get_and_transfer() {
        let api = test_api(None);
        let body = serde_json::json!({ "mac": "aa:bb:cc:dd:ee:10", "device_type": "x64", "name": "lab-1" });

        let (status, json) = send(&api.router, json_req("POST", "/api/v1/devices", body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["name"], "lab-1");

        let (status, _) = send(&api.router, json_req("POST", "/api/v1/devices", body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) = send(&api.router, get_req("/api/v1/devices/AA:BB:CC:DD:EE:10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["device_type"], "x64");

        let (status, json) = send(
            &api.router,
            json_req(
                "POST",
                "/api/v1/devices/aa:bb:cc:dd:ee:10/transfer",
                serde_json::json!({ "bytes": 4096, "path": "/kernel" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["http_tx_bytes"], 4096);

        let (status, json) = send(
            &api.router,
            post_req("/api/v1/devices/aa:bb:cc:dd:ee:10/transfer/reset"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["http_tx_bytes"], 0);

        let (status, json) = send(&api.router, get_req("/api/v1/devices")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_device_update_and_delete() {
        let api = test_api(None);
        create(&api.router, "lab").await;
        send(&api.router, post_req("/api/v1/iscsi/images/lab/link?mac=aa:bb:cc:dd:ee:11")).await;

        let (status, json) = send(
            &api.router,
            json_req(
                "PUT",
                "/api/v1/devices/aa:bb:cc:dd:ee:11",
                serde_json::json!({ "enabled": false, "name": "bench", "image_id": "other" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["enabled"], false);
        assert_eq!(json["data"]["name"], "bench");
        assert_eq!(json["data"]["image_id"], "lab");

        let (status, json) = send(
            &api.router,
            get_req("/api/v1/boot/check-in?mac=aa:bb:cc:dd:ee:11"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["action"], "boot_default");

        let (status, _) = send(
            &api.router,
            json_req(
                "PUT",
                "/api/v1/devices/aa:bb:cc:dd:ee:12",
                serde_json::json!({ "enabled": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/devices/aa:bb:cc:dd:ee:11")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&api.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], "lab");

        let (_, json) = send(&api.router, get_req("/api/v1/iscsi/images/lab")).await;
        assert_eq!(json["data"]["status"], "available");
        let (status, _) = send(&api.router, get_req("/api/v1/devices/aa:bb:cc:dd:ee:11")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_check_in_is_public_and_logged() {
        let api = test_api(Some("secret-token"));
        let request = Request::builder()
            .uri("/api/v1/boot/check-in?mac=aa:bb:cc:dd:ee:20")
            .header("x-forwarded-for", "192.168.1.77, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&api.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["action"], "show_menu");

        let request = Request::builder()
            .uri("/api/v1/boot/logs?mac=aa:bb:cc:dd:ee:20&limit=5")
            .header(header::AUTHORIZATION, "Bearer secret-token")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&api.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"][0]["event"], "check_in");
        assert_eq!(json["data"][0]["ip"], "192.168.1.77");
    }

    #[tokio::test]
    async fn test_boot_log_post_and_validation() {
        let api = test_api(None);
        let (status, json) = send(
            &api.router,
            json_req(
                "POST",
                "/api/v1/boot/logs",
                serde_json::json!({ "mac": "aa:bb:cc:dd:ee:30", "event": "ipxe_loaded" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["event"], "ipxe_loaded");

        let (status, json) = send(
            &api.router,
            json_req(
                "POST",
                "/api/v1/boot/logs",
                serde_json::json!({ "mac": "aa:bb:cc:dd:ee:30", "event": " " }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(Some(ErrorKind::AlreadyAssigned)), StatusCode::CONFLICT);
        assert_eq!(status_for(Some(ErrorKind::AmbiguousAttribution)), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(Some(ErrorKind::Store)), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(Some(ErrorKind::FileSystemError)), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
