//! HTTP API over the gateway facade.
//!
//! Every route sits behind bearer-token auth when `api.api_key` is set.
//! Errors use one body shape: `{"error": {"code", "message"}}`.

use crate::gateway::Gateway;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info};
use wagate_core::config::ApiConfig;
use wagate_core::error::GatewayError;
use wagate_core::session::{ProxyConfig, QrInfo, Session, SessionStatus};
use wagate_whatsapp::generate_qr_image;

/// Default page size of `GET /sessions`.
const DEFAULT_LIMIT: i64 = 50;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    gateway: Arc<Gateway>,
    api_key: Option<String>,
    uptime: Instant,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    name: String,
    #[serde(default)]
    proxy: Option<ProxyConfig>,
}

#[derive(Debug, Deserialize)]
struct SetProxyRequest {
    #[serde(default)]
    proxy: Option<ProxyConfig>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// A session as returned to callers: the row plus its derived status.
#[derive(Serialize)]
struct SessionView<'a> {
    #[serde(flatten)]
    session: &'a Session,
    status: SessionStatus,
}

fn session_json(session: &Session, now: DateTime<Utc>) -> Value {
    let view = SessionView {
        session,
        status: session.status_at(now),
    };
    serde_json::to_value(view).unwrap_or_else(|_| json!({}))
}

fn sessions_json(sessions: &[Session], now: DateTime<Utc>) -> Value {
    let items: Vec<Value> = sessions.iter().map(|s| session_json(s, now)).collect();
    json!({ "count": items.len(), "sessions": items })
}

/// HTTP status for a gateway error kind.
fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::SessionExists(_)
        | GatewayError::AlreadyConnected(_)
        | GatewayError::NotConnected(_)
        | GatewayError::QrNotAvailable(_)
        | GatewayError::QrGenerationTimeout(_) => StatusCode::CONFLICT,
        GatewayError::QrExpired(_) => StatusCode::GONE,
        GatewayError::ConnectionFailed(_)
        | GatewayError::PairingFailed(_)
        | GatewayError::ProxyError(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Busy(_) => StatusCode::LOCKED,
        GatewayError::Cancelled(_) | GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Storage(_) | GatewayError::DeviceStore(_) | GatewayError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(err: GatewayError) -> ApiError {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("API request failed: {err}");
    }
    (
        status,
        Json(json!({"error": {"code": err.code(), "message": err.public_message()}})),
    )
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"code": "unauthorized", "message": message}})),
    )
}

/// Constant-time string comparison to prevent timing attacks on API token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check bearer token auth. Returns `None` if authorized, `Some(response)` if rejected.
fn check_auth(headers: &HeaderMap, api_key: &Option<String>) -> Option<ApiError> {
    let key = api_key.as_ref()?;

    let Some(header) = headers.get(header::AUTHORIZATION) else {
        return Some(unauthorized("missing Authorization header"));
    };
    let Ok(value) = header.to_str() else {
        return Some(unauthorized("invalid Authorization header"));
    };

    match value.strip_prefix("Bearer ") {
        Some(token) if constant_time_eq(token, key) => None,
        _ => Some(unauthorized("invalid token")),
    }
}

async fn require_auth(
    State(state): State<ApiState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(rejection) = check_auth(&headers, &state.api_key) {
        return rejection.into_response();
    }
    next.run(request).await
}

/// Token for one request, cancelled when the handler future is dropped.
fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

fn qr_json(qr: &QrInfo) -> ApiResult {
    let png = generate_qr_image(&qr.code).map_err(api_error)?;
    Ok(Json(json!({
        "code": qr.code,
        "expires_at": qr.expires_at,
        "timeout_seconds": qr.timeout_seconds,
        "qr_png_base64": BASE64.encode(png),
    })))
}

/// `GET /health`
async fn health(State(state): State<ApiState>) -> ApiResult {
    let stats = state.gateway.stats().await.map_err(api_error)?;
    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime.elapsed().as_secs(),
        "sessions": stats,
    })))
}

/// `GET /stats`
async fn stats(State(state): State<ApiState>) -> ApiResult {
    let stats = state.gateway.stats().await.map_err(api_error)?;
    Ok(Json(json!(stats)))
}

/// `POST /sessions`
async fn create_session(
    State(state): State<ApiState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(req) = body.map_err(|e| api_error(GatewayError::Validation(e.body_text())))?;
    let (cancel, _guard) = request_token();
    let session = state
        .gateway
        .create(&req.name, req.proxy, &cancel)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(session_json(&session, state.gateway.now()))))
}

/// `GET /sessions`
async fn list_sessions(State(state): State<ApiState>, Query(q): Query<ListQuery>) -> ApiResult {
    let sessions = state
        .gateway
        .list(q.limit.unwrap_or(DEFAULT_LIMIT), q.offset.unwrap_or(0))
        .await
        .map_err(api_error)?;
    Ok(Json(sessions_json(&sessions, state.gateway.now())))
}

/// `GET /sessions/connected`
async fn list_connected(State(state): State<ApiState>) -> ApiResult {
    let sessions = state.gateway.list_connected().await.map_err(api_error)?;
    Ok(Json(sessions_json(&sessions, state.gateway.now())))
}

/// `GET /sessions/{id}`
async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let session = state.gateway.get(&id).await.map_err(api_error)?;
    Ok(Json(session_json(&session, state.gateway.now())))
}

/// `GET /sessions/by-name/{name}`
async fn get_session_by_name(State(state): State<ApiState>, Path(name): Path<String>) -> ApiResult {
    let session = state.gateway.get_by_name(&name).await.map_err(api_error)?;
    Ok(Json(session_json(&session, state.gateway.now())))
}

/// `DELETE /sessions/{id}`
async fn delete_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let (cancel, _guard) = request_token();
    state.gateway.delete(&id, &cancel).await.map_err(api_error)?;
    Ok(Json(json!({"status": "deleted", "id": id})))
}

/// `POST /sessions/{id}/connect`: returns once connecting has started.
async fn connect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (cancel, _guard) = request_token();
    state.gateway.connect(&id, &cancel).await.map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "connecting", "id": id})),
    ))
}

/// `POST /sessions/{id}/disconnect`
async fn disconnect(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let (cancel, _guard) = request_token();
    state
        .gateway
        .disconnect(&id, &cancel)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({"status": "disconnected", "id": id})))
}

/// `POST /sessions/{id}/logout`
async fn logout(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let (cancel, _guard) = request_token();
    state.gateway.logout(&id, &cancel).await.map_err(api_error)?;
    Ok(Json(json!({"status": "logged_out", "id": id})))
}

/// `POST /sessions/{id}/qr`: current QR, or start pairing and wait for one.
async fn generate_qr(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let (cancel, _guard) = request_token();
    let qr = state
        .gateway
        .generate_qr(&id, &cancel)
        .await
        .map_err(api_error)?;
    info!("session {id}: QR handed out over API");
    qr_json(&qr)
}

/// `GET /sessions/{id}/qr`
async fn get_qr(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let qr = state.gateway.get_qr(&id).await.map_err(api_error)?;
    qr_json(&qr)
}

/// `GET /sessions/{id}/qr.png`
async fn get_qr_png(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let qr = state.gateway.get_qr(&id).await.map_err(api_error)?;
    let png = generate_qr_image(&qr.code).map_err(api_error)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// `PUT /sessions/{id}/proxy`: applies on the next connect.
async fn set_proxy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Result<Json<SetProxyRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(|e| api_error(GatewayError::Validation(e.body_text())))?;
    let session = state
        .gateway
        .set_proxy(&id, req.proxy)
        .await
        .map_err(api_error)?;
    Ok(Json(session_json(&session, state.gateway.now())))
}

/// `GET /sessions/{id}/proxy`
async fn get_proxy(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let proxy = state.gateway.get_proxy(&id).await.map_err(api_error)?;
    Ok(Json(json!({ "proxy": proxy })))
}

/// Build the axum router with shared state.
fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/connected", get(list_connected))
        .route("/sessions/by-name/{name}", get(get_session_by_name))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/connect", post(connect))
        .route("/sessions/{id}/disconnect", post(disconnect))
        .route("/sessions/{id}/logout", post(logout))
        .route("/sessions/{id}/qr", post(generate_qr).get(get_qr))
        .route("/sessions/{id}/qr.png", get(get_qr_png))
        .route("/sessions/{id}/proxy", get(get_proxy).put(set_proxy))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(config: &ApiConfig, gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let api_key = if config.api_key.is_empty() {
        None
    } else {
        Some(config.api_key.clone())
    };
    let state = ApiState {
        gateway,
        api_key,
        uptime: Instant::now(),
    };

    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("API server failed to bind to {addr}: {e}");
            return;
        }
    };

    info!("API server listening on {addr}");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        error!("API server error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fakes::FakeContainer;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use tower::ServiceExt;
    use wagate_core::clock::{SharedClock, SystemClock};
    use wagate_core::config::RuntimeConfig;
    use wagate_store::SessionRepository;

    async fn test_router(api_key: Option<String>) -> (Router, Arc<FakeContainer>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let clock: SharedClock = Arc::new(SystemClock);
        let repo = SessionRepository::from_pool(pool, clock.clone())
            .await
            .unwrap();
        let container = FakeContainer::new();
        let runtime = RuntimeConfig {
            qr_wait_timeout_secs: 1,
            qr_poll_interval_ms: 10,
            ..RuntimeConfig::default()
        };
        let gateway = Gateway::new(repo, container.clone(), clock, runtime, false, None);
        let state = ApiState {
            gateway,
            api_key,
            uptime: Instant::now(),
        };
        (build_router(state), container)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    /// Parse response body as JSON.
    async fn body_json(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn create(app: &Router, name: &str) -> String {
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/sessions", json!({"name": name})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_no_auth() {
        let (app, _) = test_router(None).await;
        let resp = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sessions"]["total"], 0);
    }

    #[tokio::test]
    async fn test_health_valid_auth() {
        let (app, _) = test_router(Some("secret".to_string())).await;
        let req = HttpRequest::get("/health")
            .header("Authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_or_missing_auth() {
        let (app, _) = test_router(Some("secret".to_string())).await;
        let req = HttpRequest::get("/sessions")
            .header("Authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"]["code"], "unauthorized");

        let resp = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_and_fetch_session() {
        let (app, _) = test_router(None).await;
        let id = create(&app, "alpha").await;

        let resp = app
            .clone()
            .oneshot(empty_request("GET", &format!("/sessions/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["name"], "alpha");
        assert_eq!(json["status"], "created");
        assert_eq!(json["is_connected"], false);

        let resp = app
            .clone()
            .oneshot(empty_request("GET", "/sessions/by-name/alpha"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["id"], id.as_str());

        let resp = app
            .oneshot(empty_request("GET", "/sessions?limit=10"))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["count"], 1);
    }

    #[tokio::test]
    async fn test_create_errors_map_to_status() {
        let (app, _) = test_router(None).await;
        create(&app, "alpha").await;

        let resp = app
            .clone()
            .oneshot(json_request("POST", "/sessions", json!({"name": "alpha"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"]["code"], "session_exists");

        let resp = app
            .clone()
            .oneshot(json_request("POST", "/sessions", json!({"name": "no spaces"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "validation");

        let resp = app
            .oneshot(json_request("POST", "/sessions", json!({"nom": "x"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (app, _) = test_router(None).await;
        let resp = app
            .oneshot(empty_request("GET", "/sessions/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_qr_flow_over_http() {
        let (app, container) = test_router(None).await;
        let id = create(&app, "alpha").await;

        let resp = app
            .clone()
            .oneshot(empty_request("GET", &format!("/sessions/{id}/qr")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"]["code"], "qr_not_available");

        let resp = app
            .clone()
            .oneshot(empty_request("POST", &format!("/sessions/{id}/connect")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        container.client(1).unwrap().emit_qr("2@abc").await;
        let mut qr = Value::Null;
        for _ in 0..100 {
            let resp = app
                .clone()
                .oneshot(empty_request("GET", &format!("/sessions/{id}/qr")))
                .await
                .unwrap();
            if resp.status() == StatusCode::OK {
                qr = body_json(resp).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(qr["code"], "2@abc");
        assert!(qr["timeout_seconds"].as_i64().unwrap() > 0);
        assert!(!qr["qr_png_base64"].as_str().unwrap().is_empty());

        let resp = app
            .clone()
            .oneshot(empty_request("GET", &format!("/sessions/{id}/qr.png")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..4], b"\x89PNG");

        let resp = app
            .oneshot(empty_request("POST", &format!("/sessions/{id}/qr")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["code"], "2@abc");
    }

    #[tokio::test]
    async fn test_proxy_round_trip() {
        let (app, _) = test_router(None).await;
        let id = create(&app, "alpha").await;
        let uri = format!("/sessions/{id}/proxy");

        let proxy = json!({"proxy": {"type": "socks5", "host": "10.0.0.1", "port": 1080}});
        let resp = app
            .clone()
            .oneshot(json_request("PUT", &uri, proxy))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.clone().oneshot(empty_request("GET", &uri)).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["proxy"]["type"], "socks5");
        assert_eq!(json["proxy"]["port"], 1080);

        let bad = json!({"proxy": {"type": "http", "host": "", "port": 8080}});
        let resp = app.oneshot(json_request("PUT", &uri, bad)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_then_stats() {
        let (app, _) = test_router(None).await;
        let id = create(&app, "alpha").await;
        create(&app, "beta").await;

        let resp = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/sessions/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(empty_request("GET", "/stats")).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["connected"], 0);
        assert_eq!(json["offline"], 1);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&GatewayError::QrExpired(String::new())),
            StatusCode::GONE
        );
        assert_eq!(
            status_for(&GatewayError::Busy(String::new())),
            StatusCode::LOCKED
        );
        assert_eq!(
            status_for(&GatewayError::Cancelled(String::new())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&GatewayError::DeviceStore(String::new())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&GatewayError::ProxyError(String::new())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secrets"));
    }
}
