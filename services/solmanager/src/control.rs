//! Authenticated HTTPS control API.
//!
//! Endpoints (all under `/api/v1/`, token-gated):
//! - `POST echo.json`           — echo the body verbatim
//! - `GET  status.json`         — versions, uptime, stats
//! - `POST resend.json`         — count / re-publish a backup range
//! - `POST smartmeshipapi.json` — raw Manager command passthrough
//! - `POST snapshot.json`       — cached snapshot or trigger a new one
//!
//! # Auth
//! Every request is counted; the `X-REALMS-Token` header must equal the
//! configured token or the answer is 401.  A handler panic is caught,
//! counted as a crash, and reported as a 500 with a crash summary.
//!
//! TLS is terminated here when a certificate/key pair is configured;
//! without one the listener is plain TCP (test deployments).

use crate::clock::now_epoch;
use crate::manager::{LinkError, ManagerHandle};
use crate::publishers::ServerPublisher;
use crate::snapshot::SnapshotCollector;
use crate::stats::{StatsRegistry, names};
use crate::version;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Json, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum_server::tls_rustls::RustlsConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use sol_core::backup;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::catch_panic::{CatchPanicLayer, ResponseForPanic};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControlState {
    pub stats: Arc<StatsRegistry>,
    pub handle: Arc<ManagerHandle>,
    pub server_pub: Arc<ServerPublisher>,
    pub snapshots: Arc<SnapshotCollector>,
    pub backup_path: PathBuf,
    pub token: String,
    /// Epoch seconds at process start; drives `uptime`/`last_reboot`.
    pub started_at: i64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: ControlState) -> Router {
    let panic_responder = PanicResponder {
        stats: state.stats.clone(),
    };
    Router::new()
        .route("/api/v1/echo.json", post(echo))
        .route("/api/v1/status.json", get(status))
        .route("/api/v1/resend.json", post(resend))
        .route("/api/v1/smartmeshipapi.json", post(smartmesh_api))
        .route("/api/v1/snapshot.json", post(snapshot))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .layer(CatchPanicLayer::custom(panic_responder))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control API until shutdown, with TLS when configured.
pub async fn serve(
    bind: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    match tls {
        Some((cert, key)) => {
            let config = RustlsConfig::from_pem_file(&cert, &key).await?;
            let handle = axum_server::Handle::new();
            let graceful = handle.clone();
            tokio::spawn(async move {
                wait_for_shutdown(&mut shutdown).await;
                graceful.graceful_shutdown(Some(Duration::from_secs(5)));
            });
            info!(addr = %bind, "control API listening (tls)");
            axum_server::bind_rustls(bind, config)
                .handle(handle)
                .serve(router.into_make_service())
                .await
        }
        None => {
            let listener = tokio::net::TcpListener::bind(bind).await?;
            info!(addr = %bind, "control API listening (plain)");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    wait_for_shutdown(&mut shutdown).await;
                })
                .await
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn auth(State(state): State<ControlState>, request: Request, next: Next) -> Response {
    state.stats.incr(names::JSON_NUM_REQ);

    let presented = request
        .headers()
        .get("X-REALMS-Token")
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.token.as_str()) {
        state.stats.incr(names::JSON_NUM_UNAUTHORIZED);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response();
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Echo the request body byte-for-byte, mirroring its content type.
async fn echo(headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    ([(CONTENT_TYPE, content_type)], body).into_response()
}

async fn status(State(state): State<ControlState>) -> Json<Value> {
    let now = now_epoch();
    Json(json!({
        "solmanager_version": version::render(version::solmanager_version()),
        "sdk_version": version::render(version::SDK_VERSION),
        "sol_version": version::render(version::SOL_VERSION),
        "uptime": now - state.started_at,
        "utc": now,
        "date": rfc3339(now),
        "last_reboot": rfc3339(state.started_at),
        "stats": state.stats.snapshot(),
    }))
}

fn rfc3339(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct ResendRequest {
    action: String,
    #[serde(rename = "startTimestamp")]
    start_timestamp: i64,
    #[serde(rename = "endTimestamp")]
    end_timestamp: i64,
}

async fn resend(State(state): State<ControlState>, Json(body): Json<Value>) -> Response {
    let request: ResendRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("bad resend request: {e}")})),
            )
                .into_response();
        }
    };

    if !matches!(request.action.as_str(), "count" | "resend") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Unknown action '{}'", request.action)})),
        )
            .into_response();
    }

    let scan = backup::scan_range(
        &state.backup_path,
        request.start_timestamp,
        request.end_timestamp,
    );
    let objects = match scan {
        Ok(objects) => objects,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("backup scan failed: {e}")})),
            )
                .into_response();
        }
    };

    if request.action == "resend" {
        let n = state.server_pub.enqueue_resend(objects);
        info!(objects = n, "backup range re-published");
        return Json(json!({"numObjects": n})).into_response();
    }
    Json(json!({"numObjects": objects.len()})).into_response()
}

#[derive(Debug, Deserialize)]
struct RawApiRequest {
    /// Manager selector; this gateway drives a single Manager, so the
    /// field is accepted and ignored.
    #[allow(dead_code)]
    manager: Option<Value>,
    command: String,
    fields: Option<Value>,
}

async fn smartmesh_api(
    State(state): State<ControlState>,
    Json(request): Json<RawApiRequest>,
) -> Response {
    let fields = request.fields.unwrap_or_else(|| json!({}));
    match state.handle.issue_raw(&request.command, fields).await {
        Ok(fields) => Json(json!({"rc": 0, "fields": fields})).into_response(),
        // A rejected command is a Manager answer, not a gateway error.
        Err(LinkError::Rc { rc, .. }) => {
            Json(json!({"rc": rc, "fields": {}})).into_response()
        }
        Err(LinkError::Closed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "manager not connected"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn snapshot(State(state): State<ControlState>) -> Response {
    if let Some(cached) = state.snapshots.cached() {
        return Json(cached).into_response();
    }
    let collector = state.snapshots.clone();
    tokio::spawn(async move {
        let _ = collector.collect_and_publish().await;
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "started"})),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Panic -> 500 + crash accounting
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct PanicResponder {
    stats: Arc<StatsRegistry>,
}

impl ResponseForPanic for PanicResponder {
    type ResponseBody = axum::body::Body;

    fn response_for_panic(
        &mut self,
        err: Box<dyn std::any::Any + Send + 'static>,
    ) -> axum::http::Response<Self::ResponseBody> {
        let message = if let Some(s) = err.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        error!(panic = %message, "control API handler crashed");
        self.stats.incr(names::ADM_NUM_CRASHES);
        self.stats
            .set_gauge(names::ADM_LAST_CRASH_TS, now_epoch() as u64);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("handler crashed: {message}")})),
        )
            .into_response()
    }
}
