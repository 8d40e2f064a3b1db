//! Mock aggregation server.
//!
//! Accepts `POST /api/v1/o.json` exactly like the real server: body is
//! an HTTP publish payload, response is 200 unless a status has been
//! scripted.  Every received payload is recorded together with the
//! token header and the status it was answered with.

use axum::Router;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use sol_core::SolObject;
use sol_core::http_payload::{self, HttpPayload};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// One recorded publish request.
#[derive(Debug, Clone)]
pub struct ReceivedPayload {
    pub token: Option<String>,
    pub status: u16,
    pub payload: HttpPayload,
}

#[derive(Default)]
struct ServerState {
    received: Mutex<Vec<ReceivedPayload>>,
    scripted: Mutex<VecDeque<u16>>,
}

/// An in-process stand-in for the remote aggregation server.
pub struct MockSolServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockSolServer {
    /// Start on an ephemeral port.
    pub async fn start() -> std::io::Result<MockSolServer> {
        Self::start_on(0).await
    }

    /// Start on a specific port (0 = ephemeral).  Binding a fixed port
    /// lets tests model a server that comes up late.
    pub async fn start_on(port: u16) -> std::io::Result<MockSolServer> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState::default());

        let app = Router::new()
            .route("/api/v1/o.json", post(handle_publish))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(MockSolServer { addr, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port`, the form the gateway's `solserver_host` key takes.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Answer the next publish request with `status` instead of 200.
    pub fn script_status(&self, status: u16) {
        self.state.scripted.lock().unwrap().push_back(status);
    }

    /// Script several responses at once, consumed in order.
    pub fn script_statuses(&self, statuses: &[u16]) {
        let mut scripted = self.state.scripted.lock().unwrap();
        scripted.extend(statuses.iter().copied());
    }

    /// Everything received so far.
    pub fn received(&self) -> Vec<ReceivedPayload> {
        self.state.received.lock().unwrap().clone()
    }

    /// Objects from payloads that were answered 200, decoded, in
    /// arrival order.
    pub fn accepted_objects(&self) -> Vec<SolObject> {
        self.received()
            .iter()
            .filter(|r| r.status == 200)
            .flat_map(|r| http_payload::from_payload(&r.payload).expect("payload decodes"))
            .collect()
    }
}

async fn handle_publish(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(payload): Json<HttpPayload>,
) -> StatusCode {
    let status = state
        .scripted
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(200);
    let token = headers
        .get("X-REALMS-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    state.received.lock().unwrap().push(ReceivedPayload {
        token,
        status,
        payload,
    });
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
