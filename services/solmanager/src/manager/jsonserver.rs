//! JSON-server Manager link.
//!
//! For deployments where the Manager is fronted by a co-located JSON
//! server instead of a serial device.  Notifications arrive as inbound
//! HTTP POSTs on the gateway's own listener:
//!
//! - `POST /hr`, `/notifData`, `/oap`, `/notifLog`, `/notifIpData`,
//!   `/event` — body is the JSON notification record.
//!
//! Raw commands go the other way, POSTed to the peer server's
//! `/api/v1/raw` as `{"command": ..., "fields": ...}` with the usual
//! `{"rc": N, "fields": ...}` envelope coming back.
//!
//! The inbound listener is bound once, on the first `connect`; each
//! session swaps in a fresh event channel.

use crate::manager::link::{
    LinkError, LinkEvent, LinkSession, ManagerLink, Requester, unwrap_response,
};
use async_trait::async_trait;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::{MethodRouter, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use serde_json::Value;
use sol_core::Notification;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Session event sender, swapped on every reconnect.
type SharedTx = Arc<Mutex<Option<mpsc::Sender<LinkEvent>>>>;

// ---------------------------------------------------------------------------
// JsonServerLink
// ---------------------------------------------------------------------------

/// The HTTP variant of the Manager link.
pub struct JsonServerLink {
    bind_port: u16,
    peer: String,
    tls: Option<(PathBuf, PathBuf)>,
    client: reqwest::Client,
    current_tx: SharedTx,
    local_addr: Option<SocketAddr>,
}

impl JsonServerLink {
    /// `peer` is the host(:port) of the JSON server accepting raw
    /// commands; `bind_port` is the local notification listener port
    /// (0 picks an ephemeral port, for tests).
    pub fn new(peer: impl Into<String>, bind_port: u16) -> JsonServerLink {
        JsonServerLink {
            bind_port,
            peer: peer.into(),
            tls: None,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            current_tx: Arc::new(Mutex::new(None)),
            local_addr: None,
        }
    }

    /// Terminate TLS on the notification listener with the given
    /// certificate/key pair.
    pub fn with_tls(mut self, cert: PathBuf, key: PathBuf) -> JsonServerLink {
        self.tls = Some((cert, key));
        self
    }

    /// The bound notification listener address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn ensure_listener(&mut self) -> Result<(), LinkError> {
        if self.local_addr.is_some() {
            return Ok(());
        }
        let router = notification_router(self.current_tx.clone());
        let addr = match &self.tls {
            Some((cert, key)) => {
                let config = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| LinkError::Io(format!("loading listener TLS: {}", e)))?;
                let handle = axum_server::Handle::new();
                let bind = SocketAddr::from(([0, 0, 0, 0], self.bind_port));
                let server = axum_server::bind_rustls(bind, config).handle(handle.clone());
                tokio::spawn(async move {
                    let _ = server.serve(router.into_make_service()).await;
                });
                handle.listening().await.ok_or_else(|| {
                    LinkError::Io("notification listener failed to bind".to_owned())
                })?
            }
            None => {
                let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.bind_port))
                    .await
                    .map_err(|e| LinkError::Io(format!("binding notification listener: {}", e)))?;
                let addr = listener
                    .local_addr()
                    .map_err(|e| LinkError::Io(e.to_string()))?;
                tokio::spawn(async move {
                    let _ = axum::serve(listener, router).await;
                });
                addr
            }
        };
        info!(addr = %addr, "notification listener up");
        self.local_addr = Some(addr);
        Ok(())
    }
}

#[async_trait]
impl ManagerLink for JsonServerLink {
    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        self.ensure_listener().await?;

        let (tx, rx) = mpsc::channel::<LinkEvent>(256);
        *self
            .current_tx
            .lock()
            .expect("event sender mutex poisoned") = Some(tx);

        Ok(LinkSession {
            requests: Arc::new(HttpRequester {
                client: self.client.clone(),
                url: format!("http://{}/api/v1/raw", self.peer),
            }),
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Inbound notification routes
// ---------------------------------------------------------------------------

fn notification_router(tx: SharedTx) -> Router {
    Router::new()
        .route("/hr", notif_route("hr"))
        .route("/notifData", notif_route("notifData"))
        .route("/oap", notif_route("oap"))
        .route("/notifLog", notif_route("notifLog"))
        .route("/notifIpData", notif_route("notifIpData"))
        .route("/event", notif_route("event"))
        .with_state(tx)
}

fn notif_route(name: &'static str) -> MethodRouter<SharedTx> {
    post(move |State(tx): State<SharedTx>, Json(fields): Json<Value>| async move {
        deliver(&tx, name, fields).await
    })
}

async fn deliver(tx: &SharedTx, name: &'static str, fields: Value) -> StatusCode {
    let sender = tx
        .lock()
        .expect("event sender mutex poisoned")
        .clone();
    match sender {
        Some(sender) => {
            if sender
                .send(LinkEvent::Notification(Notification::new(name, fields)))
                .await
                .is_ok()
            {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
        None => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// ---------------------------------------------------------------------------
// Outbound raw commands
// ---------------------------------------------------------------------------

struct HttpRequester {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Requester for HttpRequester {
    async fn request(&self, command: &str, fields: Value) -> Result<Value, LinkError> {
        let body = serde_json::json!({"command": command, "fields": fields});
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LinkError::Io(format!("POST {}: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(LinkError::Protocol(format!(
                "peer returned {} for '{}'",
                response.status(),
                command
            )));
        }
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| LinkError::Protocol(format!("decoding response: {}", e)))?;
        unwrap_response(command, &envelope)
    }
}
