//! Manager link contract.
//!
//! A link is one logical session to the Manager: a request/response
//! channel for API commands plus an asynchronous event stream carrying
//! notifications and the close signal.  Two variants implement it —
//! [`crate::manager::serial::SerialLink`] and
//! [`crate::manager::jsonserver::JsonServerLink`] — and the scripted
//! test link in `testkit`.
//!
//! # Response-code discipline
//! Every Manager command response carries an integer `rc`; `rc == 0` is
//! success and yields the response fields.  A non-zero `rc` surfaces as
//! [`LinkError::Rc`] so iterative queries can distinguish end-of-list
//! from transport failure.

use async_trait::async_trait;
use serde_json::Value;
use sol_core::Notification;
use std::sync::Arc;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One event delivered by a link session.
#[derive(Debug)]
pub enum LinkEvent {
    /// A Manager notification.
    Notification(Notification),
    /// The session ended (error or Manager-side finish); the payload is
    /// a human-readable reason.  No further events follow.
    Closed(String),
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Issues Manager API commands over the current session.
#[async_trait]
pub trait Requester: Send + Sync {
    /// Issue `command` with `fields`, returning the response fields on
    /// `rc == 0`.
    async fn request(&self, command: &str, fields: Value) -> Result<Value, LinkError>;
}

/// Shared, clonable handle to a session's requester.
pub type RequestHandle = Arc<dyn Requester>;

/// Interpret a Manager response envelope `{"rc": N, "fields": {...}}`.
pub fn unwrap_response(command: &str, envelope: &Value) -> Result<Value, LinkError> {
    let rc = envelope
        .get("rc")
        .and_then(Value::as_i64)
        .ok_or_else(|| LinkError::Protocol(format!("response to '{}' missing rc", command)))?;
    if rc != 0 {
        return Err(LinkError::Rc {
            command: command.to_owned(),
            rc,
        });
    }
    Ok(envelope.get("fields").cloned().unwrap_or(Value::Null))
}

// ---------------------------------------------------------------------------
// Session + link
// ---------------------------------------------------------------------------

/// An open session to the Manager.
pub struct LinkSession {
    pub requests: RequestHandle,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// A way of reaching the Manager.  `connect` is called by the connector
/// on every (re)connection attempt.
#[async_trait]
pub trait ManagerLink: Send {
    async fn connect(&mut self) -> Result<LinkSession, LinkError>;
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link I/O: {0}")]
    Io(String),
    #[error("link closed")]
    Closed,
    #[error("manager returned rc {rc} for '{command}'")]
    Rc { command: String, rc: i64 },
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("request timed out")]
    Timeout,
}

impl LinkError {
    /// True for the non-zero response-code case (end of an iterative
    /// query, rejected command) as opposed to a transport failure.
    pub fn is_rc(&self) -> bool {
        matches!(self, LinkError::Rc { .. })
    }
}
