//! Serial Manager link.
//!
//! Talks to the Manager's API mux over the configured serial device.
//! Frames on the wire are newline-delimited JSON:
//!
//! ```text
//! -> {"id": 7, "command": "getMoteConfig", "fields": {...}}
//! <- {"id": 7, "rc": 0, "fields": {...}}
//! <- {"notif": "notifData", "fields": {...}}
//! ```
//!
//! The serial port is blocking, so the session runs one reader and one
//! writer thread, bridged to the async side with channels.  Responses
//! are correlated to requests by `id` through a pending-request map; an
//! EOF or I/O error on the port emits a single `Closed` event and ends
//! the session.

use crate::manager::link::{
    LinkError, LinkEvent, LinkSession, ManagerLink, Requester, unwrap_response,
};
use async_trait::async_trait;
use serde_json::Value;
use sol_core::Notification;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Poll timeout for the blocking read loop; bounds how long the reader
/// thread lingers after the session is abandoned.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// How long a command may wait for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

// ---------------------------------------------------------------------------
// SerialLink
// ---------------------------------------------------------------------------

/// The serial variant of the Manager link.
pub struct SerialLink {
    path: String,
    baud: u32,
}

impl SerialLink {
    pub fn new(path: impl Into<String>) -> SerialLink {
        SerialLink {
            path: path.into(),
            baud: 115_200,
        }
    }
}

#[async_trait]
impl ManagerLink for SerialLink {
    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        let reader_port = serialport::new(&self.path, self.baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| LinkError::Io(format!("opening '{}': {}", self.path, e)))?;
        let writer_port = reader_port
            .try_clone()
            .map_err(|e| LinkError::Io(format!("cloning '{}': {}", self.path, e)))?;

        let (events_tx, events_rx) = mpsc::channel::<LinkEvent>(256);
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        spawn_writer_thread(writer_port, line_rx);
        spawn_reader_thread(reader_port, events_tx, pending.clone());

        Ok(LinkSession {
            requests: Arc::new(SerialRequester {
                line_tx,
                pending,
                next_id: AtomicU64::new(1),
            }),
            events: events_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

struct SerialRequester {
    line_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
}

#[async_trait]
impl Requester for SerialRequester {
    async fn request(&self, command: &str, fields: Value) -> Result<Value, LinkError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map mutex poisoned")
            .insert(id, tx);

        let frame = serde_json::json!({"id": id, "command": command, "fields": fields});
        if self.line_tx.send(frame.to_string()).is_err() {
            self.pending
                .lock()
                .expect("pending map mutex poisoned")
                .remove(&id);
            return Err(LinkError::Closed);
        }

        let envelope = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(_)) => return Err(LinkError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map mutex poisoned")
                    .remove(&id);
                return Err(LinkError::Timeout);
            }
        };
        unwrap_response(command, &envelope)
    }
}

// ---------------------------------------------------------------------------
// IO threads
// ---------------------------------------------------------------------------

fn spawn_writer_thread(
    mut port: Box<dyn serialport::SerialPort>,
    mut line_rx: mpsc::UnboundedReceiver<String>,
) {
    std::thread::spawn(move || {
        while let Some(line) = line_rx.blocking_recv() {
            if port.write_all(line.as_bytes()).is_err() || port.write_all(b"\n").is_err() {
                // The reader thread reports the failure; just stop writing.
                break;
            }
            let _ = port.flush();
        }
    });
}

fn spawn_reader_thread(
    port: Box<dyn serialport::SerialPort>,
    events_tx: mpsc::Sender<LinkEvent>,
    pending: PendingMap,
) {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(port);
        let mut line = String::new();
        loop {
            match reader.read_line(&mut line) {
                Ok(0) => {
                    let _ = events_tx.blocking_send(LinkEvent::Closed("EOF on port".to_owned()));
                    return;
                }
                Ok(_) => {
                    handle_frame(line.trim(), &events_tx, &pending);
                    line.clear();
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    // Poll window elapsed; a partial line stays in `line`
                    // and completes on the next pass.  If nobody listens
                    // for events anymore the session is gone.
                    if events_tx.is_closed() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events_tx.blocking_send(LinkEvent::Closed(e.to_string()));
                    return;
                }
            }
        }
    });
}

fn handle_frame(line: &str, events_tx: &mpsc::Sender<LinkEvent>, pending: &PendingMap) {
    if line.is_empty() {
        return;
    }
    match parse_frame(line) {
        Frame::Response { id, envelope } => {
            let sender = pending
                .lock()
                .expect("pending map mutex poisoned")
                .remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => warn!(id, "response with no pending request"),
            }
        }
        Frame::Notification(notif) => {
            let _ = events_tx.blocking_send(LinkEvent::Notification(notif));
        }
        Frame::Unknown => debug!(frame = line, "ignoring unknown frame"),
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Frame {
    Response { id: u64, envelope: Value },
    Notification(Notification),
    Unknown,
}

fn parse_frame(line: &str) -> Frame {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return Frame::Unknown;
    };
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        return Frame::Response {
            id,
            envelope: value,
        };
    }
    if let Some(name) = value.get("notif").and_then(Value::as_str) {
        let fields = value.get("fields").cloned().unwrap_or(Value::Null);
        return Frame::Notification(Notification::new(name, fields));
    }
    Frame::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_frames_carry_their_id() {
        let frame = parse_frame(r#"{"id": 3, "rc": 0, "fields": {"utcSecs": 12}}"#);
        match frame {
            Frame::Response { id, envelope } => {
                assert_eq!(id, 3);
                assert_eq!(envelope["fields"]["utcSecs"], 12);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn notification_frames_become_notifications() {
        let frame = parse_frame(r#"{"notif": "notifLog", "fields": {"logMsg": "hi"}}"#);
        match frame {
            Frame::Notification(n) => {
                assert_eq!(n.name, "notifLog");
                assert_eq!(n.fields["logMsg"], "hi");
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_unknown() {
        assert!(matches!(parse_frame("not json"), Frame::Unknown));
        assert!(matches!(parse_frame(r#"{"x": 1}"#), Frame::Unknown));
    }
}
