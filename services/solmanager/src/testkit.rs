//! Scripted Manager link for tests.
//!
//! `ScriptedLink` implements [`ManagerLink`] against an in-memory script
//! instead of a device: tests enqueue command responses, inject
//! notifications, and force closes/connect failures through the paired
//! [`LinkScript`] handle.

use crate::manager::link::{
    LinkError, LinkEvent, LinkSession, ManagerLink, Requester, unwrap_response,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use sol_core::{Mac, Notification};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// ScriptedLink / LinkScript
// ---------------------------------------------------------------------------

pub struct ScriptedLink {
    ctrl: Arc<ScriptCtrl>,
}

/// Test-side handle controlling a [`ScriptedLink`].
#[derive(Clone)]
pub struct LinkScript {
    ctrl: Arc<ScriptCtrl>,
}

#[derive(Default)]
struct ScriptCtrl {
    /// Per-command queues of full response envelopes; popped first.
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    /// Per-command fallback envelope when the queue is empty.
    defaults: Mutex<HashMap<String, Value>>,
    /// Every issued command, in order.
    calls: Mutex<Vec<(String, Value)>>,
    connect_failures: AtomicU32,
    connects: AtomicU32,
    current: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl ScriptedLink {
    pub fn new() -> (ScriptedLink, LinkScript) {
        let ctrl = Arc::new(ScriptCtrl::default());
        (
            ScriptedLink { ctrl: ctrl.clone() },
            LinkScript { ctrl },
        )
    }
}

impl LinkScript {
    /// Queue a full response envelope for one invocation of `command`.
    pub fn enqueue(&self, command: &str, envelope: Value) {
        self.ctrl
            .queues
            .lock()
            .unwrap()
            .entry(command.to_owned())
            .or_default()
            .push_back(envelope);
    }

    /// Queue a successful response with the given fields.
    pub fn enqueue_ok(&self, command: &str, fields: Value) {
        self.enqueue(command, json!({"rc": 0, "fields": fields}));
    }

    /// Queue a non-zero response code.
    pub fn enqueue_rc(&self, command: &str, rc: i64) {
        self.enqueue(command, json!({"rc": rc, "fields": {}}));
    }

    /// Set the fallback response used when `command`'s queue is empty.
    pub fn default_ok(&self, command: &str, fields: Value) {
        self.ctrl
            .defaults
            .lock()
            .unwrap()
            .insert(command.to_owned(), json!({"rc": 0, "fields": fields}));
    }

    /// Script the minimum a connector needs to establish a session:
    /// system info, time, subscribe, and an access-point mote at `mac`.
    pub fn script_minimal_manager(&self, mac: Mac) {
        self.default_ok("getSystemInfo", json!({"macAddress": mac.to_string()}));
        self.default_ok("getTime", json!({"utcSecs": 1_000_000, "utcUsecs": 0}));
        self.default_ok("subscribe", json!({}));
        self.default_ok(
            "getMoteConfig",
            json!({"macAddress": mac.to_string(), "moteId": 1, "isAP": true,
                   "state": 4, "isRouting": true}),
        );
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.ctrl.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.ctrl.connects.load(Ordering::SeqCst)
    }

    /// Inject a notification into the current session; returns whether
    /// a session was there to take it.
    pub async fn notify(&self, notif: Notification) -> bool {
        let tx = self.ctrl.current.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(LinkEvent::Notification(notif)).await.is_ok(),
            None => false,
        }
    }

    /// Close the current session with `reason` (the Manager-side
    /// error/finish signal).
    pub async fn close(&self, reason: &str) {
        let tx = self.ctrl.current.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(LinkEvent::Closed(reason.to_owned())).await;
        }
    }

    /// Every command issued so far, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.ctrl.calls.lock().unwrap().clone()
    }

    /// Commands issued so far, names only.
    pub fn called_commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(c, _)| c).collect()
    }
}

#[async_trait]
impl ManagerLink for ScriptedLink {
    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        let failures = self.ctrl.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.ctrl
                .connect_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(LinkError::Io("scripted connect failure".to_owned()));
        }
        self.ctrl.connects.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        *self.ctrl.current.lock().unwrap() = Some(tx);
        Ok(LinkSession {
            requests: Arc::new(ScriptedRequester {
                ctrl: self.ctrl.clone(),
            }),
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

struct ScriptedRequester {
    ctrl: Arc<ScriptCtrl>,
}

#[async_trait]
impl Requester for ScriptedRequester {
    async fn request(&self, command: &str, fields: Value) -> Result<Value, LinkError> {
        self.ctrl
            .calls
            .lock()
            .unwrap()
            .push((command.to_owned(), fields));

        let queued = self
            .ctrl
            .queues
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(VecDeque::pop_front);
        let envelope = match queued {
            Some(envelope) => envelope,
            None => self
                .ctrl
                .defaults
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or_else(|| json!({"rc": 0, "fields": {}})),
        };
        unwrap_response(command, &envelope)
    }
}
