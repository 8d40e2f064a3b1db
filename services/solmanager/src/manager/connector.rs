//! Manager connection supervisor.
//!
//! Owns the one logical session to the Manager: connects, synchronizes
//! time, resolves the Manager MAC (the access-point mote), subscribes,
//! and pumps notifications to the dispatcher.  Any link failure tears
//! the session down and retries after a short delay, forever, until
//! shutdown.
//!
//! # State machine
//! Disconnected → Connecting → Connected → Draining → Disconnected.
//! Connected is entered after system info + subscribe succeed; any
//! error/finish signal returns to Disconnected; shutdown drains.

use crate::clock::{now_epoch, now_micros};
use crate::manager::link::{LinkError, LinkEvent, LinkSession, ManagerLink, RequestHandle};
use crate::periodic::sleep_or_shutdown;
use crate::stats::{StatsRegistry, names};
use serde_json::{Value, json};
use sol_core::{Mac, NetTime, Notification};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Delay between reconnect attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// TimeMap
// ---------------------------------------------------------------------------

/// Projection of the Manager's network time into epoch time.
///
/// Holds the single signed offset `wall − net` in integer microseconds,
/// sampled at connect and refreshed on every notification carrying a
/// network-time pair.  Cleared on disconnect, so the offset may jump
/// between sessions.
#[derive(Default)]
pub struct TimeMap {
    diff_us: Mutex<Option<i64>>,
}

impl TimeMap {
    /// Re-sample the offset from a fresh network-time reading.
    pub fn refresh(&self, net: NetTime) {
        let diff = now_micros() - net.as_micros();
        *self.diff_us.lock().expect("time map mutex poisoned") = Some(diff);
    }

    pub fn clear(&self) {
        *self.diff_us.lock().expect("time map mutex poisoned") = None;
    }

    /// Project a network-time pair to epoch seconds (rounded), when an
    /// offset has been sampled.
    pub fn project(&self, net: NetTime) -> Option<i64> {
        let diff = (*self.diff_us.lock().expect("time map mutex poisoned"))?;
        let epoch_us = net.as_micros() + diff;
        Some((epoch_us + 500_000).div_euclid(1_000_000))
    }

    /// Project with the current offset, then re-sample the offset from
    /// this reading.  Projection first: the notification's epoch must
    /// reflect the offset in force when its network time was stamped,
    /// not the one it is about to establish.
    pub fn project_and_refresh(&self, net: NetTime) -> Option<i64> {
        let mut diff_us = self.diff_us.lock().expect("time map mutex poisoned");
        let diff = (*diff_us)?;
        let epoch = (net.as_micros() + diff + 500_000).div_euclid(1_000_000);
        *diff_us = Some(now_micros() - net.as_micros());
        Some(epoch)
    }

    /// The current offset in microseconds, for tests and status.
    pub fn offset_us(&self) -> Option<i64> {
        *self.diff_us.lock().expect("time map mutex poisoned")
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn set_offset_us(&self, diff: i64) {
        *self.diff_us.lock().expect("time map mutex poisoned") = Some(diff);
    }
}

// ---------------------------------------------------------------------------
// ManagerHandle
// ---------------------------------------------------------------------------

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

/// Shared view of the Manager session, used by the dispatcher, the
/// snapshot collector, the stats publisher and the control API.
pub struct ManagerHandle {
    mac: Mutex<Option<Mac>>,
    requests: Mutex<Option<RequestHandle>>,
    time_map: TimeMap,
    state: Mutex<ConnState>,
}

impl Default for ManagerHandle {
    fn default() -> Self {
        ManagerHandle {
            mac: Mutex::new(None),
            requests: Mutex::new(None),
            time_map: TimeMap::default(),
            state: Mutex::new(ConnState::Disconnected),
        }
    }
}

impl ManagerHandle {
    pub fn new() -> Arc<ManagerHandle> {
        Arc::new(ManagerHandle::default())
    }

    /// The Manager MAC, once resolved for the current session.
    pub fn manager_mac(&self) -> Option<Mac> {
        *self.mac.lock().expect("manager mac mutex poisoned")
    }

    pub fn time_map(&self) -> &TimeMap {
        &self.time_map
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// Issue a raw Manager command over the current session.
    ///
    /// Fails with [`LinkError::Closed`] when no session is up; command
    /// failures are surfaced to the caller and never tear the session
    /// down.
    pub async fn issue_raw(&self, command: &str, fields: Value) -> Result<Value, LinkError> {
        let requests = self
            .requests
            .lock()
            .expect("requests mutex poisoned")
            .clone();
        match requests {
            Some(requests) => requests.request(command, fields).await,
            None => Err(LinkError::Closed),
        }
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("state mutex poisoned") = state;
    }

    fn install_session(&self, mac: Mac, requests: RequestHandle) {
        *self.mac.lock().expect("manager mac mutex poisoned") = Some(mac);
        *self.requests.lock().expect("requests mutex poisoned") = Some(requests);
    }

    fn clear_session(&self) {
        *self.mac.lock().expect("manager mac mutex poisoned") = None;
        *self.requests.lock().expect("requests mutex poisoned") = None;
        self.time_map.clear();
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn install_for_test(&self, mac: Mac, requests: RequestHandle) {
        self.install_session(mac, requests);
        self.set_state(ConnState::Connected);
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// The connection supervisor task.
pub struct Connector {
    link: Box<dyn ManagerLink>,
    handle: Arc<ManagerHandle>,
    stats: Arc<StatsRegistry>,
    notif_tx: mpsc::Sender<Notification>,
    shutdown: watch::Receiver<bool>,
}

impl Connector {
    pub fn new(
        link: Box<dyn ManagerLink>,
        handle: Arc<ManagerHandle>,
        stats: Arc<StatsRegistry>,
        notif_tx: mpsc::Sender<Notification>,
        shutdown: watch::Receiver<bool>,
    ) -> Connector {
        Connector {
            link,
            handle,
            stats,
            notif_tx,
            shutdown,
        }
    }

    /// Run the reconnect-forever loop until shutdown.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.handle.set_state(ConnState::Connecting);
            self.stats.incr(names::MGR_NUM_CONNECT_ATTEMPTS);

            let session = match self.link.connect().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "manager connect failed");
                    self.note_disconnect();
                    if sleep_or_shutdown(&mut self.shutdown, RETRY_DELAY).await {
                        break;
                    }
                    continue;
                }
            };
            let LinkSession {
                requests,
                mut events,
            } = session;

            let mac = match establish(&requests, &self.handle, &self.stats).await {
                Ok(mac) => mac,
                Err(e) => {
                    warn!(error = %e, "manager session setup failed");
                    self.note_disconnect();
                    if sleep_or_shutdown(&mut self.shutdown, RETRY_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            self.handle.install_session(mac, requests);
            self.handle.set_state(ConnState::Connected);
            self.stats.incr(names::MGR_NUM_CONNECT_OK);
            self.stats
                .set_gauge(names::MGR_LAST_CONNECT_TS, now_epoch() as u64);
            info!(mac = %mac, "manager session established");

            let draining = self.pump_events(&mut events).await;
            self.handle.clear_session();
            self.note_disconnect();

            if draining {
                self.handle.set_state(ConnState::Draining);
                break;
            }
            if sleep_or_shutdown(&mut self.shutdown, RETRY_DELAY).await {
                break;
            }
        }
        self.handle.set_state(ConnState::Disconnected);
    }

    /// Forward events until the link closes or shutdown is requested.
    /// Returns true when leaving because of shutdown.
    async fn pump_events(&mut self, events: &mut mpsc::Receiver<LinkEvent>) -> bool {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return true;
                    }
                }
                ev = events.recv() => match ev {
                    None => return false,
                    Some(LinkEvent::Closed(reason)) => {
                        warn!(reason, "manager link closed");
                        return false;
                    }
                    Some(LinkEvent::Notification(notif)) => {
                        // Offset refreshes happen at projection time in
                        // the dispatcher; the connector only forwards.
                        if self.notif_tx.send(notif).await.is_err() {
                            return true;
                        }
                    }
                }
            }
        }
    }

    fn note_disconnect(&self) {
        self.stats.incr(names::MGR_NUM_DISCONNECTS);
        self.handle.set_state(ConnState::Disconnected);
    }
}

// ---------------------------------------------------------------------------
// Session establishment
// ---------------------------------------------------------------------------

/// System info, time sync, Manager MAC resolution, subscription.
async fn establish(
    requests: &RequestHandle,
    handle: &ManagerHandle,
    stats: &StatsRegistry,
) -> Result<Mac, LinkError> {
    requests.request("getSystemInfo", json!({})).await?;

    let time = requests.request("getTime", json!({})).await?;
    let secs = time
        .get("utcSecs")
        .and_then(Value::as_i64)
        .ok_or_else(|| LinkError::Protocol("getTime response missing utcSecs".to_owned()))?;
    let usecs = time.get("utcUsecs").and_then(Value::as_i64).unwrap_or(0);
    handle.time_map().refresh(NetTime { secs, usecs });
    stats.incr(names::MGR_NUM_TIMESYNC);

    let mac = resolve_manager_mac(requests).await?;

    requests
        .request(
            "subscribe",
            json!({"notifTypes": ["data", "event", "hr", "ipData", "log"]}),
        )
        .await?;

    Ok(mac)
}

/// Walk the mote table from MAC zero until the access-point mote shows
/// up; its MAC is the Manager MAC.
async fn resolve_manager_mac(requests: &RequestHandle) -> Result<Mac, LinkError> {
    let mut current = Mac::ZERO;
    loop {
        let fields = match requests
            .request(
                "getMoteConfig",
                json!({"macAddress": current.to_string(), "next": true}),
            )
            .await
        {
            Ok(fields) => fields,
            Err(e) if e.is_rc() => {
                return Err(LinkError::Protocol(
                    "mote table exhausted without an access point".to_owned(),
                ));
            }
            Err(e) => return Err(e),
        };

        let mac: Mac = fields
            .get("macAddress")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LinkError::Protocol("getMoteConfig response missing macAddress".to_owned())
            })?
            .parse()
            .map_err(|e| LinkError::Protocol(format!("bad macAddress: {}", e)))?;

        if fields.get("isAP").and_then(Value::as_bool) == Some(true) {
            return Ok(mac);
        }
        current = mac;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ScriptedLink;
    use serde_json::json;

    fn mgr_mac() -> Mac {
        "00-17-0d-00-00-38-06-5b".parse().unwrap()
    }

    fn start_connector(
        link: ScriptedLink,
        stats: Arc<StatsRegistry>,
    ) -> (
        Arc<ManagerHandle>,
        mpsc::Receiver<Notification>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let handle = ManagerHandle::new();
        let (notif_tx, notif_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connector = Connector::new(
            Box::new(link),
            handle.clone(),
            stats,
            notif_tx,
            shutdown_rx,
        );
        let task = tokio::spawn(connector.run());
        (handle, notif_rx, shutdown_tx, task)
    }

    async fn wait_for_mac(handle: &ManagerHandle) {
        for _ in 0..100 {
            if handle.manager_mac().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("manager MAC never resolved");
    }

    #[tokio::test]
    async fn connects_resolves_mac_and_subscribes() {
        let (link, script) = ScriptedLink::new();
        script.script_minimal_manager(mgr_mac());
        let stats = Arc::new(StatsRegistry::in_memory());

        let (handle, _notif_rx, shutdown_tx, task) = start_connector(link, stats.clone());
        wait_for_mac(&handle).await;

        assert_eq!(handle.manager_mac(), Some(mgr_mac()));
        assert_eq!(handle.state(), ConnState::Connected);
        assert_eq!(stats.get(names::MGR_NUM_CONNECT_OK), 1);
        assert!(handle.time_map().offset_us().is_some());
        let commands = script.called_commands();
        assert!(commands.contains(&"getSystemInfo".to_owned()));
        assert!(commands.contains(&"subscribe".to_owned()));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ap_search_walks_the_mote_table() {
        let (link, script) = ScriptedLink::new();
        script.script_minimal_manager(mgr_mac());
        // Two ordinary motes before the AP.
        script.enqueue_ok(
            "getMoteConfig",
            json!({"macAddress": "00-00-00-00-00-00-00-01", "isAP": false}),
        );
        script.enqueue_ok(
            "getMoteConfig",
            json!({"macAddress": "00-00-00-00-00-00-00-02", "isAP": false}),
        );
        let stats = Arc::new(StatsRegistry::in_memory());

        let (handle, _notif_rx, shutdown_tx, task) = start_connector(link, stats);
        wait_for_mac(&handle).await;
        assert_eq!(handle.manager_mac(), Some(mgr_mac()));

        // The iteration passed each mote's MAC back as the cursor.
        let calls = script.calls();
        let mote_cfg: Vec<&Value> = calls
            .iter()
            .filter(|(c, _)| c == "getMoteConfig")
            .map(|(_, f)| f)
            .collect();
        assert_eq!(mote_cfg[0]["macAddress"], "00-00-00-00-00-00-00-00");
        assert_eq!(mote_cfg[1]["macAddress"], "00-00-00-00-00-00-00-01");
        assert_eq!(mote_cfg[2]["macAddress"], "00-00-00-00-00-00-00-02");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn notifications_flow_to_the_dispatcher_channel() {
        let (link, script) = ScriptedLink::new();
        script.script_minimal_manager(mgr_mac());
        let stats = Arc::new(StatsRegistry::in_memory());

        let (handle, mut notif_rx, shutdown_tx, task) = start_connector(link, stats);
        wait_for_mac(&handle).await;

        assert!(
            script
                .notify(Notification::new("event", json!({"eventType": "moteJoin"})))
                .await
        );
        let notif = notif_rx.recv().await.unwrap();
        assert_eq!(notif.name, "event");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn close_triggers_reconnect_and_counts() {
        let (link, script) = ScriptedLink::new();
        script.script_minimal_manager(mgr_mac());
        let stats = Arc::new(StatsRegistry::in_memory());

        let (handle, _notif_rx, shutdown_tx, task) = start_connector(link, stats.clone());
        wait_for_mac(&handle).await;
        assert_eq!(script.connect_count(), 1);

        script.close("socket error").await;
        // Reconnect happens after the 1 s retry delay.
        for _ in 0..300 {
            if script.connect_count() >= 2 && handle.manager_mac().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(script.connect_count(), 2);
        assert!(stats.get(names::MGR_NUM_DISCONNECTS) >= 1);
        assert_eq!(stats.get(names::MGR_NUM_CONNECT_OK), 2);
        assert_eq!(handle.state(), ConnState::Connected);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn offset_is_sampled_at_connect() {
        let (link, script) = ScriptedLink::new();
        script.script_minimal_manager(mgr_mac());
        let stats = Arc::new(StatsRegistry::in_memory());

        let (handle, mut notif_rx, shutdown_tx, task) = start_connector(link, stats.clone());
        wait_for_mac(&handle).await;
        assert_eq!(stats.get(names::MGR_NUM_TIMESYNC), 1);

        // Forwarding a clocked notification does not itself move the
        // offset; projection owns the refresh.
        let before = handle.time_map().offset_us().unwrap();
        script
            .notify(Notification::new(
                "notifLog",
                json!({"utcSecs": 50, "utcUsecs": 0, "logMsg": "x"}),
            ))
            .await;
        let _ = notif_rx.recv().await.unwrap();
        assert_eq!(handle.time_map().offset_us().unwrap(), before);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn project_and_refresh_projects_with_the_old_offset() {
        let map = TimeMap::default();
        map.set_offset_us(1_000_000_000_000);
        let net = NetTime { secs: 10, usecs: 0 };
        let epoch = map.project_and_refresh(net).unwrap();
        assert_eq!(epoch, 1_000_010, "projection used the pre-refresh offset");
        // The offset now tracks the wall clock against net time.
        let new_diff = map.offset_us().unwrap();
        assert!((new_diff - (crate::clock::now_micros() - 10_000_000)).abs() < 1_000_000);
    }

    #[tokio::test]
    async fn issue_raw_without_session_is_closed() {
        let handle = ManagerHandle::new();
        let err = handle.issue_raw("getTime", json!({})).await.unwrap_err();
        assert!(matches!(err, LinkError::Closed));
    }

    #[test]
    fn projection_rounds_to_nearest_second() {
        let map = TimeMap::default();
        map.set_offset_us(1_000_000_000_000); // +1e6 s
        let epoch = map
            .project(NetTime {
                secs: 10,
                usecs: 600_000,
            })
            .unwrap();
        assert_eq!(epoch, 1_000_011); // 10.6 rounds up

        let epoch = map
            .project(NetTime {
                secs: 10,
                usecs: 400_000,
            })
            .unwrap();
        assert_eq!(epoch, 1_000_010);
    }
}
