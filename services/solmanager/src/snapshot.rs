//! Topology snapshot collector.
//!
//! Builds one `Snapshot` SOL object from three iterative Manager
//! queries: mote enumeration (`getMoteConfig` walked with `next=true`),
//! per-mote details (`getMoteInfo`), and per-mote paths
//! (`getNextPathInfo` walked by path id).  A non-zero response code
//! ends each iteration; any transport failure discards the partial
//! snapshot.
//!
//! The last successful snapshot is cached so the control API can answer
//! immediately without waiting out a full period.

use crate::clock::now_epoch;
use crate::manager::{LinkError, ManagerHandle};
use crate::publishers::{FilePublisher, ServerPublisher, submit};
use crate::stats::{StatsRegistry, names};
use serde_json::{Map, Value, json};
use sol_core::{Mac, SolObject, SolType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Per-mote detail fields merged from `getMoteInfo`.
const MOTE_INFO_FIELDS: [&str; 8] = [
    "numNbrs",
    "numGoodNbrs",
    "requestedBw",
    "totalNeededBw",
    "assignedBw",
    "packetsReceived",
    "packetsLost",
    "avgLatency",
];

/// Per-path fields collected from `getNextPathInfo`.
const PATH_FIELDS: [&str; 6] = [
    "dest",
    "direction",
    "numLinks",
    "quality",
    "rssiSrcDest",
    "rssiDestSrc",
];

/// The singleton snapshot collector.
pub struct SnapshotCollector {
    handle: Arc<ManagerHandle>,
    stats: Arc<StatsRegistry>,
    file: Arc<FilePublisher>,
    server: Arc<ServerPublisher>,
    cache: Mutex<Option<SolObject>>,
    busy: AtomicBool,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("a snapshot is already being collected")]
    Busy,
    #[error("manager not connected")]
    NotConnected,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("malformed manager response: {0}")]
    Malformed(String),
}

impl SnapshotCollector {
    pub fn new(
        handle: Arc<ManagerHandle>,
        stats: Arc<StatsRegistry>,
        file: Arc<FilePublisher>,
        server: Arc<ServerPublisher>,
    ) -> SnapshotCollector {
        SnapshotCollector {
            handle,
            stats,
            file,
            server,
            cache: Mutex::new(None),
            busy: AtomicBool::new(false),
        }
    }

    /// The last successful snapshot, if any.
    pub fn cached(&self) -> Option<SolObject> {
        self.cache.lock().expect("snapshot cache mutex poisoned").clone()
    }

    /// Collect a snapshot, publish it to both sinks, and cache it.
    pub async fn collect_and_publish(&self) -> Result<SolObject, SnapshotError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(SnapshotError::Busy);
        }
        self.stats.incr(names::SNAPSHOT_NUM_STARTED);
        let result = self.collect_inner().await;
        self.busy.store(false, Ordering::SeqCst);

        match result {
            Ok(obj) => {
                self.stats.incr(names::SNAPSHOT_NUM_OK);
                self.stats
                    .set_gauge(names::SNAPSHOT_LAST_OK_TS, obj.timestamp as u64);
                *self.cache.lock().expect("snapshot cache mutex poisoned") = Some(obj.clone());
                submit(&self.stats, &self.file, &self.server, obj.clone());
                info!("topology snapshot published");
                Ok(obj)
            }
            Err(e) => {
                warn!(error = %e, "topology snapshot failed");
                self.stats.incr(names::SNAPSHOT_NUM_FAIL);
                Err(e)
            }
        }
    }

    async fn collect_inner(&self) -> Result<SolObject, SnapshotError> {
        let manager_mac = self
            .handle
            .manager_mac()
            .ok_or(SnapshotError::NotConnected)?;

        // 1. Mote enumeration.
        let mut motes: Vec<Map<String, Value>> = Vec::new();
        let mut current = Mac::ZERO;
        loop {
            let fields = match self
                .handle
                .issue_raw(
                    "getMoteConfig",
                    json!({"macAddress": current.to_string(), "next": true}),
                )
                .await
            {
                Ok(fields) => fields,
                Err(e) if e.is_rc() => break,
                Err(e) => return Err(e.into()),
            };

            let mac = mac_field(&fields)?;
            let mut mote = Map::new();
            mote.insert("macAddress".to_owned(), json!(mac.to_string()));
            for key in ["moteId", "state", "isAP", "isRouting"] {
                if let Some(v) = fields.get(key) {
                    mote.insert(key.to_owned(), v.clone());
                }
            }
            motes.push(mote);
            current = mac;
        }

        // 2. Mote details.
        for mote in &mut motes {
            let mac = mote["macAddress"].clone();
            let fields = self
                .handle
                .issue_raw("getMoteInfo", json!({"macAddress": mac}))
                .await?;
            for key in MOTE_INFO_FIELDS {
                if let Some(v) = fields.get(key) {
                    mote.insert(key.to_owned(), v.clone());
                }
            }
        }

        // 3. Paths per mote.
        for mote in &mut motes {
            let mac = mote["macAddress"].clone();
            let mut paths = Vec::new();
            let mut path_id: i64 = 0;
            loop {
                let fields = match self
                    .handle
                    .issue_raw(
                        "getNextPathInfo",
                        json!({"macAddress": mac, "filter": 0, "pathId": path_id}),
                    )
                    .await
                {
                    Ok(fields) => fields,
                    Err(e) if e.is_rc() => break,
                    Err(e) => return Err(e.into()),
                };

                let mut path = Map::new();
                for key in PATH_FIELDS {
                    if let Some(v) = fields.get(key) {
                        path.insert(key.to_owned(), v.clone());
                    }
                }
                paths.push(Value::Object(path));

                path_id = fields
                    .get("pathId")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        SnapshotError::Malformed("getNextPathInfo missing pathId".to_owned())
                    })?;
            }
            mote.insert("paths".to_owned(), Value::Array(paths));
        }

        let value = json!({ "mesh": motes });
        SolObject::new(manager_mac, now_epoch(), SolType::Snapshot, value)
            .map_err(|e| SnapshotError::Malformed(e.to_string()))
    }
}

fn mac_field(fields: &Value) -> Result<Mac, SnapshotError> {
    fields
        .get("macAddress")
        .and_then(Value::as_str)
        .ok_or_else(|| SnapshotError::Malformed("response missing macAddress".to_owned()))?
        .parse()
        .map_err(|e| SnapshotError::Malformed(format!("bad macAddress: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ScriptedLink;
    use crate::manager::ManagerLink;
    use std::time::Duration;
    use tempfile::tempdir;

    fn mgr_mac() -> Mac {
        "00-17-0d-00-00-38-06-5b".parse().unwrap()
    }

    async fn collector_with_script()
    -> (SnapshotCollector, crate::testkit::LinkScript, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let stats = Arc::new(StatsRegistry::in_memory());
        let file = Arc::new(FilePublisher::new(
            dir.path().join("backup.sol"),
            stats.clone(),
        ));
        let server = Arc::new(ServerPublisher::with_base_url(
            "http://127.0.0.1:1".to_owned(),
            "tok",
            Duration::from_secs(1),
            stats.clone(),
            1000,
        ));
        let (mut link, script) = ScriptedLink::new();
        let session = link.connect().await.unwrap();
        let handle = ManagerHandle::new();
        handle.install_for_test(mgr_mac(), session.requests);
        (
            SnapshotCollector::new(handle, stats, file, server),
            script,
            dir,
        )
    }

    /// Two motes (the AP and one leaf), one path on the leaf.
    fn script_small_mesh(script: &crate::testkit::LinkScript) {
        script.enqueue_ok(
            "getMoteConfig",
            json!({"macAddress": mgr_mac().to_string(), "moteId": 1, "isAP": true,
                   "state": 4, "isRouting": true}),
        );
        script.enqueue_ok(
            "getMoteConfig",
            json!({"macAddress": "00-00-00-00-00-00-00-02", "moteId": 2, "isAP": false,
                   "state": 4, "isRouting": true}),
        );
        script.enqueue_rc("getMoteConfig", 11); // end of mote table

        script.default_ok(
            "getMoteInfo",
            json!({"numNbrs": 2, "numGoodNbrs": 2, "requestedBw": 1000,
                   "totalNeededBw": 1200, "assignedBw": 1500,
                   "packetsReceived": 10, "packetsLost": 0, "avgLatency": 300}),
        );

        script.enqueue_ok(
            "getNextPathInfo",
            json!({"pathId": 1, "dest": "00-00-00-00-00-00-00-02", "direction": 2,
                   "numLinks": 4, "quality": 90, "rssiSrcDest": -45, "rssiDestSrc": -50}),
        );
        script.enqueue_rc("getNextPathInfo", 11); // AP has one path
        script.enqueue_rc("getNextPathInfo", 11); // leaf has none
    }

    #[tokio::test]
    async fn snapshot_walks_motes_details_and_paths() {
        let (collector, script, _dir) = collector_with_script().await;
        script_small_mesh(&script);

        let obj = collector.collect_and_publish().await.unwrap();
        assert_eq!(obj.sol_type, SolType::Snapshot);
        assert_eq!(obj.mac, mgr_mac());

        let mesh = obj.value["mesh"].as_array().unwrap();
        assert_eq!(mesh.len(), 2);
        assert_eq!(mesh[0]["isAP"], true);
        assert_eq!(mesh[0]["numNbrs"], 2);
        assert_eq!(mesh[0]["paths"][0]["quality"], 90);
        assert_eq!(mesh[1]["paths"].as_array().unwrap().len(), 0);

        assert_eq!(collector.stats.get(names::SNAPSHOT_NUM_OK), 1);
        assert_eq!(collector.stats.get(names::PUB_TOTAL_SENTTOPUBLISH), 1);
        assert_eq!(collector.file.backlog(), 1);
        assert_eq!(collector.server.backlog(), 1);
        assert_eq!(collector.cached().unwrap(), obj);
    }

    #[tokio::test]
    async fn two_snapshots_of_an_unchanged_mesh_match() {
        let (collector, script, _dir) = collector_with_script().await;
        script_small_mesh(&script);
        let first = collector.collect_and_publish().await.unwrap();

        script_small_mesh(&script);
        let second = collector.collect_and_publish().await.unwrap();

        assert_eq!(first.value, second.value, "values identical, timestamps aside");
    }

    #[tokio::test]
    async fn transport_failure_discards_the_partial_snapshot() {
        let (collector, script, _dir) = collector_with_script().await;
        script.enqueue_ok(
            "getMoteConfig",
            json!({"macAddress": mgr_mac().to_string(), "moteId": 1, "isAP": true}),
        );
        script.enqueue_rc("getMoteConfig", 11);
        // getMoteInfo left unscripted with a default of rc 0 {} is fine,
        // but a malformed path response kills the run.
        script.enqueue_ok("getNextPathInfo", json!({"dest": "x", "numLinks": 1}));

        let err = collector.collect_and_publish().await.unwrap_err();
        assert!(matches!(err, SnapshotError::Malformed(_)));
        assert_eq!(collector.stats.get(names::SNAPSHOT_NUM_FAIL), 1);
        assert!(collector.cached().is_none());
        assert_eq!(collector.file.backlog(), 0, "partial snapshot unused");
    }

    #[tokio::test]
    async fn disconnected_manager_fails_fast() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(StatsRegistry::in_memory());
        let file = Arc::new(FilePublisher::new(dir.path().join("b.sol"), stats.clone()));
        let server = Arc::new(ServerPublisher::with_base_url(
            "http://127.0.0.1:1".to_owned(),
            "tok",
            Duration::from_secs(1),
            stats.clone(),
            1000,
        ));
        let collector = SnapshotCollector::new(ManagerHandle::new(), stats, file, server);

        let err = collector.collect_and_publish().await.unwrap_err();
        assert!(matches!(err, SnapshotError::NotConnected));
        assert_eq!(collector.stats.get(names::SNAPSHOT_NUM_FAIL), 1);
    }
}
