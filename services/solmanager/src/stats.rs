//! Process-wide statistics registry.
//!
//! A mutex-guarded counter map, persisted to the stats file on every
//! mutation so counters survive restarts.  Counters are monotonic for
//! the process lifetime; gauges (backlog lengths, last-event
//! timestamps) may move both ways.
//!
//! The initial read tolerates a missing or corrupt file by starting
//! empty; a failed persist is logged but never fails the mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

// ---------------------------------------------------------------------------
// Stat names
// ---------------------------------------------------------------------------

/// The closed set of statistic names.
pub mod names {
    pub const ADM_NUM_CRASHES: &str = "ADM_NUM_CRASHES";
    pub const ADM_LAST_CRASH_TS: &str = "ADM_LAST_CRASH_TS";

    pub const MGR_NUM_CONNECT_ATTEMPTS: &str = "MGR_NUM_CONNECT_ATTEMPTS";
    pub const MGR_NUM_CONNECT_OK: &str = "MGR_NUM_CONNECT_OK";
    pub const MGR_NUM_DISCONNECTS: &str = "MGR_NUM_DISCONNECTS";
    pub const MGR_NUM_TIMESYNC: &str = "MGR_NUM_TIMESYNC";
    pub const MGR_LAST_CONNECT_TS: &str = "MGR_LAST_CONNECT_TS";

    pub const PUB_TOTAL_SENTTOPUBLISH: &str = "PUB_TOTAL_SENTTOPUBLISH";

    pub const PUBFILE_WRITES: &str = "PUBFILE_WRITES";
    pub const PUBFILE_WRITE_FAILS: &str = "PUBFILE_WRITE_FAILS";
    pub const PUBFILE_BACKLOG: &str = "PUBFILE_BACKLOG";
    pub const PUBFILE_DROPS: &str = "PUBFILE_DROPS";

    pub const PUBSERVER_SENDATTEMPTS: &str = "PUBSERVER_SENDATTEMPTS";
    pub const PUBSERVER_SENDOK: &str = "PUBSERVER_SENDOK";
    pub const PUBSERVER_SENDFAIL: &str = "PUBSERVER_SENDFAIL";
    pub const PUBSERVER_UNREACHABLE: &str = "PUBSERVER_UNREACHABLE";
    pub const PUBSERVER_BACKLOG: &str = "PUBSERVER_BACKLOG";
    pub const PUBSERVER_DROPS: &str = "PUBSERVER_DROPS";

    pub const SNAPSHOT_NUM_STARTED: &str = "SNAPSHOT_NUM_STARTED";
    pub const SNAPSHOT_NUM_OK: &str = "SNAPSHOT_NUM_OK";
    pub const SNAPSHOT_NUM_FAIL: &str = "SNAPSHOT_NUM_FAIL";
    pub const SNAPSHOT_LAST_OK_TS: &str = "SNAPSHOT_LAST_OK_TS";

    pub const JSON_NUM_REQ: &str = "JSON_NUM_REQ";
    pub const JSON_NUM_UNAUTHORIZED: &str = "JSON_NUM_UNAUTHORIZED";
}

/// Per-notification-kind receive counter name, e.g. `NUMRX_NOTIFDATA`.
pub fn numrx(notif_name: &str) -> String {
    format!("NUMRX_{}", notif_name.to_uppercase())
}

// ---------------------------------------------------------------------------
// StatsRegistry
// ---------------------------------------------------------------------------

/// The process-wide statistics registry.
pub struct StatsRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    counters: BTreeMap<String, u64>,
    path: Option<PathBuf>,
}

impl StatsRegistry {
    /// Open the registry backed by `path`, loading any persisted
    /// counters.  A missing or unreadable file starts the registry
    /// empty.
    pub fn open(path: PathBuf) -> StatsRegistry {
        let counters = match std::fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str::<BTreeMap<String, u64>>(&body) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "stats file corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        StatsRegistry {
            inner: Mutex::new(Inner {
                counters,
                path: Some(path),
            }),
        }
    }

    /// An unpersisted registry, for tests.
    pub fn in_memory() -> StatsRegistry {
        StatsRegistry {
            inner: Mutex::new(Inner {
                counters: BTreeMap::new(),
                path: None,
            }),
        }
    }

    /// Increment a monotonic counter by one; returns the new value.
    pub fn incr(&self, name: &str) -> u64 {
        self.add(name, 1)
    }

    /// Increment a monotonic counter by `n`; returns the new value.
    pub fn add(&self, name: &str, n: u64) -> u64 {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        let entry = inner.counters.entry(name.to_owned()).or_insert(0);
        *entry = entry.saturating_add(n);
        let value = *entry;
        persist(&inner);
        value
    }

    /// Set a gauge (backlog length, last-event timestamp).  Gauges are
    /// the only entries allowed to decrease.
    pub fn set_gauge(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.counters.insert(name.to_owned(), value);
        persist(&inner);
    }

    /// Current value of a stat (0 when never touched).
    pub fn get(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("stats mutex poisoned");
        inner.counters.get(name).copied().unwrap_or(0)
    }

    /// Snapshot of the full map, for the status endpoint.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.inner
            .lock()
            .expect("stats mutex poisoned")
            .counters
            .clone()
    }
}

/// Rewrite the stats file with the current map.  Persist failures are
/// logged and swallowed.
fn persist(inner: &Inner) {
    let Some(path) = &inner.path else { return };
    match serde_json::to_vec_pretty(&inner.counters) {
        Ok(body) => {
            if let Err(e) = std::fs::write(path, body) {
                warn!(path = %path.display(), error = %e, "failed to persist stats");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize stats"),
    }
}
