//! End-to-end ingest: Manager notifications through the connector and
//! dispatcher into both publishers, and the file publisher's
//! chronological buffer window.

use serde_json::json;
use sol_core::{Mac, Notification, SolObject, SolType, backup};
use solmanager::clock::now_epoch;
use solmanager::dispatch::Dispatcher;
use solmanager::manager::{Connector, ManagerHandle};
use solmanager::publishers::{FilePublisher, ServerPublisher, submit};
use solmanager::stats::{StatsRegistry, names};
use solmanager::testkit::ScriptedLink;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};

fn mgr_mac() -> Mac {
    "00-17-0d-00-00-38-06-5b".parse().unwrap()
}

// ---------------------------------------------------------------------------
// Full ingest path
// ---------------------------------------------------------------------------

/// Notifications injected at the link come out as objects in both
/// publisher buffers, with the enqueue counted once per object.
#[tokio::test]
async fn notifications_reach_both_sinks() {
    let dir = tempdir().unwrap();
    let stats = Arc::new(StatsRegistry::in_memory());
    let handle = ManagerHandle::new();
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

    let (link, script) = ScriptedLink::new();
    script.script_minimal_manager(mgr_mac());
    let (notif_tx, notif_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(
        Connector::new(
            Box::new(link),
            handle.clone(),
            stats.clone(),
            notif_tx,
            shutdown_rx.clone(),
        )
        .run(),
    );
    tokio::spawn(
        Dispatcher::new(
            notif_rx,
            handle.clone(),
            stats.clone(),
            file.clone(),
            server.clone(),
            shutdown_rx,
        )
        .run(),
    );

    // Wait for the session, then inject.
    for _ in 0..200 {
        if handle.manager_mac().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.manager_mac(), Some(mgr_mac()));

    script
        .notify(Notification::new(
            "notifData",
            json!({"macAddress": "00-00-00-00-00-00-00-02", "payload": "0501"}),
        ))
        .await;
    script
        .notify(Notification::new("event", json!({"eventType": "pathCreate"})))
        .await;

    for _ in 0..200 {
        if server.backlog() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(file.backlog(), 2);
    assert_eq!(server.backlog(), 2);
    assert_eq!(stats.get(names::PUB_TOTAL_SENTTOPUBLISH), 2);
    assert_eq!(stats.get("NUMRX_NOTIFDATA"), 1);
    assert_eq!(stats.get("NUMRX_EVENT"), 1);

    let _ = shutdown_tx.send(true);
}

// ---------------------------------------------------------------------------
// File buffer window
// ---------------------------------------------------------------------------

fn obj(ts: i64) -> SolObject {
    SolObject::new(mgr_mac(), ts, SolType::RawData, json!({"ts": ts})).unwrap()
}

/// Objects stamped T, T+1, T+40 arrive in that order; a drain at T+31
/// writes exactly the first two, ascending, and keeps the third.
#[tokio::test]
async fn drain_at_t_plus_31_writes_the_first_two() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("backup.sol");
    let stats = Arc::new(StatsRegistry::in_memory());
    let file = FilePublisher::new(path.clone(), stats.clone());
    let server = ServerPublisher::with_base_url(
        "http://127.0.0.1:1".to_owned(),
        "tok",
        Duration::from_secs(1),
        stats.clone(),
        1000,
    );

    let t = now_epoch() - 31;
    for ts in [t, t + 1, t + 40] {
        submit(&stats, &file, &server, obj(ts));
    }
    file.drain_once(t + 31);

    let written = backup::scan_range(&path, 0, i64::MAX).unwrap();
    let ts: Vec<i64> = written.iter().map(|o| o.timestamp).collect();
    assert_eq!(ts, vec![t, t + 1]);
    assert_eq!(file.backlog(), 1, "T+40 still inside the window");
    assert_eq!(stats.get(names::PUBFILE_WRITES), 1);
    assert_eq!(stats.get(names::PUBFILE_BACKLOG), 1);
    assert_eq!(stats.get(names::PUB_TOTAL_SENTTOPUBLISH), 3);
}
