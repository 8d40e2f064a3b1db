//! Ingest dispatcher: Manager notifications in, SOL objects out.
//!
//! For every notification, in order: filter the raw SDK-internal
//! health-report form, count the receive, stamp the epoch (projected
//! network time when the record is clocked, wall time otherwise),
//! transform through the codec, and fan the resulting objects out to
//! both publishers.
//!
//! Transport quirks are not the dispatcher's problem: every
//! notification is treated as possibly duplicated and possibly
//! reordered.  A failing step logs a crash event and counts it; the
//! loop itself never dies.

use crate::clock::now_epoch;
use crate::manager::ManagerHandle;
use crate::publishers::{FilePublisher, ServerPublisher, submit};
use crate::stats::{StatsRegistry, names, numrx};
use sol_core::{Mac, Notification, notif};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Raw, unstructured health-report form reserved for SDK-internal use;
/// dropped on sight.
const RAW_HR_NAME: &str = "notifHealthReport";

pub struct Dispatcher {
    rx: mpsc::Receiver<Notification>,
    handle: Arc<ManagerHandle>,
    stats: Arc<StatsRegistry>,
    file: Arc<FilePublisher>,
    server: Arc<ServerPublisher>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<Notification>,
        handle: Arc<ManagerHandle>,
        stats: Arc<StatsRegistry>,
        file: Arc<FilePublisher>,
        server: Arc<ServerPublisher>,
        shutdown: watch::Receiver<bool>,
    ) -> Dispatcher {
        Dispatcher {
            rx,
            handle,
            stats,
            file,
            server,
            shutdown,
        }
    }

    /// Consume notifications until the channel closes or shutdown.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                }
                notif = self.rx.recv() => match notif {
                    None => return,
                    Some(notif) => self.dispatch_one(&notif),
                }
            }
        }
    }

    fn dispatch_one(&self, notif: &Notification) {
        if notif.name == RAW_HR_NAME {
            debug!("dropping raw health-report form");
            return;
        }
        self.stats.incr(&numrx(&notif.name));

        let epoch = notif
            .net_time()
            .and_then(|net| self.handle.time_map().project_and_refresh(net))
            .unwrap_or_else(now_epoch);
        let manager_mac = self.handle.manager_mac().unwrap_or(Mac::ZERO);

        match notif::to_sol_objects(notif, epoch, manager_mac) {
            Ok(objects) => {
                for obj in objects {
                    submit(&self.stats, &self.file, &self.server, obj);
                }
            }
            Err(e) => {
                error!(
                    notification = %notif.name,
                    error = %e,
                    "notification transform crashed"
                );
                self.stats.incr(names::ADM_NUM_CRASHES);
                self.stats
                    .set_gauge(names::ADM_LAST_CRASH_TS, now_epoch() as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sol_core::SolType;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Rig {
        tx: mpsc::Sender<Notification>,
        handle: Arc<ManagerHandle>,
        stats: Arc<StatsRegistry>,
        file: Arc<FilePublisher>,
        server: Arc<ServerPublisher>,
        _shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
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
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            rx,
            handle.clone(),
            stats.clone(),
            file.clone(),
            server.clone(),
            shutdown_rx,
        );
        tokio::spawn(dispatcher.run());
        Rig {
            tx,
            handle,
            stats,
            file,
            server,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    async fn settle(rig: &Rig, want_backlog: usize) {
        for _ in 0..100 {
            if rig.server.backlog() >= want_backlog {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_both_publishers_and_counts() {
        let rig = rig();
        rig.tx
            .send(Notification::new(
                "notifData",
                json!({"macAddress": "00-00-00-00-00-00-00-03", "payload": "aa"}),
            ))
            .await
            .unwrap();
        settle(&rig, 1).await;

        assert_eq!(rig.file.backlog(), 1);
        assert_eq!(rig.server.backlog(), 1);
        assert_eq!(rig.stats.get(names::PUB_TOTAL_SENTTOPUBLISH), 1);
        assert_eq!(rig.stats.get("NUMRX_NOTIFDATA"), 1);
    }

    #[tokio::test]
    async fn raw_health_report_form_is_filtered() {
        let rig = rig();
        rig.tx
            .send(Notification::new("notifHealthReport", json!({"raw": "aa"})))
            .await
            .unwrap();
        rig.tx
            .send(Notification::new("event", json!({"eventType": "x"})))
            .await
            .unwrap();
        settle(&rig, 1).await;

        assert_eq!(rig.stats.get("NUMRX_NOTIFHEALTHREPORT"), 0);
        assert_eq!(rig.server.backlog(), 1, "only the event got through");
    }

    #[tokio::test]
    async fn clocked_notifications_use_the_projected_epoch() {
        let rig = rig();
        // Pretend the Manager clock is 500 s behind the wall clock.
        let now_us = crate::clock::now_micros();
        rig.handle.time_map().set_offset_us(500 * 1_000_000);
        let net_secs = (now_us / 1_000_000) - 500;

        rig.tx
            .send(Notification::new(
                "notifLog",
                json!({"macAddress": "00-00-00-00-00-00-00-04",
                       "utcSecs": net_secs, "utcUsecs": 0, "logMsg": "x"}),
            ))
            .await
            .unwrap();
        settle(&rig, 1).await;

        rig.file.drain_all();
        let written = sol_core::backup::scan_range(
            &rig._dir.path().join("backup.sol"),
            0,
            i64::MAX,
        )
        .unwrap();
        assert_eq!(written.len(), 1);
        // net + offset lands back on (roughly) the wall clock.
        assert!((written[0].timestamp - now_us / 1_000_000).abs() <= 1);
        assert_eq!(written[0].sol_type, SolType::Log);
    }

    #[tokio::test]
    async fn hr_fan_out_counts_each_object() {
        let rig = rig();
        rig.tx
            .send(Notification::new(
                "hr",
                json!({
                    "macAddress": "00-00-00-00-00-00-00-05",
                    "Device": {"charge": 1},
                    "Neighbors": {"neighbors": []},
                    "Discovered": {"discoveredNeighbors": []}
                }),
            ))
            .await
            .unwrap();
        settle(&rig, 3).await;

        assert_eq!(rig.stats.get(names::PUB_TOTAL_SENTTOPUBLISH), 3);
        assert_eq!(rig.stats.get("NUMRX_HR"), 1);
    }

    #[tokio::test]
    async fn transform_failure_is_counted_not_fatal() {
        let rig = rig();
        rig.tx
            .send(Notification::new(
                "notifData",
                json!({"macAddress": 42, "payload": "aa"}),
            ))
            .await
            .unwrap();
        rig.tx
            .send(Notification::new("event", json!({"eventType": "x"})))
            .await
            .unwrap();
        settle(&rig, 1).await;

        assert_eq!(rig.stats.get(names::ADM_NUM_CRASHES), 1);
        assert_eq!(rig.server.backlog(), 1, "dispatcher survived the bad record");
    }
}
