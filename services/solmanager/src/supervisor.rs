//! Component lifecycle.
//!
//! Startup order: stats registry, Manager connector, wait until the
//! Manager MAC resolves, then the dispatcher, the periodic publishers
//! and the control API.  A liveness poll watches every task handle; any
//! dead component makes the process exit non-zero so the external
//! process manager restarts it.  Shutdown flips the watch channel,
//! gives the publishers one bounded final drain, and exits 0.

use crate::clock::now_epoch;
use crate::config::{Config, ConnectionMode};
use crate::control::{self, ControlState};
use crate::dispatch::Dispatcher;
use crate::manager::jsonserver::JsonServerLink;
use crate::manager::serial::SerialLink;
use crate::manager::{Connector, ManagerHandle, ManagerLink};
use crate::periodic::{sleep_or_shutdown, spawn_periodic};
use crate::publishers::{FilePublisher, ServerPublisher};
use crate::snapshot::SnapshotCollector;
use crate::stats::StatsRegistry;
use crate::stats_publisher::StatsPublisher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How often component liveness is checked.
const LIVENESS_PERIOD: Duration = Duration::from_secs(5);

/// Upper bound on the final drain at shutdown.
const FINAL_DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Run the gateway until shutdown or a dead component.
///
/// Returns the process exit code: 0 for a clean shutdown, 1 when a
/// component died and the process should be restarted.
pub async fn run(cfg: Config, mut shutdown: watch::Receiver<bool>) -> i32 {
    let stats = Arc::new(StatsRegistry::open(cfg.files.stats.clone()));
    let handle = ManagerHandle::new();

    // Manager connector first; everything downstream needs its MAC.
    let link: Box<dyn ManagerLink> = match cfg.manager.mode {
        ConnectionMode::Serial => Box::new(SerialLink::new(cfg.manager.serialport.clone())),
        ConnectionMode::JsonServer => {
            let mut link = JsonServerLink::new(
                cfg.manager.jsonserver_host.clone(),
                cfg.manager.jsonserver_port,
            );
            if let Some((cert, key)) = cfg.control.tls_pair() {
                link = link.with_tls(cert, key);
            }
            Box::new(link)
        }
    };
    let (notif_tx, notif_rx) = mpsc::channel(1024);
    let connector = Connector::new(
        link,
        handle.clone(),
        stats.clone(),
        notif_tx,
        shutdown.clone(),
    );

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    tasks.push(("connector", tokio::spawn(connector.run())));

    info!("waiting for manager MAC");
    while handle.manager_mac().is_none() {
        if tasks[0].1.is_finished() {
            error!("connector died before the manager MAC resolved");
            return 1;
        }
        if sleep_or_shutdown(&mut shutdown, Duration::from_millis(250)).await {
            info!("shutdown before manager came up");
            return 0;
        }
    }

    let file = Arc::new(FilePublisher::new(cfg.files.backup.clone(), stats.clone()));
    let server = Arc::new(ServerPublisher::new(
        &cfg.solserver.host,
        &cfg.solserver.token,
        Duration::from_secs(cfg.periods.pubserver_min * 60),
        stats.clone(),
    ));
    let snapshots = Arc::new(SnapshotCollector::new(
        handle.clone(),
        stats.clone(),
        file.clone(),
        server.clone(),
    ));
    let stats_pub = Arc::new(StatsPublisher::new(
        handle.clone(),
        stats.clone(),
        file.clone(),
        server.clone(),
    ));

    let dispatcher = Dispatcher::new(
        notif_rx,
        handle.clone(),
        stats.clone(),
        file.clone(),
        server.clone(),
        shutdown.clone(),
    );
    tasks.push(("dispatcher", tokio::spawn(dispatcher.run())));

    tasks.push((
        "pubfile",
        spawn_periodic(
            "pubfile",
            Duration::from_secs(cfg.periods.pubfile_min * 60),
            shutdown.clone(),
            stats.clone(),
            {
                let file = file.clone();
                move || {
                    let file = file.clone();
                    async move { file.drain_once(now_epoch()) }
                }
            },
        ),
    ));
    tasks.push((
        "pubserver",
        spawn_periodic(
            "pubserver",
            Duration::from_secs(cfg.periods.pubserver_min * 60),
            shutdown.clone(),
            stats.clone(),
            {
                let server = server.clone();
                move || {
                    let server = server.clone();
                    async move { server.drain_once().await }
                }
            },
        ),
    ));
    tasks.push((
        "snapshot",
        spawn_periodic(
            "snapshot",
            Duration::from_secs(cfg.periods.snapshot_min * 60),
            shutdown.clone(),
            stats.clone(),
            {
                let snapshots = snapshots.clone();
                move || {
                    let snapshots = snapshots.clone();
                    async move {
                        let _ = snapshots.collect_and_publish().await;
                    }
                }
            },
        ),
    ));
    tasks.push((
        "stats",
        spawn_periodic(
            "stats",
            Duration::from_secs(cfg.periods.stats_min * 60),
            shutdown.clone(),
            stats.clone(),
            {
                let stats_pub = stats_pub.clone();
                move || {
                    let stats_pub = stats_pub.clone();
                    async move { stats_pub.publish_once() }
                }
            },
        ),
    ));

    let control_state = ControlState {
        stats: stats.clone(),
        handle: handle.clone(),
        server_pub: server.clone(),
        snapshots: snapshots.clone(),
        backup_path: cfg.files.backup.clone(),
        token: cfg.control.token.clone(),
        started_at: now_epoch(),
    };
    let router = control::build_router(control_state);
    let bind = SocketAddr::from(([0, 0, 0, 0], cfg.control.port));
    let tls = cfg.control.tls_pair();
    let api_shutdown = shutdown.clone();
    tasks.push((
        "control-api",
        tokio::spawn(async move {
            if let Err(e) = control::serve(bind, tls, router, api_shutdown).await {
                error!(error = %e, "control API server failed");
            }
        }),
    ));

    // Liveness poll until shutdown.
    loop {
        if sleep_or_shutdown(&mut shutdown, LIVENESS_PERIOD).await {
            break;
        }
        for (name, task) in &tasks {
            if task.is_finished() {
                error!(component = name, "component died, exiting for restart");
                return 1;
            }
        }
    }

    info!("shutting down, draining publishers");
    let final_drain = async {
        file.drain_all();
        server.drain_once().await;
    };
    if tokio::time::timeout(FINAL_DRAIN_BUDGET, final_drain)
        .await
        .is_err()
    {
        error!("final drain exceeded its budget, exiting anyway");
    }
    0
}
