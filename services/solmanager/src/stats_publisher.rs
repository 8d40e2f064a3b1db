//! Periodic self-description: a `SolmanagerStats` object carrying the
//! gateway, SDK and payload-format versions.

use crate::clock::now_epoch;
use crate::manager::ManagerHandle;
use crate::publishers::{FilePublisher, ServerPublisher, submit};
use crate::stats::StatsRegistry;
use crate::version;
use serde_json::json;
use sol_core::{SolObject, SolType};
use std::sync::Arc;
use tracing::debug;

pub struct StatsPublisher {
    handle: Arc<ManagerHandle>,
    stats: Arc<StatsRegistry>,
    file: Arc<FilePublisher>,
    server: Arc<ServerPublisher>,
}

impl StatsPublisher {
    pub fn new(
        handle: Arc<ManagerHandle>,
        stats: Arc<StatsRegistry>,
        file: Arc<FilePublisher>,
        server: Arc<ServerPublisher>,
    ) -> StatsPublisher {
        StatsPublisher {
            handle,
            stats,
            file,
            server,
        }
    }

    /// Emit one stats object; a no-op while the Manager MAC is not
    /// resolved (nothing sensible to stamp it with).
    pub fn publish_once(&self) {
        let Some(mac) = self.handle.manager_mac() else {
            debug!("skipping stats object, manager not connected");
            return;
        };
        let value = json!({
            "sol_version": version::SOL_VERSION,
            "solmanager_version": version::solmanager_version(),
            "sdk_version": version::SDK_VERSION,
        });
        match SolObject::new(mac, now_epoch(), SolType::SolmanagerStats, value) {
            Ok(obj) => submit(&self.stats, &self.file, &self.server, obj),
            Err(e) => debug!(error = %e, "stats object rejected"),
        }
    }
}
