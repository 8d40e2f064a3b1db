//! The two publication sinks: backup file and aggregation server.
//!
//! Each publisher owns its own backlog buffer and drains on its own
//! cadence; ingest fans out to both with no ordering between them.

pub mod file;
pub mod server;

pub use file::FilePublisher;
pub use server::ServerPublisher;

use crate::stats::{StatsRegistry, names};
use sol_core::SolObject;

/// Hand one object to both sinks, counting the enqueue.
pub fn submit(
    stats: &StatsRegistry,
    file: &FilePublisher,
    server: &ServerPublisher,
    obj: SolObject,
) {
    stats.incr(names::PUB_TOTAL_SENTTOPUBLISH);
    file.publish(obj.clone());
    server.publish(obj);
}
