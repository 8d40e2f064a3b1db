//! File publisher: buffered, chronologically sorted appends to the
//! backup file.
//!
//! Objects are buffered for [`BUFFER_PERIOD_SECS`] before they are
//! written: late-arriving notifications (reliable-subscription health
//! reports and events) may carry timestamps older than freshly arrived
//! data, and holding a short window keeps the file approximately
//! chronological per write.  The resend path's range scans rely on
//! that.

use crate::stats::{StatsRegistry, names};
use sol_core::{SolObject, backup};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// How long an object is held before it becomes eligible for a write.
pub const BUFFER_PERIOD_SECS: i64 = 30;

/// Default backlog bound; overflow drops the oldest object.
const DEFAULT_CAPACITY: usize = 100_000;

/// The singleton file sink.  The supervisor owns the unique instance
/// and injects references into every producer.
pub struct FilePublisher {
    path: PathBuf,
    buffer: Mutex<Vec<SolObject>>,
    capacity: usize,
    stats: Arc<StatsRegistry>,
}

impl FilePublisher {
    pub fn new(path: PathBuf, stats: Arc<StatsRegistry>) -> FilePublisher {
        Self::with_capacity(path, stats, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        path: PathBuf,
        stats: Arc<StatsRegistry>,
        capacity: usize,
    ) -> FilePublisher {
        FilePublisher {
            path,
            buffer: Mutex::new(Vec::new()),
            capacity,
            stats,
        }
    }

    /// Enqueue one object for a later drain.
    pub fn publish(&self, obj: SolObject) {
        let mut buffer = self.buffer.lock().expect("file buffer mutex poisoned");
        if buffer.len() >= self.capacity {
            buffer.remove(0);
            self.stats.incr(names::PUBFILE_DROPS);
        }
        buffer.push(obj);
    }

    /// Current backlog length.
    pub fn backlog(&self) -> usize {
        self.buffer.lock().expect("file buffer mutex poisoned").len()
    }

    /// One drain pass: write every object older than the buffer window,
    /// in ascending timestamp order.
    pub fn drain_once(&self, now: i64) {
        self.drain_with_cutoff(now - BUFFER_PERIOD_SECS);
    }

    /// Final drain on shutdown: everything goes, window ignored.
    pub fn drain_all(&self) {
        self.drain_with_cutoff(i64::MAX);
    }

    fn drain_with_cutoff(&self, cutoff: i64) {
        let (batch, remaining) = {
            let mut buffer = self.buffer.lock().expect("file buffer mutex poisoned");
            buffer.sort_by_key(|o| o.timestamp);
            let split = buffer.partition_point(|o| o.timestamp <= cutoff);
            let batch: Vec<SolObject> = buffer.drain(..split).collect();
            (batch, buffer.len())
        };
        if batch.is_empty() {
            return;
        }

        self.stats.incr(names::PUBFILE_WRITES);
        self.stats
            .set_gauge(names::PUBFILE_BACKLOG, remaining as u64);

        // A failed write drops the batch; the stream continues with the
        // next drain.
        match backup::append(&self.path, &batch) {
            Ok(()) => debug!(objects = batch.len(), "backup file write"),
            Err(e) => {
                warn!(error = %e, objects = batch.len(), "backup file write failed, batch dropped");
                self.stats.incr(names::PUBFILE_WRITE_FAILS);
            }
        }
    }
}
