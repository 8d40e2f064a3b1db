//! Server publisher: chunked HTTPS delivery to the aggregation server.
//!
//! The buffer is FIFO; a drain snapshots it, encodes the objects,
//! groups them into chunks of at most ten, and POSTs the chunks in
//! order.  Objects leave the buffer only when their chunk is answered
//! 200, so a failure mid-drain retains the tail and the next period
//! retries from the head — at-least-once delivery, in order per chunk.
//! The server deduplicates on the (MAC, timestamp, type) tuple.

use crate::stats::{StatsRegistry, names};
use sol_core::SolObject;
use sol_core::http_payload::{self, HttpPayload};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default backlog bound; overflow drops the oldest object.
const DEFAULT_CAPACITY: usize = 100_000;

/// The singleton server sink.
pub struct ServerPublisher {
    url: String,
    token: String,
    client: reqwest::Client,
    buffer: Mutex<Vec<SolObject>>,
    capacity: usize,
    stats: Arc<StatsRegistry>,
}

/// How one chunk POST failed.
enum SendFailure {
    /// Server answered with a non-200 status.
    Rejected(u16),
    /// Could not reach the server (refused, timed out).
    Network(String),
    /// Transport-level failure (TLS, malformed exchange).
    Transport(String),
}

impl ServerPublisher {
    /// Production constructor: HTTPS to `solserver_host`, request
    /// timeout bounded to half the drain period so one stuck POST
    /// cannot eat consecutive drains.
    pub fn new(
        host: &str,
        token: &str,
        period: Duration,
        stats: Arc<StatsRegistry>,
    ) -> ServerPublisher {
        let timeout = (period / 2).max(Duration::from_secs(1));
        Self::with_base_url(format!("https://{host}"), token, timeout, stats, DEFAULT_CAPACITY)
    }

    /// Explicit base URL and capacity, for tests.
    pub fn with_base_url(
        base: String,
        token: &str,
        timeout: Duration,
        stats: Arc<StatsRegistry>,
        capacity: usize,
    ) -> ServerPublisher {
        ServerPublisher {
            url: format!("{base}/api/v1/o.json"),
            token: token.to_owned(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            buffer: Mutex::new(Vec::new()),
            capacity,
            stats,
        }
    }

    /// Enqueue one object at the buffer tail.
    pub fn publish(&self, obj: SolObject) {
        let mut buffer = self.buffer.lock().expect("server buffer mutex poisoned");
        if buffer.len() >= self.capacity {
            buffer.remove(0);
            self.stats.incr(names::PUBSERVER_DROPS);
        }
        buffer.push(obj);
    }

    /// Re-publish objects recovered from the backup file; they join the
    /// buffer tail and go out with the next drain.  Returns how many
    /// were enqueued.
    pub fn enqueue_resend(&self, objects: Vec<SolObject>) -> usize {
        let n = objects.len();
        for obj in objects {
            self.publish(obj);
        }
        n
    }

    /// Current backlog length.
    pub fn backlog(&self) -> usize {
        self.buffer
            .lock()
            .expect("server buffer mutex poisoned")
            .len()
    }

    /// One drain pass.
    pub async fn drain_once(&self) {
        let snapshot: Vec<SolObject> = {
            self.buffer
                .lock()
                .expect("server buffer mutex poisoned")
                .clone()
        };
        if snapshot.is_empty() {
            return;
        }

        let chunks = match http_payload::to_chunks(&snapshot) {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(error = %e, "failed to encode publish chunks");
                return;
            }
        };

        self.stats.incr(names::PUBSERVER_SENDATTEMPTS);
        for chunk in &chunks {
            let size = chunk.o.len();
            match self.post_chunk(chunk).await {
                Ok(()) => {
                    self.stats.incr(names::PUBSERVER_SENDOK);
                    let mut buffer =
                        self.buffer.lock().expect("server buffer mutex poisoned");
                    let drain_len = size.min(buffer.len());
                    buffer.drain(..drain_len);
                    debug!(objects = size, "chunk accepted");
                }
                Err(SendFailure::Rejected(status)) => {
                    warn!(status, "server rejected chunk, keeping backlog");
                    self.stats.incr(names::PUBSERVER_SENDFAIL);
                    break;
                }
                Err(SendFailure::Network(e)) => {
                    warn!(error = %e, "server not reachable, keeping backlog");
                    self.stats.incr(names::PUBSERVER_SENDFAIL);
                    break;
                }
                Err(SendFailure::Transport(e)) => {
                    warn!(error = %e, "transport failure, keeping backlog");
                    self.stats.incr(names::PUBSERVER_UNREACHABLE);
                    break;
                }
            }
        }
        self.stats
            .set_gauge(names::PUBSERVER_BACKLOG, self.backlog() as u64);
    }

    async fn post_chunk(&self, chunk: &HttpPayload) -> Result<(), SendFailure> {
        let response = self
            .client
            .post(&self.url)
            .header("X-REALMS-Token", &self.token)
            .json(chunk)
            .send()
            .await
            .map_err(classify)?;
        if response.status().as_u16() != 200 {
            return Err(SendFailure::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

fn classify(e: reqwest::Error) -> SendFailure {
    if e.is_connect() || e.is_timeout() {
        SendFailure::Network(e.to_string())
    } else {
        SendFailure::Transport(e.to_string())
    }
}
