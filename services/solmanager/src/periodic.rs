//! Periodic task driver.
//!
//! One abstraction serves every cadence-driven component (file drain,
//! server drain, snapshot, stats): after an initial 5-second delay the
//! task body runs once per period, never re-entrantly.  A panic inside
//! the body is caught, logged as a crash event, counted, and terminates
//! the task — the supervisor's liveness poll notices the dead handle.
//!
//! The driver sleeps for the full period and is cancellable mid-sleep
//! through the shutdown watch channel.

use crate::clock::now_epoch;
use crate::stats::{StatsRegistry, names};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Delay before the first invocation of any periodic task.
pub const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Spawn a periodic task named `name` with the given cadence.
///
/// `task` is a factory producing one future per tick; ticks never
/// overlap.  The returned handle finishes when the task crashes or
/// shutdown is signalled.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<StatsRegistry>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if sleep_or_shutdown(&mut shutdown, STARTUP_DELAY).await {
            return;
        }
        loop {
            debug!(task = name, "periodic tick");
            let tick = AssertUnwindSafe(task()).catch_unwind();
            if let Err(panic) = tick.await {
                error!(
                    task = name,
                    panic = panic_message(&panic),
                    "periodic task crashed, terminating"
                );
                stats.incr(names::ADM_NUM_CRASHES);
                stats.set_gauge(names::ADM_LAST_CRASH_TS, now_epoch() as u64);
                return;
            }
            if sleep_or_shutdown(&mut shutdown, period).await {
                return;
            }
        }
    })
}

/// Sleep for `dur`, returning early with `true` when shutdown is
/// signalled (or the shutdown sender is gone).
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(dur) => false,
        changed = shutdown.changed() => match changed {
            Ok(()) => *shutdown.borrow(),
            Err(_) => true,
        },
    }
}

/// Best-effort extraction of a panic payload message.
fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_after_startup_delay_then_every_period() {
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(StatsRegistry::in_memory());
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let _handle = spawn_periodic(
            "test",
            Duration::from_secs(60),
            rx,
            stats,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "still in startup delay");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "first tick after 5 s");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2, "second tick one period later");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_mid_sleep() {
        let (tx, rx) = watch::channel(false);
        let stats = Arc::new(StatsRegistry::in_memory());
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let handle = spawn_periodic(
            "test",
            Duration::from_secs(600),
            rx,
            stats,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_finished(), "task exits promptly on shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn panic_is_counted_and_terminates_the_task() {
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(StatsRegistry::in_memory());

        let handle = spawn_periodic(
            "crashy",
            Duration::from_secs(60),
            rx,
            stats.clone(),
            || async {
                panic!("boom");
            },
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
        assert_eq!(stats.get(names::ADM_NUM_CRASHES), 1);
        assert!(stats.get(names::ADM_LAST_CRASH_TS) > 0);
    }
}
