//! Supervised periodic background tasks.
//!
//! Every tick runs the task body to completion. A body that returns an
//! error or panics is logged and the task keeps ticking; only cancellation
//! stops it.

use futures::FutureExt;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Runs one unit of work, converting a panic into `None`.
///
/// Used for every tick of a [`PeriodicTask`] and by consumer loops around the
/// processing of a single message.
pub async fn supervise<Fut, T>(name: &str, fut: Fut) -> Option<T>
where
    Fut: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Some(value),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(task = %name, panic = %msg, "Task body panicked");
            None
        }
    }
}

/// Handle to a timer-driven background task.
///
/// Dropping the handle cancels the task after its current tick.
pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns `body` every `period` on the current tokio runtime.
    ///
    /// The first tick fires one `period` after spawning.
    pub fn spawn<F, Fut, E>(name: impl Into<String>, period: Duration, mut body: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = %task_name, period_ms = period.as_millis() as u64, "Periodic task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Some(Err(e)) = supervise(&task_name, body()).await {
                    warn!(task = %task_name, error = %e, "Periodic task iteration failed");
                }
            }

            debug!(task = %task_name, "Periodic task stopped");
        });

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Returns the task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests the task to stop after the current tick.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Returns true once [`stop`](Self::stop) has been requested.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops the task and waits for it to exit.
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_supervise_ok() {
        assert_eq!(supervise("t", async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_supervise_panic() {
        let out: Option<()> = supervise("t", async { panic!("boom") }).await;
        assert_eq!(out, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_survives_errors_and_panics() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = PeriodicTask::spawn("flaky", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                match n % 3 {
                    0 => Err("transient"),
                    1 => panic!("unexpected"),
                    _ => Ok(()),
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert!(count.load(Ordering::SeqCst) >= 5);
        assert_eq!(task.name(), "flaky");

        task.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = PeriodicTask::spawn("counter", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        task.stop();
        assert!(task.is_stopped());
        task.join().await;

        let seen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
