//! Cancellable fixed-interval background tasks
//!
//! The rescue and auto-settlement loops run as [`PeriodicTask`]s: an owned
//! handle with an explicit [`stop`](PeriodicTask::stop), so shutdown is
//! deterministic and tests do not leak background work.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct PeriodicTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn a loop running `task` every `every`. When `run_at_start` is
    /// set the first run fires immediately instead of after one interval.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        every: Duration,
        run_at_start: bool,
        mut task: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let name = name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            if !run_at_start {
                // The first tick of a tokio interval completes immediately
                interval.tick().await;
            }

            loop {
                tokio::select! {
                    _ = interval.tick() => task().await,
                    _ = stop_rx.changed() => {
                        tracing::debug!(task = %task_name, "Periodic task stopping");
                        break;
                    }
                }
            }
        });

        tracing::info!(task = %name, interval_secs = every.as_secs_f64(), "Periodic task started");
        Self {
            name,
            stop_tx,
            handle,
        }
    }

    /// Signal the loop to stop and wait for it to finish its current run
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(task = %self.name, error = %e, "Periodic task join failed");
        }
        tracing::info!(task = %self.name, "Periodic task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_immediately_and_stops_cleanly() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        let task = PeriodicTask::spawn("test-loop", Duration::from_secs(3600), true, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Give the startup run a chance to fire, then stop
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deferred_start_does_not_run_before_interval() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        let task = PeriodicTask::spawn("test-loop", Duration::from_secs(3600), false, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
