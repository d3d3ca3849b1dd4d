use log::{debug, warn};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fixed-period background loop with explicit start and stop.
///
/// The first tick fires one period after `start`. The tick callback must not
/// block; long work belongs in a task the callback spawns.
pub struct PeriodicTask {
    name: String,
    period: Duration,
    worker: Mutex<Option<Worker>>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            worker: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start ticking. Returns false if the task is already running.
    pub fn start<F>(&self, mut on_tick: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().map_or(false, |w| !w.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.period;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("{} started with period {:?}", name, period);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => on_tick(),
                }
            }
            debug!("{} stopped", name);
        });

        *worker = Some(Worker { cancel, handle });
        true
    }

    /// Stop ticking. No tick fires after this returns. Idempotent.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            worker.handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |w| !w.cancel.is_cancelled() && !w.handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("{} dropped while running; stopping", self.name);
        }
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_period() {
        let task = PeriodicTask::new("test", Duration::from_secs(1));
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();

        assert!(task.start(move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        task.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_effective_before_next_tick() {
        let task = PeriodicTask::new("test", Duration::from_secs(1));
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        task.start(move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.stop();
        task.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_rejected() {
        let task = PeriodicTask::new("test", Duration::from_secs(1));
        assert!(task.start(|| {}));
        assert!(!task.start(|| {}));
        task.stop();
        assert!(task.start(|| {}));
        task.stop();
    }
}
