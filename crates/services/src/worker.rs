//! # Supervised background workers
//!
//! Long-lived polling loops (math snapshot refresh, notification delivery) implement [`Worker`]
//! and are driven by [`spawn`]. The supervisor owns the loop: it sleeps between polls, backs off
//! after failures and exits promptly when [`WorkerHandle::stop`] is called. A worker never
//! reschedules itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domains::DomainError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Work was done and more may be waiting; poll again immediately.
    Busy,
    /// Nothing to do; sleep for the poll interval.
    Idle,
}

#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn poll(&self) -> Result<Progress, DomainError>;
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub interval: Duration,
    pub error_backoff: Duration,
}

pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the loop to exit and wait for it. An in-flight poll is allowed to finish.
    pub async fn stop(self) {
        // The receiver lives inside the task; a send error only means it already exited.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(worker = self.name, error = %err, "worker task ended abnormally");
        }
    }
}

/// Start `worker` on the current tokio runtime.
pub fn spawn<W: Worker>(worker: Arc<W>, schedule: Schedule) -> WorkerHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let name = worker.name();
    let join = tokio::spawn(async move {
        info!(worker = name, interval = ?schedule.interval, "worker started");
        loop {
            if *stopped.borrow() {
                break;
            }
            let pause = match worker.poll().await {
                Ok(Progress::Busy) => Duration::ZERO,
                Ok(Progress::Idle) => schedule.interval,
                Err(err) => {
                    warn!(worker = name, error = %err, backoff = ?schedule.error_backoff, "poll failed");
                    schedule.error_backoff
                }
            };
            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stopped.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker = name, "worker stopped");
    });
    WorkerHandle {
        name,
        shutdown,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl Worker for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn poll(&self) -> Result<Progress, DomainError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(DomainError::NoComments)
            } else {
                Ok(Progress::Idle)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn errors_back_off_and_never_end_the_loop() {
        let worker = Arc::new(Flaky {
            polls: AtomicUsize::new(0),
        });
        let handle = spawn(
            worker.clone(),
            Schedule {
                interval: Duration::from_secs(1),
                error_backoff: Duration::from_secs(5),
            },
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        let polls = worker.polls.load(Ordering::SeqCst);
        // One error (5s) plus one idle (1s) per cycle.
        assert!(polls >= 4, "only {polls} polls");

        handle.stop().await;
        let after = worker.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(worker.polls.load(Ordering::SeqCst), after);
    }
}
