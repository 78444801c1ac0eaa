//! Per-run mutable context and the cancellation signal shared with workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

/// Cloneable cancellation flag. Once raised it stays raised.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` only errors after drop.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Raise the signal after `timeout` unless it is raised earlier.
    pub fn cancel_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(timeout_secs = timeout.as_secs(), "run timeout reached; cancelling");
                    signal.cancel();
                }
                _ = signal.cancelled() => {}
            }
        })
    }

    /// Raise the signal on Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        warn!("interrupt received; draining in-flight work");
                        signal.cancel();
                    }
                }
                _ = signal.cancelled() => {}
            }
        })
    }
}

/// State owned by one run and threaded through every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancel: CancelSignal,
    /// Collection ids merged by this run's fetch stage.
    pub merged_ids: std::collections::BTreeSet<String>,
}

impl RunContext {
    pub fn new(cancel: CancelSignal) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            cancel,
            merged_ids: Default::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_sticky_and_observed_by_clones() {
        let signal = CancelSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_cancelled());

        let waiter = tokio::spawn({
            let observer = observer.clone();
            async move { observer.cancelled().await }
        });
        signal.cancel();
        waiter.await.unwrap();
        assert!(observer.is_cancelled());
        signal.cancel();
        assert!(observer.is_cancelled());
    }

    #[tokio::test]
    async fn timeout_raises_signal() {
        let signal = CancelSignal::new();
        signal
            .cancel_after(Duration::from_millis(5))
            .await
            .unwrap();
        assert!(signal.is_cancelled());
    }
}
