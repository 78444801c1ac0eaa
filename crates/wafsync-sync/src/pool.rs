//! Bounded worker pool draining a shared queue.
//!
//! Workers only produce values; the caller consumes them from one place and
//! is the only code that mutates the stores.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::error;

use crate::context::CancelSignal;

pub struct PoolRun<I, O> {
    results: mpsc::Receiver<O>,
    queue: Arc<Mutex<VecDeque<I>>>,
    tasks: JoinSet<()>,
}

/// Start `concurrency` workers over `items`. Each worker takes one item,
/// runs `work` to completion, sends the output and takes the next one.
/// Once `cancel` is raised no new item is taken; in-flight items finish.
pub fn spawn_pool<I, O, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    cancel: CancelSignal,
    work: F,
) -> PoolRun<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let workers = concurrency.max(1).min(items.len().max(1));
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let (tx, results) = mpsc::channel(workers * 2);
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();

    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let work = Arc::clone(&work);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(item) = queue.lock().await.pop_front() else {
                    break;
                };
                let output = work(item).await;
                if tx.send(output).await.is_err() {
                    break;
                }
            }
        });
    }

    PoolRun {
        results,
        queue,
        tasks,
    }
}

impl<I, O> PoolRun<I, O> {
    /// Next completed output; `None` once every worker has stopped.
    pub async fn next(&mut self) -> Option<O> {
        self.results.recv().await
    }

    /// Wait for the workers and return the items nobody started.
    pub async fn finish(mut self) -> Vec<I> {
        self.results.close();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task failed");
            }
        }
        let mut queue = self.queue.lock().await;
        queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn processes_every_item_with_bounded_parallelism() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut run = spawn_pool((0..40).collect::<Vec<u32>>(), 4, CancelSignal::new(), {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |n| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    n * 2
                }
            }
        });

        let mut outputs = Vec::new();
        while let Some(out) = run.next().await {
            outputs.push(out);
        }
        assert!(run.finish().await.is_empty());
        outputs.sort_unstable();
        assert_eq!(outputs, (0..40).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn cancellation_stops_taking_new_items() {
        let cancel = CancelSignal::new();
        let mut run = spawn_pool((0..100).collect::<Vec<u32>>(), 2, cancel.clone(), |n| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            n
        });

        let mut seen = 0;
        while let Some(_) = run.next().await {
            seen += 1;
            if seen == 3 {
                cancel.cancel();
            }
        }
        let untouched = run.finish().await;
        // at most one channel buffer plus one in-flight item per worker after the signal
        assert!((3..=9).contains(&seen), "seen {seen}");
        assert_eq!(seen + untouched.len(), 100);
    }

    #[tokio::test]
    async fn empty_queue_finishes_immediately() {
        let mut run = spawn_pool(Vec::<u8>::new(), 8, CancelSignal::new(), |n| async move { n });
        assert!(run.next().await.is_none());
        assert!(run.finish().await.is_empty());
    }
}
