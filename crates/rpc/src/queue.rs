//! FIFO dispatcher for locally-initiated outbound calls.
//!
//! Built on a fair `tokio::sync::Semaphore`: waiters are admitted in
//! acquisition order, which gives the queue its FIFO property without a
//! separate job list.  Inbound call handling is not routed through this
//! queue — handlers run concurrently unless the integrator serializes them.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

pub(crate) struct CallQueue {
    semaphore: Arc<Semaphore>,
    concurrency: Mutex<usize>,
}

impl CallQueue {
    pub(crate) fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency: Mutex::new(concurrency),
        }
    }

    pub(crate) fn concurrency(&self) -> usize {
        *self.concurrency.lock()
    }

    /// Change the admission limit at runtime.
    ///
    /// Raising the limit immediately admits queued jobs.  Lowering it never
    /// interrupts admitted jobs; the surplus permits are retired as they are
    /// released.
    pub(crate) fn set_concurrency(&self, n: usize) {
        let n = n.max(1);
        let mut current = self.concurrency.lock();
        if n > *current {
            self.semaphore.add_permits(n - *current);
        } else if n < *current {
            let surplus = (*current - n) as u32;
            let semaphore = self.semaphore.clone();
            tokio::spawn(async move {
                // Semaphore is never closed, so acquire_many cannot fail.
                if let Ok(permits) = semaphore.acquire_many(surplus).await {
                    permits.forget();
                }
            });
        }
        *current = n;
    }

    /// Run `job` once a permit is available.  Jobs are admitted in push
    /// order and hold their permit until completion.
    pub(crate) async fn run<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T>,
    {
        // Never closed, so acquire cannot fail.
        let _permit = self.semaphore.acquire().await;
        job.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    #[tokio::test]
    async fn serializes_at_concurrency_one() {
        let queue = Arc::new(CallQueue::new(1));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .run(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn respects_concurrency_bound() {
        let queue = Arc::new(CallQueue::new(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let queue = queue.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .run(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn raising_concurrency_admits_queued_jobs() {
        let queue = Arc::new(CallQueue::new(1));
        let (release_tx, mut release_rx) = mpsc::unbounded_channel::<()>();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<usize>();

        // Occupy the single permit.
        let q = queue.clone();
        let s = started_tx.clone();
        let blocker = tokio::spawn(async move {
            q.run(async {
                s.send(0).unwrap();
                release_rx.recv().await;
            })
            .await;
        });
        started_rx.recv().await.unwrap();

        // Queue two more jobs; neither can start yet.
        let mut waiters = Vec::new();
        for i in 1..=2 {
            let q = queue.clone();
            let s = started_tx.clone();
            waiters.push(tokio::spawn(async move {
                q.run(async {
                    s.send(i).unwrap();
                })
                .await;
            }));
        }
        tokio::task::yield_now().await;
        assert!(started_rx.try_recv().is_err());

        // Raising the limit admits them without releasing the blocker.
        queue.set_concurrency(3);
        let a = started_rx.recv().await.unwrap();
        let b = started_rx.recv().await.unwrap();
        // FIFO admission order among queued jobs.
        assert_eq!((a, b), (1, 2));

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        for w in waiters {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn lowering_concurrency_applies_to_new_admissions() {
        let queue = Arc::new(CallQueue::new(4));
        queue.set_concurrency(1);
        // Give the retirement task a chance to grab the surplus permits.
        tokio::task::yield_now().await;

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .run(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.concurrency(), 1);
    }
}
