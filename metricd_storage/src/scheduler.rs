//! The worker context: a fixed pool of threads that run blocking backend work.
//!
//! Each worker drains its own bounded queue. Tasks are routed to a worker by
//! hashing their metric key, so work for one key runs in submission order while
//! different keys proceed in parallel.

use async_std::channel::{self, Receiver, Sender};
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use metricd_core::debug::DEBUG;
use metricd_core::{Error, Result};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct Scheduler {
    queues: Vec<Sender<Task>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,

    /// Tasks accepted by a queue that have not finished running
    pending: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(workers: usize, queue_depth: usize) -> Result<Self> {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        let pending = Arc::new(AtomicUsize::new(0));
        for n in 0..workers {
            let (tx, rx) = channel::bounded(queue_depth.max(1));
            let name = format!("metricd-worker-{}", n);
            let worker_pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(rx, worker_pending))
                .map_err(|err| Error::Config(format!("failed to start worker thread: {}", err)))?;
            queues.push(tx);
            handles.push(handle);
        }
        Ok(Scheduler {
            queues,
            workers: Mutex::new(handles),
            pending,
        })
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// The number of tasks waiting in a queue or running
    pub fn queued(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn shard(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    /// Queues a task behind every task previously submitted for the same key.
    ///
    /// Waits (without blocking the thread) while the worker's queue is full.
    pub async fn submit<F>(&self, key: &str, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = &self.queues[self.shard(key)];
        let reservation = Reservation::new(&self.pending);
        queue
            .send(Box::new(task))
            .await
            .map_err(|_| Error::write(key, "scheduler is shut down"))?;
        reservation.commit();
        Ok(())
    }

    /// Resolves once every task submitted before this call has run
    pub async fn barrier(&self) {
        let mut pending = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            let (tx, rx) = oneshot::channel::<()>();
            let task: Task = Box::new(move || {
                tx.send(()).ok();
            });
            let reservation = Reservation::new(&self.pending);
            if queue.send(task).await.is_ok() {
                reservation.commit();
                pending.push(rx);
            }
        }
        for rx in pending {
            rx.await.ok();
        }
    }

    /// Stops accepting tasks, runs every task already queued, and joins the workers
    pub async fn shutdown(&self) {
        for queue in &self.queues {
            queue.close();
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }
        async_std::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("worker thread panicked");
                }
            }
        })
        .await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Workers exit on their own once their queue is closed and drained
        for queue in &self.queues {
            queue.close();
        }
    }
}

/// Counts a task as queued while it is being sent.
///
/// Unless committed, dropping it (a full queue's send was cancelled, or the
/// queue is closed) takes the task back out of the count.
struct Reservation<'a> {
    pending: &'a AtomicUsize,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pending: &'a AtomicUsize) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        DEBUG.task_queued();
        Reservation {
            pending,
            committed: false,
        }
    }

    /// The task reached its queue; the worker releases it once it has run
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            DEBUG.task_finished();
        }
    }
}

fn run_worker(rx: Receiver<Task>, pending: Arc<AtomicUsize>) {
    while let Ok(task) = async_std::task::block_on(rx.recv()) {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(
                worker = thread::current().name().unwrap_or("worker"),
                "task panicked"
            );
        }
        pending.fetch_sub(1, Ordering::AcqRel);
        DEBUG.task_finished();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[async_std::test]
    async fn runs_tasks_for_a_key_in_order() {
        let scheduler = Scheduler::new(4, 8).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..100 {
            let seen = Arc::clone(&seen);
            scheduler
                .submit("key", move || seen.lock().push(n))
                .await
                .unwrap();
        }
        scheduler.barrier().await;
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[async_std::test]
    async fn shutdown_drains_queued_tasks() {
        let scheduler = Scheduler::new(2, 64).unwrap();
        let seen = Arc::new(Mutex::new(0));
        for n in 0..50 {
            let seen = Arc::clone(&seen);
            let key = format!("key-{}", n % 7);
            scheduler
                .submit(&key, move || *seen.lock() += 1)
                .await
                .unwrap();
        }
        scheduler.shutdown().await;
        assert_eq!(*seen.lock(), 50);

        let rejected = scheduler.submit("key", || ()).await;
        assert!(matches!(rejected, Err(Error::Write { .. })));
    }

    #[async_std::test]
    async fn survives_a_panicking_task() {
        let scheduler = Scheduler::new(1, 8).unwrap();
        let seen = Arc::new(Mutex::new(false));
        scheduler.submit("key", || panic!("boom")).await.unwrap();
        let flag = Arc::clone(&seen);
        scheduler
            .submit("key", move || *flag.lock() = true)
            .await
            .unwrap();
        scheduler.barrier().await;
        assert!(*seen.lock());
    }

    #[async_std::test]
    async fn cancelled_submits_are_not_counted() {
        let scheduler = Scheduler::new(1, 1).unwrap();
        let (release, blocked) = std::sync::mpsc::channel::<()>();
        scheduler
            .submit("key", move || {
                blocked.recv().ok();
            })
            .await
            .unwrap();
        // Fills the queue while the worker is stuck on the first task
        scheduler.submit("key", || ()).await.unwrap();

        let full = async_std::future::timeout(
            Duration::from_millis(50),
            scheduler.submit("key", || ()),
        )
        .await;
        assert!(full.is_err());
        assert_eq!(scheduler.queued(), 2);

        release.send(()).unwrap();
        scheduler.shutdown().await;
        assert_eq!(scheduler.queued(), 0);
    }
}
