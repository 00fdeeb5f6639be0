// src/pool.rs
//
// Fixed set of worker threads draining a bounded FIFO of jobs.
use crate::error::{EtudeError, EtudeResult};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A unit of work. Nothing is returned to the submitter.
pub trait Job: Send + 'static {
    fn run(self);
}

impl<F: FnOnce() + Send + 'static> Job for F {
    fn run(self) {
        self()
    }
}

/// Why a job was not queued. The job is handed back so the caller can apply
/// its own policy (the server closes the connection).
pub enum SubmitError<J> {
    Full(J),
    Closed(J),
}

impl<J> SubmitError<J> {
    pub fn into_inner(self) -> J {
        match self {
            SubmitError::Full(j) | SubmitError::Closed(j) => j,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, SubmitError::Full(_))
    }
}

impl<J> fmt::Debug for SubmitError<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Full(_) => f.write_str("SubmitError::Full"),
            SubmitError::Closed(_) => f.write_str("SubmitError::Closed"),
        }
    }
}

struct Queue<J> {
    jobs: VecDeque<J>,
    closed: bool,
}

struct Shared<J> {
    queue: Mutex<Queue<J>>,
    available: Condvar,
    capacity: usize,
}

impl<J> Shared<J> {
    // A panicking job never holds the lock, so poisoning carries no broken state.
    fn lock(&self) -> MutexGuard<'_, Queue<J>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ThreadPool<J: Job> {
    shared: Arc<Shared<J>>,
    handles: Vec<JoinHandle<()>>,
}

impl<J: Job> ThreadPool<J> {
    /// Spawns `threads` workers sharing a queue of at most `capacity` jobs.
    pub fn new(threads: usize, capacity: usize) -> EtudeResult<Self> {
        if threads == 0 || capacity == 0 {
            return Err(EtudeError::Config(format!(
                "thread pool needs at least one thread and one queue slot (threads={threads}, capacity={capacity})"
            )));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        });

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(threads),
        };
        for i in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || worker_loop(i, &shared))
                .map_err(EtudeError::PoolSpawn)?;
            pool.handles.push(handle);
        }
        debug!("Created {} worker threads", threads);
        Ok(pool)
    }

    /// Queues a job, or hands it back if the queue is at capacity or closed.
    pub fn submit(&self, job: J) -> Result<(), SubmitError<J>> {
        let mut queue = self.shared.lock();
        if queue.closed {
            return Err(SubmitError::Closed(job));
        }
        if queue.jobs.len() >= self.shared.capacity {
            return Err(SubmitError::Full(job));
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Stops accepting jobs, lets workers finish what is queued, and joins them.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        self.shared.lock().closed = true;
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited with a panic");
            }
        }
    }
}

impl<J: Job> Drop for ThreadPool<J> {
    fn drop(&mut self) {
        // Also reached when `new` fails halfway through spawning.
        self.close_and_join();
    }
}

fn worker_loop<J: Job>(id: usize, shared: &Shared<J>) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.closed {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Some(job) = job else {
            debug!("Worker {} exiting", id);
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            error!("Worker {} caught a panicking job", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    type BoxedJob = Box<dyn FnOnce() + Send>;

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(ThreadPool::<BoxedJob>::new(0, 4).is_err());
        assert!(ThreadPool::<BoxedJob>::new(2, 0).is_err());
    }

    #[test]
    fn test_capacity_and_fifo_order() {
        const CAP: usize = 8;
        let pool: ThreadPool<BoxedJob> = ThreadPool::new(1, CAP).unwrap();

        // Park the single worker so queued jobs stay queued.
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (order_tx, order_rx) = mpsc::channel();
        for i in 0..CAP {
            let tx = order_tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }

        let extra = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(extra.is_full());

        release_tx.send(()).unwrap();
        let seen: Vec<usize> = (0..CAP)
            .map(|_| order_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..CAP).collect::<Vec<_>>());

        pool.shutdown();
        // Every job ran exactly once.
        assert!(order_rx.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_wakes_idle_workers_and_drains() {
        let pool: ThreadPool<BoxedJob> = ThreadPool::new(4, 64).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let c = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool: ThreadPool<BoxedJob> = ThreadPool::new(1, 4).unwrap();
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
