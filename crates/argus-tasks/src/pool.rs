//! Fixed-size worker pool draining a bounded FIFO queue.
//!
//! Workers are plain OS threads, so a job may block on disk, a database or
//! a network call without stalling any event loop. The queue is guarded by
//! one mutex with `not_empty` and `not_full` condition variables.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use argus_core::{ConnectionId, Stoppable};
use argus_telemetry::metrics::{record_pool_job, JobOutcome};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, PoolResult};

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum number of queued jobs.
    pub queue_capacity: usize,
    /// Name prefix for worker threads.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            thread_name: "argus-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    fn validate(&self) -> PoolResult<()> {
        if self.workers == 0 {
            return Err(PoolError::invalid_config("workers must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::invalid_config(
                "queue_capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// One unit of work.
///
/// The job owns everything it needs; it never borrows from the connection
/// that produced it.
pub struct Job {
    connection_id: ConnectionId,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    /// Creates a job on behalf of `connection_id`.
    pub fn new<F>(connection_id: ConnectionId, work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            connection_id,
            work: Box::new(work),
        }
    }

    /// Returns the connection the job was submitted for.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Number of worker threads.
    pub workers: usize,
    /// Jobs waiting in the queue.
    pub queued: usize,
    /// Jobs that ran to completion.
    pub completed: u64,
    /// Jobs that panicked.
    pub panicked: u64,
    /// Jobs discarded at shutdown.
    pub dropped: u64,
}

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    completed: AtomicU64,
    panicked: AtomicU64,
    dropped: AtomicU64,
}

/// A fixed set of threads executing [`Job`]s in FIFO order.
///
/// # Example
///
/// ```rust
/// use argus_core::ConnectionId;
/// use argus_tasks::{Job, PoolConfig, WorkerPool};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(PoolConfig::new().with_workers(2)).unwrap();
/// let (tx, rx) = mpsc::channel();
///
/// pool.submit(Job::new(ConnectionId::new(), move || {
///     tx.send(6 * 7).unwrap();
/// }))
/// .unwrap();
///
/// assert_eq!(rx.recv().unwrap(), 42);
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Starts the pool's worker threads.
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(config.queue_capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: config.queue_capacity,
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{i}", config.thread_name))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop the workers already started before bailing out.
                    shared.queue.lock().shutdown = true;
                    shared.not_empty.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PoolError::spawn_failed(e.to_string()));
                }
            }
        }

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            worker_count: config.workers,
        })
    }

    /// Enqueues a job, blocking while the queue is full.
    ///
    /// Returns [`PoolError::ShuttingDown`] once shutdown began, including
    /// when shutdown starts while this call is waiting for space.
    pub fn submit(&self, job: Job) -> PoolResult<()> {
        let mut queue = self.shared.queue.lock();
        while !queue.shutdown && queue.jobs.len() >= self.shared.capacity {
            self.shared.not_full.wait(&mut queue);
        }
        if queue.shutdown {
            return Err(PoolError::ShuttingDown);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues a job without waiting.
    pub fn try_submit(&self, job: Job) -> PoolResult<()> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(PoolError::ShuttingDown);
        }
        if queue.jobs.len() >= self.shared.capacity {
            record_pool_job(JobOutcome::Rejected);
            return Err(PoolError::QueueFull(self.shared.capacity));
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Stops the pool and joins every worker.
    ///
    /// Queued jobs are dropped without running; the number dropped is
    /// returned. Jobs already running finish first. Later calls return 0.
    pub fn shutdown(&self) -> usize {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                0
            } else {
                queue.shutdown = true;
                let dropped = queue.jobs.len();
                queue.jobs.clear();
                dropped
            }
        };
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        if dropped > 0 {
            self.shared
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            for _ in 0..dropped {
                record_pool_job(JobOutcome::Dropped);
            }
            warn!(dropped, "worker pool discarded queued jobs at shutdown");
        }

        let handles = std::mem::take(&mut *self.workers.lock());
        let current = std::thread::current().id();
        let joined = handles.len();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
        if joined > 0 {
            info!(workers = joined, "worker pool stopped");
        }
        dropped
    }

    /// Returns true once shutdown began.
    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    /// Returns current statistics.
    pub fn stats(&self) -> PoolStats {
        let queued = self.shared.queue.lock().jobs.len();
        PoolStats {
            workers: self.worker_count,
            queued,
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Returns the queue capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Stoppable for WorkerPool {
    fn stop(&self) -> bool {
        self.shutdown();
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    debug!("worker exiting");
                    return;
                }
                shared.not_empty.wait(&mut queue);
            }
        };
        shared.not_full.notify_one();
        run_job(shared, job);
    }
}

fn run_job(shared: &Shared, job: Job) {
    let connection_id = job.connection_id;
    match panic::catch_unwind(AssertUnwindSafe(job.work)) {
        Ok(()) => {
            shared.completed.fetch_add(1, Ordering::Relaxed);
            record_pool_job(JobOutcome::Completed);
        }
        Err(payload) => {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            record_pool_job(JobOutcome::Panicked);
            error!(
                %connection_id,
                panic = panic_message(payload.as_ref()),
                "job panicked; worker continues"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn job(f: impl FnOnce() + Send + 'static) -> Job {
        Job::new(ConnectionId::new(), f)
    }

    /// A latch the test opens to release blocked jobs.
    #[derive(Clone, Default)]
    struct Gate(Arc<(Mutex<bool>, Condvar)>);

    impl Gate {
        fn wait(&self) {
            let (lock, cv) = &*self.0;
            let mut open = lock.lock();
            while !*open {
                cv.wait(&mut open);
            }
        }

        fn open(&self) {
            let (lock, cv) = &*self.0;
            *lock.lock() = true;
            cv.notify_all();
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            WorkerPool::new(PoolConfig::new().with_workers(0)),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(matches!(
            WorkerPool::new(PoolConfig::new().with_queue_capacity(0)),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_every_job_runs_exactly_once() {
        let pool = WorkerPool::new(PoolConfig::new().with_workers(3).with_queue_capacity(4)).unwrap();
        let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..50).map(|_| AtomicUsize::new(0)).collect());

        for i in 0..50 {
            let counts = Arc::clone(&counts);
            pool.submit(job(move || {
                counts[i].fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        wait_until(|| pool.stats().completed == 50);
        assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(pool.shutdown(), 0);
    }

    #[test]
    fn test_submit_blocks_when_queue_full() {
        const WORKERS: usize = 2;
        const CAPACITY: usize = 3;
        const JOBS: usize = 8;

        let pool = Arc::new(
            WorkerPool::new(
                PoolConfig::new()
                    .with_workers(WORKERS)
                    .with_queue_capacity(CAPACITY),
            )
            .unwrap(),
        );
        let gate = Gate::default();
        let submitted = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let submitter = {
            let pool = Arc::clone(&pool);
            let gate = gate.clone();
            let submitted = Arc::clone(&submitted);
            let ran = Arc::clone(&ran);
            std::thread::spawn(move || {
                for _ in 0..JOBS {
                    let gate = gate.clone();
                    let ran = Arc::clone(&ran);
                    pool.submit(job(move || {
                        gate.wait();
                        ran.fetch_add(1, Ordering::SeqCst);
                    }))
                    .unwrap();
                    submitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Both workers hold a job and the queue is full; the submitter is stuck.
        wait_until(|| pool.stats().queued == CAPACITY);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(submitted.load(Ordering::SeqCst), WORKERS + CAPACITY);
        assert!(!submitter.is_finished());

        gate.open();
        submitter.join().unwrap();
        wait_until(|| pool.stats().completed == JOBS as u64);
        assert_eq!(ran.load(Ordering::SeqCst), JOBS);
    }

    #[test]
    fn test_try_submit_reports_queue_full() {
        let pool = WorkerPool::new(PoolConfig::new().with_workers(1).with_queue_capacity(1)).unwrap();
        let gate = Gate::default();

        let g = gate.clone();
        pool.try_submit(job(move || g.wait())).unwrap();
        wait_until(|| pool.stats().queued == 0);

        let g = gate.clone();
        pool.try_submit(job(move || g.wait())).unwrap();
        assert_eq!(pool.try_submit(job(|| {})), Err(PoolError::QueueFull(1)));

        gate.open();
        wait_until(|| pool.stats().completed == 2);
    }

    #[test]
    fn test_shutdown_drops_queued_jobs() {
        let pool = WorkerPool::new(PoolConfig::new().with_workers(1).with_queue_capacity(8)).unwrap();
        let gate = Gate::default();
        let ran = Arc::new(AtomicUsize::new(0));

        let g = gate.clone();
        let r = Arc::clone(&ran);
        pool.submit(job(move || {
            g.wait();
            r.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        wait_until(|| pool.stats().queued == 0);

        for _ in 0..5 {
            let r = Arc::clone(&ran);
            pool.submit(job(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        let opener = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                gate.open();
            })
        };
        assert_eq!(pool.shutdown(), 5);
        opener.join().unwrap();

        // Only the job already running completed.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.dropped, 5);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_submissions() {
        let pool = WorkerPool::new(PoolConfig::default()).unwrap();
        assert_eq!(pool.shutdown(), 0);
        assert_eq!(pool.shutdown(), 0);
        assert!(pool.is_shutdown());
        assert_eq!(pool.submit(job(|| {})), Err(PoolError::ShuttingDown));
        assert_eq!(pool.try_submit(job(|| {})), Err(PoolError::ShuttingDown));
    }

    #[test]
    fn test_blocked_submitter_released_by_shutdown() {
        let pool = Arc::new(WorkerPool::new(PoolConfig::new().with_workers(1).with_queue_capacity(1)).unwrap());
        let gate = Gate::default();

        let g = gate.clone();
        pool.submit(job(move || g.wait())).unwrap();
        wait_until(|| pool.stats().queued == 0);
        pool.submit(job(|| {})).unwrap();

        let (tx, rx) = mpsc::channel();
        let blocked = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                tx.send(pool.submit(job(|| {}))).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let opener = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                gate.open();
            })
        };
        pool.shutdown();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Err(PoolError::ShuttingDown));
        blocked.join().unwrap();
        opener.join().unwrap();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(PoolConfig::new().with_workers(1)).unwrap();
        pool.submit(job(|| panic!("handler exploded"))).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.submit(job(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_stoppable_stops_pool() {
        let pool = WorkerPool::new(PoolConfig::default()).unwrap();
        assert!(Stoppable::stop(&pool));
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_worker_thread_names() {
        let pool = WorkerPool::new(PoolConfig::new().with_workers(1).with_thread_name("argus-test")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(job(move || {
            tx.send(std::thread::current().name().map(str::to_string)).unwrap();
        }))
        .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("argus-test-0"));
    }
}
