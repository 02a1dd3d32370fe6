//! Bounded worker pool.
//!
//! Up to `capacity` named OS threads run submitted jobs. Threads are spawned
//! lazily as work arrives and then stay parked until shutdown. The queue
//! itself is unbounded and lock-free, so `submit` never blocks the event
//! loop; the mutex only guards the closed flag and condvar parking.
//!
//! Two counters are maintained for observability: jobs currently executing
//! and jobs still waiting in the queue. Each job moves queued -> running ->
//! gone exactly once, whether it returns or panics.

use crossbeam_queue::SegQueue;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub running: usize,
    pub queued: usize,
}

struct Task {
    seq: u64,
    job: Job,
}

struct Inner {
    capacity: usize,
    tasks: SegQueue<Task>,
    /// Set once by `shutdown`; parked workers sleep on `available` under it.
    closed: Mutex<bool>,
    available: Condvar,
    running: AtomicUsize,
    queued: AtomicUsize,
    /// Threads not currently executing a job.
    idle: AtomicUsize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, bool> {
        // Jobs run outside the lock, so a poisoned flag is still consistent.
        self.closed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct WorkerPool {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool that runs at most `capacity` jobs at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                tasks: SegQueue::new(),
                closed: Mutex::new(false),
                available: Condvar::new(),
                running: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
            }),
            threads: Vec::with_capacity(capacity),
        }
    }

    /// Queue `job` as task `seq` and return the counters right after submission.
    ///
    /// Fails only if the pool was shut down or a worker thread could not be
    /// spawned.
    pub fn submit<F>(&mut self, seq: u64, job: F) -> io::Result<PoolStats>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            // Pushed under the lock so a worker that just found the queue
            // empty is already waiting when we notify.
            let closed = self.inner.lock();
            if *closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "worker pool is shut down",
                ));
            }
            self.inner.queued.fetch_add(1, Ordering::AcqRel);
            self.inner.tasks.push(Task {
                seq,
                job: Box::new(job),
            });
        }

        let queued = self.inner.queued.load(Ordering::Acquire);
        let idle = self.inner.idle.load(Ordering::Acquire);
        if queued > idle && self.threads.len() < self.inner.capacity {
            self.spawn_worker()?;
        }
        self.inner.available.notify_one();

        Ok(self.stats())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            running: self.inner.running.load(Ordering::Acquire),
            queued: self.inner.queued.load(Ordering::Acquire),
        }
    }

    /// Stop accepting jobs, let every queued and running job finish, then
    /// join the worker threads.
    pub fn shutdown(&mut self) {
        *self.inner.lock() = true;
        self.inner.available.notify_all();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }

    fn spawn_worker(&mut self) -> io::Result<()> {
        let worker_id = self.threads.len();
        let inner = Arc::clone(&self.inner);
        // Counted idle from birth so a burst of submits does not overshoot.
        inner.idle.fetch_add(1, Ordering::AcqRel);

        let spawned = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || worker_loop(&inner));

        match spawned {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.idle.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let Some(task) = next_task(inner) else {
            inner.idle.fetch_sub(1, Ordering::AcqRel);
            return;
        };

        inner.running.fetch_add(1, Ordering::AcqRel);

        let Task { seq, job } = task;
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(seq, "Task panicked");
        } else {
            debug!(seq, "Task finished");
        }

        inner.running.fetch_sub(1, Ordering::AcqRel);
        inner.idle.fetch_add(1, Ordering::AcqRel);
    }
}

/// Pop the next task, parking while the queue is empty. `None` once the pool
/// is closed and fully drained.
fn next_task(inner: &Inner) -> Option<Task> {
    loop {
        if let Some(task) = inner.tasks.pop() {
            // Leave idle first: a submit racing with us must never see a
            // queued task covered by an idle thread that is already taken.
            inner.idle.fetch_sub(1, Ordering::AcqRel);
            inner.queued.fetch_sub(1, Ordering::AcqRel);
            return Some(task);
        }

        let closed = inner.lock();
        if !inner.tasks.is_empty() {
            continue;
        }
        if *closed {
            return None;
        }
        drop(
            inner
                .available
                .wait(closed)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }
}
