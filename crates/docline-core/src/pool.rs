//! Fixed-size worker pool with a bounded, blocking submission queue
//!
//! Every rayon thread runs one long-lived worker loop pulling from a FIFO
//! queue. Submitting to a full queue blocks the caller, which is the
//! pipeline's only form of backpressure. A run limit below the thread count
//! keeps some workers idle (single-threaded start-id scans).

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub enum PoolError {
    /// Pool is shut down or cancelled
    Rejected,
    /// Worker threads could not be started
    Build(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "task rejected: pool is shut down"),
            Self::Build(msg) => write!(f, "failed to start worker threads: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

struct PoolState {
    tasks: VecDeque<Task>,
    running: usize,
    limit: usize,
    closed: bool,
    cancelled: bool,
    live_workers: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled when the queue shrinks
    not_full: Condvar,
    /// Signalled when a task is queued or a run slot frees
    work: Condvar,
    /// Signalled when a task finishes or a worker exits
    idle: Condvar,
    capacity: usize,
    threads: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool state poisoned")
    }

    fn set_limit(&self, limit: usize) {
        let mut state = self.lock();
        state.limit = limit.clamp(1, self.threads);
        self.work.notify_all();
    }

    /// Stop accepting work and drop everything still queued.
    fn cancel(&self) -> usize {
        let dropped: Vec<Task> = {
            let mut state = self.lock();
            state.cancelled = true;
            state.closed = true;
            state.tasks.drain(..).collect()
        };
        self.work.notify_all();
        self.not_full.notify_all();
        self.idle.notify_all();
        let n = dropped.len();
        // Dropped outside the lock: tasks may release resource claims
        drop(dropped);
        n
    }

    fn in_flight(&self) -> usize {
        let state = self.lock();
        state.tasks.len() + state.running
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if state.cancelled {
                    break None;
                }
                if state.running < state.limit {
                    if let Some(task) = state.tasks.pop_front() {
                        state.running += 1;
                        shared.not_full.notify_one();
                        break Some(task);
                    }
                }
                if state.closed && state.tasks.is_empty() {
                    break None;
                }
                state = shared.work.wait(state).expect("pool state poisoned");
            }
        };
        let Some(task) = task else { break };

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            log::error!("worker task panicked");
        }

        let mut state = shared.lock();
        state.running -= 1;
        shared.work.notify_all();
        shared.idle.notify_all();
    }
    let mut state = shared.lock();
    state.live_workers -= 1;
    shared.idle.notify_all();
}

/// Cloneable control handle, held by the monitor to halt or resize the pool.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Discard queued tasks and reject further submissions.
    pub fn cancel(&self) -> usize {
        self.shared.cancel()
    }

    pub fn set_limit(&self, limit: usize) {
        self.shared.set_limit(limit);
    }

    /// Allow every thread to run tasks again.
    pub fn reset_limit(&self) {
        self.shared.set_limit(self.shared.threads);
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("threads", &self.shared.threads)
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    _threads: rayon::ThreadPool,
}

impl WorkerPool {
    /// Start `threads` workers over a queue of `capacity` tasks, of which at
    /// most `limit` run at once.
    pub fn new(threads: usize, capacity: usize, limit: usize) -> Result<Self, PoolError> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::with_capacity(capacity),
                running: 0,
                limit: limit.clamp(1, threads),
                closed: false,
                cancelled: false,
                live_workers: threads,
            }),
            not_full: Condvar::new(),
            work: Condvar::new(),
            idle: Condvar::new(),
            capacity: capacity.max(1),
            threads,
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("docline-worker-{i}"))
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;
        for _ in 0..threads {
            let shared = shared.clone();
            pool.spawn(move || worker_loop(shared));
        }
        log::debug!("Started {threads} workers (queue {capacity}, limit {limit})");
        Ok(Self {
            shared,
            _threads: pool,
        })
    }

    /// Queue a task, blocking while the queue is full.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        let mut state = self.shared.lock();
        loop {
            if state.closed || state.cancelled {
                return Err(PoolError::Rejected);
            }
            if state.tasks.len() < self.shared.capacity {
                break;
            }
            state = self
                .shared
                .not_full
                .wait(state)
                .expect("pool state poisoned");
        }
        state.tasks.push_back(Box::new(task));
        self.shared.work.notify_one();
        Ok(())
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        self.shared.set_limit(limit);
    }

    /// Stop accepting tasks; queued tasks still run.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        self.shared.work.notify_all();
        self.shared.not_full.notify_all();
    }

    /// Stop accepting tasks and discard the queue. Returns the number discarded.
    pub fn cancel(&self) -> usize {
        self.shared.cancel()
    }

    /// Wait until every worker has exited. Returns `false` on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.live_workers > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .idle
                .wait_timeout(state, deadline - now)
                .expect("pool state poisoned")
                .0;
        }
        true
    }

    /// Queued plus running tasks
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Idle workers would otherwise wait on the queue forever
        self.shutdown();
    }
}
