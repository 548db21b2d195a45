//! `ThreadPool`: elastic worker pool.
//!
//! Starts `min_threads` OS threads and grows on demand up to
//! `max_threads`: a submission that finds no idle worker spawns one.
//! Workers above the minimum retire after `idle_timeout` without work.
//!
//! Work is registered once with [`ThreadPool::create_work`] and may be
//! submitted any number of times; every submission runs the callback once.
//! Ad-hoc closures arrive through the [`Dispatcher`] impl.
//!
//! Closing the pool abandons queued submissions and joins the workers, so
//! callbacks already running finish first.

use crate::config::PoolConfig;

use ovio_core::arena::Arena;
use ovio_core::dispatch::{Dispatcher, Job};
use ovio_core::error::{OvioError, Result};
use ovio_core::token::Token;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type WorkFn = Arc<dyn Fn() + Send + Sync>;

/// Handle to a registered work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkToken(Token);

impl WorkToken {
    pub fn token(self) -> Token {
        self.0
    }
}

enum Task {
    Work(WorkFn),
    Job(Job),
}

impl Task {
    fn run(self) {
        match self {
            Task::Work(work) => work(),
            Task::Job(job) => job(),
        }
    }
}

struct PoolState {
    min: usize,
    max: usize,
    /// Threads started and not yet exited
    live: usize,
    /// Workers parked on the condvar
    idle: usize,
    /// Workers inside a callback
    active: usize,
    shutdown: bool,
    next_id: usize,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Shared between the pool handle and its workers.
struct PoolInner {
    queue: SegQueue<Task>,
    state: Mutex<PoolState>,
    wake: Condvar,
    works: Mutex<Arena<WorkFn>>,
    idle_timeout: Duration,
}

pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

fn check_bounds(min: usize, max: usize) -> Result<()> {
    if min == 0 {
        return Err(OvioError::validation("thread pool minimum must be at least 1"));
    }
    if min > max {
        return Err(OvioError::validation(format!(
            "thread pool minimum {} exceeds maximum {}",
            min, max
        )));
    }
    Ok(())
}

impl ThreadPool {
    /// Create a pool of `min..=max` threads with environment defaults for
    /// everything else.
    pub fn new(min: usize, max: usize) -> Result<Self> {
        Self::from_config(PoolConfig::from_env().min_threads(min).max_threads(max))
    }

    /// Create a pool from `config`. Bounds are checked before any thread
    /// is spawned.
    pub fn from_config(config: PoolConfig) -> Result<Self> {
        check_bounds(config.min_threads, config.max_threads)?;

        let pool = ThreadPool {
            inner: Arc::new(PoolInner {
                queue: SegQueue::new(),
                state: Mutex::new(PoolState {
                    min: config.min_threads,
                    max: config.max_threads,
                    live: 0,
                    idle: 0,
                    active: 0,
                    shutdown: false,
                    next_id: 0,
                    handles: Vec::new(),
                }),
                wake: Condvar::new(),
                works: Mutex::new(Arena::new(config.max_work_items)),
                idle_timeout: config.idle_timeout,
            }),
        };

        {
            let mut state = pool.inner.state.lock();
            while state.live < state.min {
                spawn_worker(&pool.inner, &mut state)?;
            }
        }
        log::debug!(
            "thread pool started ({}..={} threads, idle {:?})",
            config.min_threads,
            config.max_threads,
            config.idle_timeout
        );
        Ok(pool)
    }

    /// Register `callback`, which receives `parameter` on every run.
    pub fn create_work<P, F>(&self, callback: F, parameter: P) -> Result<WorkToken>
    where
        P: Send + Sync + 'static,
        F: Fn(&P) + Send + Sync + 'static,
    {
        let work: WorkFn = Arc::new(move || callback(&parameter));
        self.inner.works.lock().insert(work).map(WorkToken)
    }

    /// Queue one run of a registered work item.
    pub fn submit_work(&self, token: WorkToken) -> Result<()> {
        let work = self
            .inner
            .works
            .lock()
            .get(token.0)
            .cloned()
            .ok_or_else(|| OvioError::invalid_state(format!("unknown work item {:?}", token.0)))?;
        self.enqueue(Task::Work(work))
    }

    /// Unregister a work item. Submissions already queued still run.
    pub fn close_work(&self, token: WorkToken) -> Result<()> {
        self.inner
            .works
            .lock()
            .remove(token.0)
            .map(drop)
            .ok_or_else(|| OvioError::invalid_state(format!("unknown work item {:?}", token.0)))
    }

    pub fn set_min_threads(&self, min: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        check_bounds(min, state.max)?;
        state.min = min;
        while state.live < state.min && !state.shutdown {
            spawn_worker(&self.inner, &mut state)?;
        }
        Ok(())
    }

    /// Lowering the maximum retires surplus workers as they go idle.
    pub fn set_max_threads(&self, max: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        check_bounds(state.min, max)?;
        state.max = max;
        if state.live > max {
            self.inner.wake.notify_all();
        }
        Ok(())
    }

    pub fn min_threads(&self) -> usize {
        self.inner.state.lock().min
    }

    pub fn max_threads(&self) -> usize {
        self.inner.state.lock().max
    }

    pub fn live_threads(&self) -> usize {
        self.inner.state.lock().live
    }

    /// Workers currently running a callback.
    pub fn active_workers(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Submissions waiting for a worker.
    pub fn pending_work(&self) -> usize {
        self.inner.queue.len()
    }

    /// Abandon queued work and join every worker. Idempotent.
    pub fn close(&self) {
        let handles = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let mut abandoned = 0usize;
            while self.inner.queue.pop().is_some() {
                abandoned += 1;
            }
            if abandoned > 0 {
                log::warn!("thread pool: abandoned {} queued work items", abandoned);
            }
            self.inner.wake.notify_all();
            std::mem::take(&mut state.handles)
        };

        let me = thread::current().id();
        for handle in handles {
            // A callback closing its own pool cannot join itself
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                log::error!("thread pool: worker exited by panic");
            }
        }
        self.inner.works.lock().drain();
        log::debug!("thread pool closed");
    }

    fn enqueue(&self, task: Task) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(OvioError::invalid_state("thread pool is closed"));
        }
        self.inner.queue.push(task);
        if state.idle == 0 && state.live < state.max {
            if let Err(err) = spawn_worker(&self.inner, &mut state) {
                // Existing workers will still drain the queue
                if state.live == 0 {
                    return Err(err);
                }
                log::warn!("thread pool: could not grow: {}", err);
            }
        }
        self.inner.wake.notify_one();
        Ok(())
    }
}

impl Dispatcher for ThreadPool {
    fn dispatch(&self, job: Job) -> Result<()> {
        self.enqueue(Task::Job(job))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ThreadPool")
            .field("min", &state.min)
            .field("max", &state.max)
            .field("live", &state.live)
            .field("active", &state.active)
            .finish()
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) -> Result<()> {
    let id = state.next_id;
    let shared = Arc::clone(inner);
    let handle = thread::Builder::new()
        .name(format!("ovio-worker-{}", id))
        .spawn(move || worker_loop(shared))?;
    state.next_id += 1;
    state.live += 1;
    state.handles.retain(|h| !h.is_finished());
    state.handles.push(handle);
    Ok(())
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>) {
    let mut state = inner.state.lock();
    loop {
        if let Some(task) = inner.queue.pop() {
            state.active += 1;
            MutexGuard::unlocked(&mut state, || run_task(task));
            state.active -= 1;
            continue;
        }
        if state.shutdown || state.live > state.max {
            break;
        }

        state.idle += 1;
        let timed_out = inner.wake.wait_for(&mut state, inner.idle_timeout).timed_out();
        state.idle -= 1;
        if timed_out && inner.queue.is_empty() && state.live > state.min {
            log::trace!("thread pool: idle worker retiring ({} live)", state.live - 1);
            break;
        }
    }
    state.live -= 1;
}

fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        log::error!("thread pool: work callback panicked: {}", msg);
    }
}
