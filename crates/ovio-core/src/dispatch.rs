//! Continuation dispatch abstraction.
//!
//! A `Dispatcher` runs a closure somewhere other than the caller's stack.
//! The asynchronous protocol session never spawns threads itself; its
//! transport hands every stage to a dispatcher.
//!
//! # Implementors
//!
//! - `ThreadPool` (ovio-module): queues the job for a pool worker.
//!
//! - `InlineDispatcher` (testing): runs the job synchronously in the
//!   caller. Only for unit tests, since it re-enters the caller's locks.

use crate::error::Result;

/// A unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs on some execution context.
///
/// **Contract:**
/// - `dispatch()` must not run the job on the caller's stack unless the
///   implementor documents otherwise.
/// - Jobs may run concurrently with each other.
/// - A job that panics must not take the dispatcher down.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job) -> Result<()>;
}

/// Executes jobs immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}

impl<D: Dispatcher + ?Sized> Dispatcher for std::sync::Arc<D> {
    fn dispatch(&self, job: Job) -> Result<()> {
        (**self).dispatch(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inline_runs_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        InlineDispatcher.dispatch(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_arc_dyn_dispatcher() {
        let d: Arc<dyn Dispatcher> = Arc::new(InlineDispatcher);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        d.dispatch(Box::new(move || {
            h.fetch_add(2, Ordering::SeqCst);
        })).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
