//! Condvar backend for platforms without futex
//!
//! A single process-wide condvar serves every signal. Wakeups are
//! broadcast and each waiter re-checks its own word.

use super::WaitOutcome;
use parking_lot::{const_mutex, Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

static LOCK: Mutex<()> = const_mutex(());
static CONDVAR: Condvar = Condvar::new();

pub(super) fn wait_word(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<Duration>,
    _shared: bool,
) -> WaitOutcome {
    let mut guard = LOCK.lock();
    if word.load(Ordering::Acquire) != expected {
        return WaitOutcome::Woken;
    }
    match timeout {
        Some(t) => {
            if CONDVAR.wait_for(&mut guard, t).timed_out() {
                WaitOutcome::TimedOut
            } else {
                WaitOutcome::Woken
            }
        }
        None => {
            CONDVAR.wait(&mut guard);
            WaitOutcome::Woken
        }
    }
}

pub(super) fn wake_word(_word: &AtomicU32, _all: bool, _shared: bool) {
    let _guard = LOCK.lock();
    CONDVAR.notify_all();
}
