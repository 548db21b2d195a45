//! Linux futex backend for completion signals
//!
//! Waits sleep on the signal word itself. Named signals live in a shared
//! mapping, so they use the non-private futex ops; anonymous signals use
//! `FUTEX_PRIVATE_FLAG`.

use super::WaitOutcome;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Sleep while `*word == expected`, at most `timeout`.
pub(super) fn wait_word(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<Duration>,
    shared: bool,
) -> WaitOutcome {
    let timespec = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let timespec_ptr = match &timespec {
        Some(ts) => ts as *const libc::timespec,
        None => std::ptr::null(),
    };
    let op = if shared {
        libc::FUTEX_WAIT
    } else {
        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG
    };

    // Safety: `word` is a live, aligned u32 for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op,
            expected,
            timespec_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == 0 {
        return WaitOutcome::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ETIMEDOUT) => WaitOutcome::TimedOut,
        Some(libc::EINTR) => WaitOutcome::Interrupted,
        // EAGAIN: word already changed
        _ => WaitOutcome::Woken,
    }
}

/// Wake one or all sleepers on `word`.
pub(super) fn wake_word(word: &AtomicU32, all: bool, shared: bool) {
    let op = if shared {
        libc::FUTEX_WAKE
    } else {
        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG
    };
    let count: i32 = if all { i32::MAX } else { 1 };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}
