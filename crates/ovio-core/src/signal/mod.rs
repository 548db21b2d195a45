//! Completion signal: a waitable boolean flag
//!
//! Every asynchronous result in ovio is observed through a
//! [`CompletionSignal`]. Two reset modes exist:
//!
//! - `Manual`: stays signaled until [`CompletionSignal::reset`]; every
//!   waiter is released.
//! - `Auto`: a successful wait clears the flag atomically, so exactly one
//!   waiter observes each `signal()`.
//!
//! Signal word semantics:
//! - 0 = not signaled
//! - 1 = signaled
//!
//! Named signals are shared across processes through a page under
//! `/dev/shm` (Linux only). Clones of a signal share the same flag, like
//! duplicated handles; [`CompletionSignal::close`] detaches only the clone
//! it is called on.

use crate::error::{OvioError, Result};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        mod shared;
        use futex_linux as platform;
        use shared::SharedMapping;
    } else {
        mod fallback;
        use fallback as platform;
    }
}

/// How a signal clears after releasing waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResetMode {
    Manual = 0,
    Auto = 1,
}

impl From<u32> for ResetMode {
    fn from(v: u32) -> Self {
        if v == ResetMode::Auto as u32 {
            ResetMode::Auto
        } else {
            ResetMode::Manual
        }
    }
}

/// Result of one platform-level sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Woken,
    TimedOut,
    Interrupted,
}

enum Storage {
    Local(AtomicU32),
    #[cfg(target_os = "linux")]
    Shared(SharedMapping),
}

struct SignalCore {
    storage: Storage,
    mode: ResetMode,
    name: Option<String>,
}

impl SignalCore {
    #[inline]
    fn word(&self) -> &AtomicU32 {
        match &self.storage {
            Storage::Local(word) => word,
            #[cfg(target_os = "linux")]
            Storage::Shared(mapping) => mapping.word(),
        }
    }

    #[inline]
    fn is_shared(&self) -> bool {
        !matches!(self.storage, Storage::Local(_))
    }

    /// Observe (and for auto-reset, consume) the signaled state.
    #[inline]
    fn try_acquire(&self) -> bool {
        let word = self.word();
        match self.mode {
            ResetMode::Manual => word.load(Ordering::Acquire) == 1,
            ResetMode::Auto => word
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }
}

/// Waitable notification object with manual or auto reset.
#[derive(Clone, Default)]
pub struct CompletionSignal {
    core: Option<Arc<SignalCore>>,
}

impl CompletionSignal {
    /// Create an anonymous signal.
    pub fn new(mode: ResetMode, initially_signaled: bool) -> Self {
        Self {
            core: Some(Arc::new(SignalCore {
                storage: Storage::Local(AtomicU32::new(initially_signaled as u32)),
                mode,
                name: None,
            })),
        }
    }

    /// Unsignaled manual-reset signal.
    pub fn manual() -> Self {
        Self::new(ResetMode::Manual, false)
    }

    /// Unsignaled auto-reset signal.
    pub fn auto() -> Self {
        Self::new(ResetMode::Auto, false)
    }

    /// Create a named signal visible to other processes, or attach to an
    /// existing one of the same name (whose reset mode then wins).
    #[cfg(target_os = "linux")]
    pub fn create_named(name: &str, mode: ResetMode, initially_signaled: bool) -> Result<Self> {
        let mapping = SharedMapping::create(name, mode, initially_signaled)?;
        let mode = mapping.mode();
        log::debug!("named signal {:?} created ({:?})", name, mode);
        Ok(Self::from_mapping(name, mapping, mode))
    }

    /// Attach to a named signal created elsewhere.
    #[cfg(target_os = "linux")]
    pub fn open_named(name: &str) -> Result<Self> {
        let mapping = SharedMapping::open(name)?;
        let mode = mapping.mode();
        Ok(Self::from_mapping(name, mapping, mode))
    }

    /// Delete the backing page of a named signal. Attached handles keep
    /// working; later `open_named` calls fail.
    #[cfg(target_os = "linux")]
    pub fn remove_named(name: &str) -> Result<()> {
        std::fs::remove_file(shared::shm_path(name)?)?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn from_mapping(name: &str, mapping: SharedMapping, mode: ResetMode) -> Self {
        Self {
            core: Some(Arc::new(SignalCore {
                storage: Storage::Shared(mapping),
                mode,
                name: Some(name.to_string()),
            })),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create_named(_name: &str, _mode: ResetMode, _initially_signaled: bool) -> Result<Self> {
        Err(OvioError::Unsupported("named signals need futex support".into()))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open_named(_name: &str) -> Result<Self> {
        Err(OvioError::Unsupported("named signals need futex support".into()))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn remove_named(_name: &str) -> Result<()> {
        Err(OvioError::Unsupported("named signals need futex support".into()))
    }

    #[inline]
    fn core(&self) -> Result<&SignalCore> {
        self.core
            .as_deref()
            .ok_or_else(|| OvioError::invalid_state("completion signal is not constructed"))
    }

    /// Set the signal, releasing all waiters (manual) or one (auto).
    pub fn signal(&self) -> Result<()> {
        let core = self.core()?;
        if core.word().swap(1, Ordering::AcqRel) == 0 {
            platform::wake_word(core.word(), core.mode == ResetMode::Manual, core.is_shared());
        }
        Ok(())
    }

    /// Clear the signal.
    pub fn reset(&self) -> Result<()> {
        self.core()?.word().store(0, Ordering::Release);
        Ok(())
    }

    /// Wait until signaled or `timeout` elapses.
    ///
    /// `None` waits forever and `Some(Duration::ZERO)` only polls. Returns
    /// `Ok(true)` when the signal was observed. An `alertable` wait
    /// interrupted by an OS signal returns `Ok(false)` early.
    pub fn wait(&self, timeout: Option<Duration>, alertable: bool) -> Result<bool> {
        let core = self.core()?;
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            if core.try_acquire() {
                return Ok(true);
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
            };

            match platform::wait_word(core.word(), 0, remaining, core.is_shared()) {
                WaitOutcome::Interrupted if alertable => return Ok(core.try_acquire()),
                _ => continue,
            }
        }
    }

    /// Current state without consuming it.
    pub fn is_signaled(&self) -> Result<bool> {
        Ok(self.core()?.word().load(Ordering::Acquire) == 1)
    }

    /// Whether this handle refers to a live signal.
    #[inline]
    pub fn is_constructed(&self) -> bool {
        self.core.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.core.as_ref().and_then(|c| c.name.as_deref())
    }

    pub fn reset_mode(&self) -> Option<ResetMode> {
        self.core.as_ref().map(|c| c.mode)
    }

    /// Detach this handle. Other clones are unaffected.
    pub fn close(&mut self) {
        self.core = None;
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.core {
            None => write!(f, "CompletionSignal(closed)"),
            Some(core) => f
                .debug_struct("CompletionSignal")
                .field("mode", &core.mode)
                .field("name", &core.name)
                .field("signaled", &(core.word().load(Ordering::Relaxed) == 1))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_poll_then_signal() {
        let sig = CompletionSignal::manual();
        assert!(!sig.wait(Some(Duration::ZERO), false).unwrap());
        sig.signal().unwrap();
        assert!(sig.wait(Some(Duration::ZERO), false).unwrap());
        // Manual reset stays signaled
        assert!(sig.wait(Some(Duration::ZERO), false).unwrap());
        sig.reset().unwrap();
        assert!(!sig.wait(Some(Duration::ZERO), false).unwrap());
    }

    #[test]
    fn test_auto_reset_consumes() {
        let sig = CompletionSignal::auto();
        sig.signal().unwrap();
        assert!(sig.wait(Some(Duration::ZERO), false).unwrap());
        assert!(!sig.wait(Some(Duration::ZERO), false).unwrap());
    }

    #[test]
    fn test_initially_signaled() {
        let sig = CompletionSignal::new(ResetMode::Manual, true);
        assert!(sig.is_signaled().unwrap());
    }

    #[test]
    fn test_unconstructed_is_invalid_state() {
        let sig = CompletionSignal::default();
        assert!(!sig.is_constructed());
        assert!(matches!(sig.wait(Some(Duration::ZERO), false), Err(OvioError::InvalidState(_))));
        assert!(matches!(sig.signal(), Err(OvioError::InvalidState(_))));

        let mut closed = CompletionSignal::manual();
        let other = closed.clone();
        closed.close();
        assert!(matches!(closed.reset(), Err(OvioError::InvalidState(_))));
        assert!(other.signal().is_ok());
    }

    #[test]
    fn test_timeout_elapses() {
        let sig = CompletionSignal::manual();
        let start = Instant::now();
        assert!(!sig.wait(Some(Duration::from_millis(30)), false).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cross_thread_wake() {
        let sig = CompletionSignal::manual();
        let remote = sig.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.signal().unwrap();
        });
        assert!(sig.wait(Some(Duration::from_secs(5)), false).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_manual_releases_all_waiters() {
        let sig = CompletionSignal::manual();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let s = sig.clone();
                thread::spawn(move || s.wait(Some(Duration::from_secs(5)), false).unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sig.signal().unwrap();
        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn test_auto_releases_exactly_one() {
        let sig = CompletionSignal::auto();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let s = sig.clone();
                thread::spawn(move || s.wait(Some(Duration::from_millis(300)), false).unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sig.signal().unwrap();
        let released = waiters.into_iter().map(|w| w.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(released, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_named_signal_shared_between_handles() {
        let name = format!("test-{}", std::process::id());
        let created = CompletionSignal::create_named(&name, ResetMode::Manual, false).unwrap();
        let opened = CompletionSignal::open_named(&name).unwrap();
        assert_eq!(opened.reset_mode(), Some(ResetMode::Manual));
        assert_eq!(opened.name(), Some(name.as_str()));

        created.signal().unwrap();
        assert!(opened.wait(Some(Duration::from_secs(1)), false).unwrap());

        CompletionSignal::remove_named(&name).unwrap();
        assert!(CompletionSignal::open_named(&name).is_err());
    }

    #[test]
    fn test_named_rejects_bad_names() {
        assert!(CompletionSignal::create_named("a/b", ResetMode::Auto, false).is_err());
        assert!(CompletionSignal::open_named("").is_err());
    }
}
