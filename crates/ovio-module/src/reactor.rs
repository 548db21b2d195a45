//! # Reactor - the epoll completion engine
//!
//! The reactor runs on a dedicated OS thread. It:
//! 1. Sleeps in `epoll_wait` on every queued operation's descriptor
//! 2. On readiness, removes the registration and retries its call
//! 3. Re-arms the registration if the call would still block
//! 4. Otherwise completes the `PendingOperation`, which signals waiters
//!
//! Registrations are one-shot and made on a duplicate of the caller's
//! descriptor, one per operation, so a read and a write outstanding on the
//! same channel never share an epoll entry.
//!
//! An eventfd (`EventFdNotifier`) wakes the thread for shutdown.

use crate::config::ReactorConfig;
use crate::eventfd_notifier::EventFdNotifier;
use crate::pending::{Interest, IoPoll, OpShared};

use ovio_core::error::{OvioError, Result};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

/// epoll data value reserved for the wakeup eventfd.
const WAKE_KEY: u64 = 0;

fn interest_events(interest: Interest) -> u32 {
    let events = match interest {
        Interest::Readable => libc::EPOLLIN | libc::EPOLLRDHUP,
        Interest::Writable => libc::EPOLLOUT,
    };
    (events | libc::EPOLLONESHOT) as u32
}

pub(crate) type IoFn = Box<dyn FnMut(BorrowedFd<'_>) -> IoPoll + Send>;

/// One queued operation.
struct Registration {
    op: Arc<OpShared>,
    /// Duplicate descriptor watched by epoll
    fd: OwnedFd,
    io: IoFn,
}

/// Shared state between the reactor thread and operation handles.
pub(crate) struct ReactorShared {
    epfd: OwnedFd,
    notifier: EventFdNotifier,
    registrations: Mutex<HashMap<u64, Registration>>,
    next_key: AtomicU64,
    shutdown: AtomicBool,
    max_events: usize,
}

impl ReactorShared {
    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> Result<()> {
        let mut event = libc::epoll_event { events, u64: key };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(OvioError::last_os_error("epoll_ctl"));
        }
        Ok(())
    }

    /// Retry the call behind `key` after a readiness event.
    fn dispatch(&self, key: u64) {
        let Some(mut reg) = self.registrations.lock().remove(&key) else {
            // Cancelled between the event and now
            return;
        };

        let poll = if reg.op.cancel_requested() {
            IoPoll::Ready(Err(OvioError::Aborted))
        } else {
            (reg.io)(reg.fd.as_fd())
        };

        match poll {
            IoPoll::Pending(interest) => {
                let raw = reg.fd.as_raw_fd();
                let op = Arc::clone(&reg.op);
                self.registrations.lock().insert(key, reg);
                // cancel() finds nothing while the call runs outside the table
                if op.cancel_requested() {
                    if let Some(reg) = self.registrations.lock().remove(&key) {
                        self.retire(reg, Err(OvioError::Aborted));
                    }
                    return;
                }
                if let Err(err) = self.ctl(libc::EPOLL_CTL_MOD, raw, interest_events(interest), key) {
                    if let Some(reg) = self.registrations.lock().remove(&key) {
                        self.retire(reg, Err(err));
                    }
                }
            }
            IoPoll::Ready(result) => self.retire(reg, result),
        }
    }

    /// Drop the epoll entry and the duplicate fd, then complete the op.
    fn retire(&self, reg: Registration, result: Result<crate::pending::Transfer>) {
        let Registration { op, fd, io } = reg;
        // Must precede close: the entry outlives a dup while the original is open.
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd.as_raw_fd(), 0, 0);
        drop(io);
        drop(fd);
        op.complete(result);
    }

    fn abort_all(&self) {
        let drained: Vec<Registration> = self.registrations.lock().drain().map(|(_, r)| r).collect();
        if !drained.is_empty() {
            log::debug!("reactor: aborting {} queued operations", drained.len());
        }
        for reg in drained {
            self.retire(reg, Err(OvioError::Aborted));
        }
    }
}

/// Handle to a running reactor thread. Dropping it stops the thread and
/// aborts every queued operation.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Option<thread::JoinHandle<()>>,
}

static GLOBAL: OnceLock<Arc<Reactor>> = OnceLock::new();

impl Reactor {
    /// Create and start a reactor.
    pub fn start(config: ReactorConfig) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(OvioError::last_os_error("epoll_create1"));
        }
        // Safety: fresh descriptor owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };

        let shared = Arc::new(ReactorShared {
            epfd,
            notifier: EventFdNotifier::create()?,
            registrations: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(WAKE_KEY + 1),
            shutdown: AtomicBool::new(false),
            max_events: config.max_events.max(1),
        });
        // Level-triggered and never one-shot: the wake entry stays armed.
        shared.ctl(
            libc::EPOLL_CTL_ADD,
            shared.notifier.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKE_KEY,
        )?;

        let shared_clone = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("ovio-reactor".into())
            .spawn(move || reactor_loop(shared_clone))?;

        log::debug!("reactor started (batch {})", shared.max_events);
        Ok(Self { shared, thread: Some(thread) })
    }

    /// The process-wide reactor, started on first use.
    pub fn global() -> Result<Arc<Reactor>> {
        if let Some(reactor) = GLOBAL.get() {
            return Ok(Arc::clone(reactor));
        }
        let started = Arc::new(Reactor::start(ReactorConfig::from_env())?);
        // A racing starter may win; the loser's thread stops on drop.
        Ok(Arc::clone(GLOBAL.get_or_init(|| started)))
    }

    /// Queue `op` until `fd` reports `interest`.
    pub(crate) fn register(
        &self,
        op: Arc<OpShared>,
        fd: OwnedFd,
        interest: Interest,
        io: IoFn,
    ) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(OvioError::invalid_state("reactor is shut down"));
        }
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let raw = fd.as_raw_fd();
        op.set_key(key);
        self.shared
            .registrations
            .lock()
            .insert(key, Registration { op, fd, io });

        if let Err(err) = self.shared.ctl(libc::EPOLL_CTL_ADD, raw, interest_events(interest), key) {
            // Hand the op back to the caller untouched by the reactor
            self.shared.registrations.lock().remove(&key);
            return Err(err);
        }
        Ok(())
    }

    /// Abort the operation behind `key` if it is still queued.
    pub(crate) fn cancel(&self, key: u64) {
        let reg = self.shared.registrations.lock().remove(&key);
        if let Some(reg) = reg {
            self.shared.retire(reg, Err(OvioError::Aborted));
        }
    }

    /// Number of operations waiting for readiness.
    pub fn queued(&self) -> usize {
        self.shared.registrations.lock().len()
    }

    /// Stop the reactor thread and abort queued operations.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.shared.notifier.notify() {
            log::warn!("reactor: wakeup failed during shutdown: {}", err);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.shared.abort_all();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reactor thread main loop.
fn reactor_loop(shared: Arc<ReactorShared>) {
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; shared.max_events];

    while !shared.shutdown.load(Ordering::Acquire) {
        let n = unsafe {
            libc::epoll_wait(
                shared.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                -1,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::error!("reactor: epoll_wait failed: {}", err);
            break;
        }

        for event in &events[..n as usize] {
            let key = event.u64;
            if key == WAKE_KEY {
                shared.notifier.drain();
                continue;
            }
            shared.dispatch(key);
        }
    }

    shared.abort_all();
    log::debug!("reactor stopped");
}
