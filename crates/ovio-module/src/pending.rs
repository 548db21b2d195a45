//! `PendingOperation`: one in-flight non-blocking call.
//!
//! An operation is a closure that performs a non-blocking system call on a
//! descriptor. [`PendingOperation::initiate`] runs it once on the caller's
//! thread:
//!
//! - it finishes immediately: the operation is `Complete` on return;
//! - it would block: the descriptor is handed to the [`Reactor`], the
//!   operation stays `Pending`, and the reactor thread retries the call
//!   when the descriptor becomes ready;
//! - it fails: the error is returned from `initiate` itself.
//!
//! Completion-time failures are reported through [`PendingOperation::status`]
//! and [`PendingOperation::error`]. Completion is observed at most once:
//! the first terminal transition wins and every later one is ignored.
//!
//! The operation never owns the channel it works on. The reactor watches a
//! duplicate of the descriptor, so closing the channel does not invalidate
//! the registration; channels sever their outstanding operations on close.

use crate::reactor::Reactor;

use ovio_core::error::{OvioError, Result};
use ovio_core::signal::CompletionSignal;
use ovio_core::state::OpStatus;

use parking_lot::Mutex;
use std::os::unix::io::BorrowedFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Readiness an operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub bytes: usize,
    /// The message did not fit; more data remains for a following read.
    pub partial: bool,
}

impl Transfer {
    #[inline]
    pub const fn bytes(bytes: usize) -> Self {
        Transfer { bytes, partial: false }
    }
}

/// Result of one attempt of an operation's system call.
#[derive(Debug)]
pub enum IoPoll {
    /// Would block; retry once the descriptor reports this readiness.
    Pending(Interest),
    Ready(Result<Transfer>),
}

struct OpState {
    status: OpStatus,
    bytes: usize,
    partial: bool,
    error: Option<OvioError>,
    /// Reactor registration key while queued
    key: Option<u64>,
    cancel_requested: bool,
}

/// State shared between an operation handle and the reactor.
pub(crate) struct OpShared {
    signal: CompletionSignal,
    state: Mutex<OpState>,
}

impl OpShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            signal: CompletionSignal::manual(),
            state: Mutex::new(OpState {
                status: OpStatus::Pending,
                bytes: 0,
                partial: false,
                error: None,
                key: None,
                cancel_requested: false,
            }),
        })
    }

    /// Move to a terminal state. Returns false if already terminal.
    pub(crate) fn complete(&self, outcome: Result<Transfer>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            match outcome {
                Ok(transfer) => {
                    state.status = OpStatus::Complete;
                    state.bytes = transfer.bytes;
                    state.partial = transfer.partial;
                }
                Err(err) => {
                    state.status = OpStatus::Error;
                    state.error = Some(err);
                }
            }
            state.key = None;
        }
        let _ = self.signal.signal();
        true
    }

    pub(crate) fn set_key(&self, key: u64) {
        self.state.lock().key = Some(key);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.lock().status.is_terminal()
    }
}

/// Handle to an issued asynchronous call. Clones observe the same call.
#[derive(Clone)]
pub struct PendingOperation {
    shared: Arc<OpShared>,
    reactor: Option<Weak<Reactor>>,
}

impl PendingOperation {
    /// Issue `io` against `fd`.
    ///
    /// "Would block" is not an error: the call is queued on `reactor` and
    /// the returned operation is `Pending`. Any other failure is returned
    /// here and the operation is discarded.
    pub fn initiate<F>(reactor: &Arc<Reactor>, fd: BorrowedFd<'_>, mut io: F) -> Result<Self>
    where
        F: FnMut(BorrowedFd<'_>) -> IoPoll + Send + 'static,
    {
        let shared = OpShared::new();
        match io(fd) {
            IoPoll::Ready(Ok(transfer)) => {
                shared.complete(Ok(transfer));
                Ok(Self { shared, reactor: None })
            }
            IoPoll::Ready(Err(err)) => {
                shared.complete(Err(err.clone()));
                Err(err)
            }
            IoPoll::Pending(interest) => {
                let watched = fd
                    .try_clone_to_owned()
                    .map_err(|e| OvioError::from_errno("dup", e.raw_os_error().unwrap_or(libc::EBADF)))?;
                if let Err(err) = reactor.register(Arc::clone(&shared), watched, interest, Box::new(io)) {
                    shared.complete(Err(err.clone()));
                    return Err(err);
                }
                Ok(Self { shared, reactor: Some(Arc::downgrade(reactor)) })
            }
        }
    }

    /// An operation that already finished without touching the reactor.
    pub(crate) fn completed(outcome: Result<Transfer>) -> Self {
        let shared = OpShared::new();
        shared.complete(outcome);
        Self { shared, reactor: None }
    }

    /// Block until complete or `timeout` elapses. `None` waits forever.
    ///
    /// Returns `Ok(true)` once the operation is terminal, whether it
    /// succeeded or failed; inspect [`status`](Self::status) afterwards.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<bool> {
        self.shared.signal.wait(timeout, false)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.shared.is_terminal()
    }

    pub fn status(&self) -> OpStatus {
        self.shared.state.lock().status
    }

    /// Bytes moved by the call; zero until `Complete`.
    pub fn bytes_transferred(&self) -> usize {
        self.shared.state.lock().bytes
    }

    /// The message was larger than the buffer; the rest awaits the next read.
    pub fn is_partial(&self) -> bool {
        self.shared.state.lock().partial
    }

    /// Completion-time failure, if the operation ended in `Error`.
    pub fn error(&self) -> Option<OvioError> {
        self.shared.state.lock().error.clone()
    }

    /// Convert the terminal state into a `Result`.
    pub fn result(&self) -> Result<usize> {
        let state = self.shared.state.lock();
        match state.status {
            OpStatus::Complete => Ok(state.bytes),
            OpStatus::Error => Err(state.error.clone().unwrap_or(OvioError::Aborted)),
            OpStatus::Pending => Err(OvioError::invalid_state("operation still pending")),
        }
    }

    /// The signal set on completion, for callers multiplexing waits.
    pub fn signal(&self) -> &CompletionSignal {
        &self.shared.signal
    }

    /// Request cancellation.
    ///
    /// If the call is still queued it completes with `Aborted`. If the
    /// reactor is already running it, the call finishes normally.
    pub fn cancel(&self) {
        let key = {
            let mut state = self.shared.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.cancel_requested = true;
            state.key
        };
        match (self.reactor.as_ref().and_then(Weak::upgrade), key) {
            (Some(reactor), Some(key)) => reactor.cancel(key),
            _ => {
                self.shared.complete(Err(OvioError::Aborted));
            }
        }
    }
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PendingOperation")
            .field("status", &state.status)
            .field("bytes", &state.bytes)
            .field("partial", &state.partial)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd};

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn recv_op(fd: BorrowedFd<'_>) -> IoPoll {
        let mut buf = [0u8; 64];
        let n = unsafe {
            libc::recv(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if n >= 0 {
            return IoPoll::Ready(Ok(Transfer::bytes(n as usize)));
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => IoPoll::Pending(Interest::Readable),
            Some(e) => IoPoll::Ready(Err(OvioError::from_errno("recv", e))),
            None => IoPoll::Ready(Err(OvioError::Aborted)),
        }
    }

    #[test]
    fn test_immediate_completion() {
        let reactor = Arc::new(Reactor::start(ReactorConfig::from_env()).unwrap());
        let (a, b) = socket_pair();
        unsafe { libc::send(b.as_raw_fd(), b"hey".as_ptr() as *const libc::c_void, 3, 0) };

        let op = PendingOperation::initiate(&reactor, a.as_fd(), recv_op).unwrap();
        assert!(op.is_complete());
        assert_eq!(op.status(), OpStatus::Complete);
        assert_eq!(op.bytes_transferred(), 3);
        assert!(op.wait_for_completion(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_queued_then_completed_by_reactor() {
        let reactor = Arc::new(Reactor::start(ReactorConfig::from_env()).unwrap());
        let (a, b) = socket_pair();

        let op = PendingOperation::initiate(&reactor, a.as_fd(), recv_op).unwrap();
        assert_eq!(op.status(), OpStatus::Pending);
        assert!(!op.wait_for_completion(Some(Duration::ZERO)).unwrap());

        unsafe { libc::send(b.as_raw_fd(), b"hello".as_ptr() as *const libc::c_void, 5, 0) };
        assert!(op.wait_for_completion(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(op.bytes_transferred(), 5);
        assert_eq!(op.result().unwrap(), 5);
    }

    #[test]
    fn test_initiate_error_surfaces_immediately() {
        let reactor = Arc::new(Reactor::start(ReactorConfig::from_env()).unwrap());
        let (a, _b) = socket_pair();
        let err = PendingOperation::initiate(&reactor, a.as_fd(), |_fd: BorrowedFd<'_>| {
            IoPoll::Ready(Err(OvioError::from_errno("recv", libc::ECONNRESET)))
        })
        .unwrap_err();
        assert!(matches!(err, OvioError::BrokenChannel(_)));
    }

    #[test]
    fn test_cancel_queued() {
        let reactor = Arc::new(Reactor::start(ReactorConfig::from_env()).unwrap());
        let (a, _b) = socket_pair();
        let op = PendingOperation::initiate(&reactor, a.as_fd(), recv_op).unwrap();
        op.cancel();
        assert!(op.wait_for_completion(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(op.status(), OpStatus::Error);
        assert_eq!(op.error(), Some(OvioError::Aborted));
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let op = PendingOperation::completed(Ok(Transfer::bytes(4)));
        op.cancel();
        assert_eq!(op.status(), OpStatus::Complete);
        assert_eq!(op.bytes_transferred(), 4);
    }

    #[test]
    fn test_completion_observed_once() {
        let shared = OpShared::new();
        assert!(shared.complete(Ok(Transfer::bytes(1))));
        assert!(!shared.complete(Err(OvioError::Aborted)));
        let op = PendingOperation { shared, reactor: None };
        assert_eq!(op.status(), OpStatus::Complete);
    }
}
