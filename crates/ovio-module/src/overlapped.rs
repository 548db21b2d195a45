//! `OverlappedIo`: a pending operation that owns its byte buffer.
//!
//! Reads allocate the buffer up front and shrink it to the number of bytes
//! actually received once the call completes. Writes keep their own copy of
//! the message, so the caller's slice is free as soon as the call returns.

use crate::pending::{IoPoll, PendingOperation, Transfer};
use crate::reactor::Reactor;

use ovio_core::error::{OvioError, Result};
use ovio_core::signal::CompletionSignal;
use ovio_core::state::OpStatus;

use parking_lot::Mutex;
use std::os::unix::io::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OverlappedIo {
    op: PendingOperation,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl OverlappedIo {
    /// Issue `io` with exclusive access to `buffer` on every attempt.
    ///
    /// The closure reports how many bytes it moved; on success the buffer
    /// is truncated to that length.
    pub fn initiate<F>(
        reactor: &Arc<Reactor>,
        fd: BorrowedFd<'_>,
        buffer: Vec<u8>,
        mut io: F,
    ) -> Result<Self>
    where
        F: FnMut(BorrowedFd<'_>, &mut Vec<u8>) -> IoPoll + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(buffer));
        let shared = Arc::clone(&buffer);
        let op = PendingOperation::initiate(reactor, fd, move |fd| {
            let mut buf = shared.lock();
            let poll = io(fd, &mut buf);
            if let IoPoll::Ready(Ok(transfer)) = &poll {
                buf.truncate(transfer.bytes);
            }
            poll
        })?;
        Ok(Self { op, buffer })
    }

    /// Already finished, e.g. served from data buffered by the channel.
    pub(crate) fn completed(data: Vec<u8>, partial: bool) -> Self {
        let transfer = Transfer { bytes: data.len(), partial };
        Self {
            op: PendingOperation::completed(Ok(transfer)),
            buffer: Arc::new(Mutex::new(data)),
        }
    }

    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<bool> {
        self.op.wait_for_completion(timeout)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.op.is_complete()
    }

    pub fn status(&self) -> OpStatus {
        self.op.status()
    }

    pub fn bytes_transferred(&self) -> usize {
        self.op.bytes_transferred()
    }

    pub fn is_partial(&self) -> bool {
        self.op.is_partial()
    }

    pub fn error(&self) -> Option<OvioError> {
        self.op.error()
    }

    pub fn cancel(&self) {
        self.op.cancel()
    }

    pub fn signal(&self) -> &CompletionSignal {
        self.op.signal()
    }

    pub fn operation(&self) -> &PendingOperation {
        &self.op
    }

    /// Copy of the buffer. Empty until the operation completes successfully.
    pub fn data(&self) -> Vec<u8> {
        if self.op.status() != OpStatus::Complete {
            return Vec::new();
        }
        self.buffer.lock().clone()
    }

    /// Take the buffer, failing if the operation did not complete successfully.
    pub fn into_data(self) -> Result<Vec<u8>> {
        self.op.result()?;
        let mut buf = self.buffer.lock();
        Ok(std::mem::take(&mut *buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use crate::pending::Interest;
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

    fn recv_into(fd: BorrowedFd<'_>, buf: &mut Vec<u8>) -> IoPoll {
        let n = unsafe {
            libc::recv(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if n >= 0 {
            IoPoll::Ready(Ok(Transfer::bytes(n as usize)))
        } else {
            IoPoll::Pending(Interest::Readable)
        }
    }

    #[test]
    fn test_read_buffer_truncated_to_bytes() {
        let reactor = Arc::new(Reactor::start(ReactorConfig::from_env()).unwrap());
        let (a, b) = socket_pair();

        let io = OverlappedIo::initiate(&reactor, a.as_fd(), vec![0u8; 128], recv_into).unwrap();
        assert!(io.data().is_empty());

        unsafe { libc::send(b.as_raw_fd(), b"payload".as_ptr() as *const libc::c_void, 7, 0) };
        assert!(io.wait_for_completion(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(io.bytes_transferred(), 7);
        assert_eq!(io.data(), b"payload");
        assert_eq!(io.into_data().unwrap(), b"payload");
    }

    #[test]
    fn test_into_data_after_cancel_fails() {
        let reactor = Arc::new(Reactor::start(ReactorConfig::from_env()).unwrap());
        let (a, _b) = socket_pair();
        let io = OverlappedIo::initiate(&reactor, a.as_fd(), vec![0u8; 16], recv_into).unwrap();
        io.cancel();
        assert!(io.wait_for_completion(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(io.into_data().unwrap_err(), OvioError::Aborted);
    }

    #[test]
    fn test_completed_partial() {
        let io = OverlappedIo::completed(b"abc".to_vec(), true);
        assert!(io.is_complete());
        assert!(io.is_partial());
        assert_eq!(io.data(), b"abc");
    }
}
