//! I/O strategies: how a pipe end performs connect, read and write.
//!
//! # Implementors
//!
//! - [`Blocking`]: every call runs to completion on the caller's thread
//! - [`Overlapped`]: every call returns at once with a handle that the
//!   reactor completes

use super::channel::ChannelCore;
use super::sys;

use crate::overlapped::OverlappedIo;
use crate::pending::{Interest, IoPoll, PendingOperation, Transfer};
use crate::reactor::Reactor;

use ovio_core::error::{OvioError, Result};
use ovio_core::state::ChannelState;

use nix::errno::Errno;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::sync::Arc;

/// Poll interval of a blocking connect, so `disconnect()` from another
/// thread is noticed.
const CONNECT_POLL_MS: libc::c_int = 100;

mod private {
    pub trait Sealed {}
    impl Sealed for super::Blocking {}
    impl Sealed for super::Overlapped {}
}

/// Selects blocking or overlapped behaviour for a pipe end.
///
/// **Contract:** operations never hold the channel lock across a system
/// call that can block.
pub trait IoStrategy: private::Sealed + Send + Sync + 'static {
    type Connect;
    type Read;
    type Write;

    /// Sockets are opened with `O_NONBLOCK`.
    const NONBLOCKING: bool;

    /// Reactor used by this strategy, if any.
    fn reactor() -> Result<Option<Arc<Reactor>>>;

    /// Accept one client from `listener`.
    fn accept(chan: &ChannelCore, listener: BorrowedFd<'_>) -> Result<Self::Connect>;

    fn read(chan: &ChannelCore, max_len: usize) -> Result<Self::Read>;

    fn write(chan: &ChannelCore, message: &[u8]) -> Result<Self::Write>;
}

fn errno(context: &str, e: Errno) -> OvioError {
    OvioError::from_errno(context, e as i32)
}

/// Calls run to completion on the caller's thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blocking;

impl IoStrategy for Blocking {
    type Connect = ();
    type Read = Vec<u8>;
    type Write = usize;

    const NONBLOCKING: bool = false;

    fn reactor() -> Result<Option<Arc<Reactor>>> {
        Ok(None)
    }

    fn accept(chan: &ChannelCore, listener: BorrowedFd<'_>) -> Result<()> {
        loop {
            match chan.state() {
                ChannelState::Listening => {}
                _ => return Err(OvioError::Aborted),
            }
            if !sys::wait_readable(listener, CONNECT_POLL_MS).map_err(|e| errno("poll", e))? {
                continue;
            }
            match sys::accept(listener, false) {
                Ok(conn) => return ChannelCore::attach(chan.inner(), conn, chan.buffer_size),
                // Another instance took it
                Err(Errno::EAGAIN | Errno::EINTR | Errno::ECONNABORTED) => continue,
                Err(e) => return Err(errno("accept", e)),
            }
        }
    }

    /// Returns the whole next message; the buffer grows past `max_len`
    /// to the message's length.
    fn read(chan: &ChannelCore, max_len: usize) -> Result<Vec<u8>> {
        if let Some((data, _)) = chan.take_remainder(usize::MAX) {
            return Ok(data);
        }
        let conn = chan.connection()?;
        let fd = conn.as_fd();

        let len = loop {
            match sys::peek_len(fd, false) {
                Ok(0) if chan.state() != ChannelState::Connected => return Err(OvioError::Aborted),
                Ok(0) => {
                    return Err(OvioError::BrokenChannel(format!("{}: peer closed", chan.label)))
                }
                Ok(len) => break len,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errno("recv", e)),
            }
        };

        if len > chan.max_message {
            sys::discard(fd, false).map_err(|e| errno("recv", e))?;
            return Err(OvioError::Capacity(format!(
                "{}: discarded message of {} bytes (limit {})",
                chan.label, len, chan.max_message
            )));
        }

        let mut buf = vec![0u8; len];
        if len > max_len {
            log::trace!("{}: read buffer grown from {} to {}", chan.label, max_len, len);
        }
        let n = loop {
            match sys::recv(fd, &mut buf, false) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errno("recv", e)),
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn write(chan: &ChannelCore, message: &[u8]) -> Result<usize> {
        chan.check_message(message)?;
        let conn = chan.connection()?;
        loop {
            match sys::send(conn.as_fd(), message, false) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errno("send", e)),
            }
        }
    }
}

/// Calls return immediately; the reactor completes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overlapped;

impl IoStrategy for Overlapped {
    type Connect = PendingOperation;
    type Read = OverlappedIo;
    type Write = OverlappedIo;

    const NONBLOCKING: bool = true;

    fn reactor() -> Result<Option<Arc<Reactor>>> {
        Reactor::global().map(Some)
    }

    fn accept(chan: &ChannelCore, listener: BorrowedFd<'_>) -> Result<PendingOperation> {
        let inner = chan.weak_inner();
        let buffer_size = chan.buffer_size;
        let op = PendingOperation::initiate(chan.reactor()?, listener, move |fd| {
            match sys::accept(fd, true) {
                Ok(conn) => {
                    let Some(inner) = inner.upgrade() else {
                        return IoPoll::Ready(Err(OvioError::Aborted));
                    };
                    IoPoll::Ready(ChannelCore::attach(&inner, conn, buffer_size).map(|()| Transfer::default()))
                }
                Err(Errno::EAGAIN | Errno::EINTR | Errno::ECONNABORTED) => IoPoll::Pending(Interest::Readable),
                Err(e) => IoPoll::Ready(Err(errno("accept", e))),
            }
        })?;
        chan.track(&op);
        Ok(op)
    }

    /// Completes with at most `max_len` bytes. A longer message completes
    /// partial and its tail is served by the following reads.
    fn read(chan: &ChannelCore, max_len: usize) -> Result<OverlappedIo> {
        if max_len == 0 {
            return Err(OvioError::validation(format!("{}: zero-length read", chan.label)));
        }
        if let Some((data, more)) = chan.take_remainder(max_len) {
            return Ok(OverlappedIo::completed(data, more));
        }
        let conn = chan.connection()?;
        let inner = chan.weak_inner();
        let max_message = chan.max_message;
        let label = chan.label.clone();

        let io = OverlappedIo::initiate(
            chan.reactor()?,
            conn.as_fd(),
            Vec::with_capacity(max_len),
            move |fd, buf| {
                let len = match sys::peek_len(fd, true) {
                    Ok(0) => {
                        return IoPoll::Ready(Err(OvioError::BrokenChannel(format!("{}: peer closed", label))))
                    }
                    Ok(len) => len,
                    Err(Errno::EAGAIN | Errno::EINTR) => return IoPoll::Pending(Interest::Readable),
                    Err(e) => return IoPoll::Ready(Err(errno("recv", e))),
                };
                if len > max_message {
                    let _ = sys::discard(fd, true);
                    return IoPoll::Ready(Err(OvioError::Capacity(format!(
                        "{}: discarded message of {} bytes (limit {})",
                        label, len, max_message
                    ))));
                }

                let mut whole = vec![0u8; len];
                let n = match sys::recv(fd, &mut whole, true) {
                    Ok(n) => n,
                    Err(Errno::EAGAIN | Errno::EINTR) => return IoPoll::Pending(Interest::Readable),
                    Err(e) => return IoPoll::Ready(Err(errno("recv", e))),
                };
                whole.truncate(n);

                let partial = n > max_len;
                if partial {
                    let tail = whole.split_off(max_len);
                    match inner.upgrade() {
                        Some(inner) => ChannelCore::stash_remainder(&inner, tail),
                        None => return IoPoll::Ready(Err(OvioError::Aborted)),
                    }
                }
                let bytes = whole.len();
                *buf = whole;
                IoPoll::Ready(Ok(Transfer { bytes, partial }))
            },
        )?;
        chan.track(io.operation());
        Ok(io)
    }

    fn write(chan: &ChannelCore, message: &[u8]) -> Result<OverlappedIo> {
        chan.check_message(message)?;
        let conn = chan.connection()?;
        let io = OverlappedIo::initiate(chan.reactor()?, conn.as_fd(), message.to_vec(), |fd, buf| {
            match sys::send(fd, buf, true) {
                Ok(n) => IoPoll::Ready(Ok(Transfer::bytes(n))),
                Err(Errno::EAGAIN | Errno::EINTR) => IoPoll::Pending(Interest::Writable),
                Err(e) => IoPoll::Ready(Err(errno("send", e))),
            }
        })?;
        chan.track(io.operation());
        Ok(io)
    }
}
