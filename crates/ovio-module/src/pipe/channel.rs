//! State shared by both ends of a pipe connection.

use super::sys;

use crate::pending::PendingOperation;
use crate::reactor::Reactor;

use ovio_core::error::{OvioError, Result};
use ovio_core::state::ChannelState;

use parking_lot::Mutex;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::{Arc, Weak};

pub(crate) struct ChannelInner {
    pub(crate) state: ChannelState,
    pub(crate) conn: Option<Arc<OwnedFd>>,
    /// Tail of a message that did not fit the last overlapped read
    pub(crate) remainder: Option<Vec<u8>>,
}

/// One end of a connection: its socket, its state, and the operations
/// still in flight on it.
#[doc(hidden)]
pub struct ChannelCore {
    inner: Arc<Mutex<ChannelInner>>,
    ops: Mutex<Vec<PendingOperation>>,
    reactor: Option<Arc<Reactor>>,
    pub(crate) max_message: usize,
    pub(crate) buffer_size: usize,
    pub(crate) label: String,
}

impl ChannelCore {
    pub(crate) fn new(
        label: String,
        reactor: Option<Arc<Reactor>>,
        max_message: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelInner {
                state: ChannelState::Disconnected,
                conn: None,
                remainder: None,
            })),
            ops: Mutex::new(Vec::new()),
            reactor,
            max_message,
            buffer_size,
            label,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.inner.lock().state = state;
    }

    /// Reactor queuing this channel's operations. Only overlapped channels have one.
    pub(crate) fn reactor(&self) -> Result<&Arc<Reactor>> {
        self.reactor
            .as_ref()
            .ok_or_else(|| OvioError::invalid_state(format!("{}: no reactor", self.label)))
    }

    pub(crate) fn weak_inner(&self) -> Weak<Mutex<ChannelInner>> {
        Arc::downgrade(&self.inner)
    }

    /// The connected socket, or `InvalidState`.
    pub(crate) fn connection(&self) -> Result<Arc<OwnedFd>> {
        let inner = self.inner.lock();
        match (&inner.conn, inner.state) {
            (Some(fd), ChannelState::Connected) => Ok(Arc::clone(fd)),
            (_, state) => Err(OvioError::invalid_state(format!("{} is {}", self.label, state))),
        }
    }

    /// Install a connected socket, unless the channel was closed meanwhile.
    pub(crate) fn attach(inner: &Mutex<ChannelInner>, conn: OwnedFd, buffer_size: usize) -> Result<()> {
        if let Err(e) = sys::ensure_buffer_size(conn.as_fd(), buffer_size) {
            log::debug!("pipe: could not raise socket buffers to {}: {}", buffer_size, e);
        }
        let mut inner = inner.lock();
        match inner.state {
            ChannelState::Closed | ChannelState::Disconnected => Err(OvioError::Aborted),
            _ => {
                inner.conn = Some(Arc::new(conn));
                inner.state = ChannelState::Connected;
                inner.remainder = None;
                Ok(())
            }
        }
    }

    /// Start out connected on `conn`.
    pub(crate) fn adopt(&self, conn: OwnedFd) -> Result<()> {
        self.set_state(ChannelState::Listening);
        Self::attach(&self.inner, conn, self.buffer_size)
    }

    pub(crate) fn inner(&self) -> &Mutex<ChannelInner> {
        &self.inner
    }

    /// Take up to `max_len` bytes of the buffered remainder.
    ///
    /// Returns the bytes and whether more are still buffered.
    pub(crate) fn take_remainder(&self, max_len: usize) -> Option<(Vec<u8>, bool)> {
        let mut inner = self.inner.lock();
        let mut data = inner.remainder.take()?;
        if data.len() > max_len {
            let rest = data.split_off(max_len);
            inner.remainder = Some(rest);
            Some((data, true))
        } else {
            Some((data, false))
        }
    }

    pub(crate) fn stash_remainder(inner: &Mutex<ChannelInner>, tail: Vec<u8>) {
        if !tail.is_empty() {
            inner.lock().remainder = Some(tail);
        }
    }

    pub(crate) fn remainder_len(&self) -> usize {
        self.inner.lock().remainder.as_ref().map_or(0, Vec::len)
    }

    /// Remember an in-flight operation so it can be severed.
    pub(crate) fn track(&self, op: &PendingOperation) {
        if op.is_complete() {
            return;
        }
        let mut ops = self.ops.lock();
        ops.retain(|op| !op.is_complete());
        ops.push(op.clone());
    }

    /// Validate an outgoing message.
    pub(crate) fn check_message(&self, message: &[u8]) -> Result<()> {
        if message.is_empty() {
            return Err(OvioError::validation(format!("{}: empty message", self.label)));
        }
        if message.len() > self.max_message {
            return Err(OvioError::Capacity(format!(
                "{}: message of {} bytes exceeds limit of {}",
                self.label,
                message.len(),
                self.max_message
            )));
        }
        Ok(())
    }

    /// Abort every in-flight operation, drop the connection and move to `next`.
    pub(crate) fn sever(&self, next: ChannelState) {
        let ops: Vec<PendingOperation> = self.ops.lock().drain(..).collect();
        let conn = {
            let mut inner = self.inner.lock();
            inner.state = next;
            inner.remainder = None;
            inner.conn.take()
        };
        // Queued ops first: once the socket is shut down they would see EOF instead.
        for op in &ops {
            op.cancel();
        }
        if let Some(fd) = conn {
            sys::shutdown(fd.as_fd());
        }
        if !ops.is_empty() {
            log::debug!("{}: severed {} operations", self.label, ops.len());
        }
    }
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}
