//! Client end of a named pipe.

use super::channel::ChannelCore;
use super::name::PipeName;
use super::server::unread_bytes;
use super::strategy::{Blocking, IoStrategy};
use super::sys;

use crate::config::{defaults, PipeEnv};

use ovio_core::error::{OvioError, Result};
use ovio_core::state::ChannelState;

use nix::errno::Errno;
use std::marker::PhantomData;
use std::os::unix::io::AsFd;
use std::path::Path;
use std::time::{Duration, Instant};

pub struct NamedPipeClient<S: IoStrategy = Blocking> {
    chan: ChannelCore,
    name: PipeName,
    _strategy: PhantomData<S>,
}

impl<S: IoStrategy> NamedPipeClient<S> {
    /// Connect to `name` in the configured socket directory.
    ///
    /// While every server instance is busy the attempt is retried until
    /// `timeout` elapses (`None` waits indefinitely) and then fails with
    /// `ChannelBusy`.
    pub fn connect(name: &str, timeout: Option<Duration>) -> Result<Self> {
        Self::connect_in(&PipeEnv::from_env().socket_dir, name, timeout)
    }

    /// [`connect`](Self::connect) with an explicit socket directory.
    pub fn connect_in(dir: &Path, name: &str, timeout: Option<Duration>) -> Result<Self> {
        let env = PipeEnv::from_env();
        let name = PipeName::parse(name)?;
        let path = name.socket_path(dir)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let retry = Duration::from_millis(defaults::PIPE_BUSY_RETRY_MS);

        let conn = loop {
            let sock = sys::socket(true).map_err(|e| OvioError::from_errno("socket", e as i32))?;
            match sys::connect(sock.as_fd(), &path) {
                Ok(()) => break sock,
                Err(Errno::EAGAIN | Errno::EINTR) => {
                    let now = Instant::now();
                    if deadline.is_some_and(|d| now >= d) {
                        return Err(OvioError::ChannelBusy(format!("{}: all instances busy", name)));
                    }
                    let nap = deadline.map_or(retry, |d| retry.min(d - now));
                    std::thread::sleep(nap);
                }
                Err(e) => {
                    return Err(OvioError::from_errno(&format!("connect {}", name), e as i32))
                }
            }
        };
        if !S::NONBLOCKING {
            sys::set_nonblocking(conn.as_fd(), false)
                .map_err(|e| OvioError::from_errno("fcntl", e as i32))?;
        }

        let chan = ChannelCore::new(
            format!("pipe client {}", name),
            S::reactor()?,
            env.max_message,
            env.buffer_size,
        );
        chan.adopt(conn)?;
        log::debug!("{}: connected", chan.label);
        Ok(Self { chan, name, _strategy: PhantomData })
    }

    pub fn read(&self, max_len: usize) -> Result<S::Read> {
        S::read(&self.chan, max_len)
    }

    pub fn write(&self, message: &[u8]) -> Result<S::Write> {
        S::write(&self.chan, message)
    }

    pub fn unread_bytes(&self) -> Result<usize> {
        unread_bytes(&self.chan)
    }

    /// Sever outstanding operations and hang up. Idempotent.
    pub fn close(&self) {
        if self.chan.state() != ChannelState::Closed {
            self.chan.sever(ChannelState::Closed);
        }
    }

    pub fn state(&self) -> ChannelState {
        self.chan.state()
    }

    pub fn name(&self) -> &PipeName {
        &self.name
    }
}

impl<S: IoStrategy> Drop for NamedPipeClient<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: IoStrategy> std::fmt::Debug for NamedPipeClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedPipeClient")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
