//! Server end of a named pipe.

use super::channel::ChannelCore;
use super::name::{AccessDescriptor, Instances, PipeName};
use super::registry::{self, Endpoint};
use super::strategy::{Blocking, IoStrategy, Overlapped};
use super::sys;

use crate::config::PipeEnv;

use ovio_core::error::{OvioError, Result};
use ovio_core::state::ChannelState;

use std::marker::PhantomData;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Creation parameters for a server instance.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub name: PipeName,
    /// Kernel buffer per direction
    pub buffer_size: usize,
    pub max_instances: Instances,
    pub access: AccessDescriptor,
    /// Largest message accepted in either direction
    pub max_message: usize,
    pub socket_dir: PathBuf,
}

impl PipeConfig {
    /// Defaults from [`PipeEnv`]: one instance, owner-only access.
    pub fn new(name: &str) -> Result<Self> {
        let env = PipeEnv::from_env();
        Ok(Self {
            name: PipeName::parse(name)?,
            buffer_size: env.buffer_size,
            max_instances: Instances::Limited(1),
            access: AccessDescriptor::default(),
            max_message: env.max_message,
            socket_dir: env.socket_dir,
        })
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn max_instances(mut self, instances: Instances) -> Self {
        self.max_instances = instances;
        self
    }

    pub fn access(mut self, access: AccessDescriptor) -> Self {
        self.access = access;
        self
    }

    pub fn max_message(mut self, size: usize) -> Self {
        self.max_message = size;
        self
    }

    pub fn socket_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.socket_dir = dir.as_ref().to_path_buf();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(OvioError::validation("pipe buffer size must be non-zero"));
        }
        if self.max_message == 0 {
            return Err(OvioError::validation("max message size must be non-zero"));
        }
        Ok(())
    }
}

/// One server instance. Operations take `&self` so another thread may
/// `disconnect()` while a call is outstanding.
///
/// ```rust,ignore
/// let server = BlockingPipeServer::create(PipeConfig::new("jobs")?)?;
/// server.connect()?;
/// let request = server.read(4096)?;
/// server.write(b"done")?;
/// ```
pub struct NamedPipeServer<S: IoStrategy = Blocking> {
    endpoint: Option<Arc<Endpoint>>,
    chan: ChannelCore,
    config: PipeConfig,
    _strategy: PhantomData<S>,
}

pub type BlockingPipeServer = NamedPipeServer<Blocking>;
pub type OverlappedPipeServer = NamedPipeServer<Overlapped>;

impl<S: IoStrategy> NamedPipeServer<S> {
    /// Create an instance under `config.name`.
    ///
    /// Fails with `ChannelBusy` when the name already has its maximum
    /// number of instances.
    pub fn create(config: PipeConfig) -> Result<Self> {
        config.validate()?;
        let reactor = S::reactor()?;
        let endpoint = registry::acquire(
            &config.name,
            &config.socket_dir,
            config.max_instances,
            config.access,
        )?;
        let chan = ChannelCore::new(
            format!("pipe server {}", config.name),
            reactor,
            config.max_message,
            config.buffer_size,
        );
        Ok(Self { endpoint: Some(endpoint), chan, config, _strategy: PhantomData })
    }

    /// Wait for a client.
    pub fn connect(&self) -> Result<S::Connect> {
        let endpoint = self.endpoint()?;
        {
            let mut inner = self.chan.inner().lock();
            match inner.state {
                ChannelState::Disconnected => inner.state = ChannelState::Listening,
                state => {
                    return Err(OvioError::invalid_state(format!(
                        "{}: connect while {}",
                        self.chan.label, state
                    )))
                }
            }
        }
        let result = S::accept(&self.chan, endpoint.listener.as_fd());
        if result.is_err() {
            let mut inner = self.chan.inner().lock();
            if inner.state == ChannelState::Listening {
                inner.state = ChannelState::Disconnected;
            }
        }
        result
    }

    pub fn read(&self, max_len: usize) -> Result<S::Read> {
        S::read(&self.chan, max_len)
    }

    pub fn write(&self, message: &[u8]) -> Result<S::Write> {
        S::write(&self.chan, message)
    }

    /// Drop the current client. Outstanding operations complete with
    /// `Aborted`; the instance may `connect()` again.
    pub fn disconnect(&self) -> Result<()> {
        self.endpoint()?;
        self.chan.sever(ChannelState::Disconnected);
        Ok(())
    }

    /// Sever the client and give up the instance slot. Idempotent.
    pub fn close(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            self.chan.sever(ChannelState::Closed);
            registry::release(&endpoint);
        }
    }

    pub fn state(&self) -> ChannelState {
        self.chan.state()
    }

    pub fn name(&self) -> &PipeName {
        &self.config.name
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Bytes the client has sent that no read has consumed yet.
    pub fn unread_bytes(&self) -> Result<usize> {
        unread_bytes(&self.chan)
    }

    fn endpoint(&self) -> Result<&Arc<Endpoint>> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| OvioError::invalid_state(format!("{} is closed", self.chan.label)))
    }
}

pub(crate) fn unread_bytes(chan: &ChannelCore) -> Result<usize> {
    let buffered = chan.remainder_len();
    let conn = chan.connection()?;
    let queued = sys::readable_bytes(conn.as_fd())
        .map_err(|e| OvioError::from_errno("ioctl(FIONREAD)", e as i32))?;
    Ok(buffered + queued)
}

impl<S: IoStrategy> Drop for NamedPipeServer<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: IoStrategy> std::fmt::Debug for NamedPipeServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedPipeServer")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}
