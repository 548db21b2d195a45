//! Transport abstraction for protocol sessions.
//!
//! Two traits split the blocking and callback-driven worlds:
//!
//! # Implementors
//!
//! - `HttpTransport`: `TcpTransport` (plain TCP, RFC 6455 framing)
//! - `AsyncHttpTransport`: `PooledTransport` (a `TcpTransport` whose
//!   stages run on a `Dispatcher`)
//!
//! Test code supplies scripted implementations of either trait.

use crate::settings::SessionSettings;

use ovio_core::error::{OvioError, Result};

use std::fmt;
use std::sync::Arc;

/// How a received chunk relates to the message it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Last (or only) piece of a binary message
    BinaryMessage,
    /// More of this binary message follows
    BinaryFragment,
    Utf8Message,
    Utf8Fragment,
    /// Peer closed the session
    Close,
}

impl BufferType {
    #[inline]
    pub fn is_fragment(self) -> bool {
        matches!(self, BufferType::BinaryFragment | BufferType::Utf8Fragment)
    }

    #[inline]
    pub fn is_message(self) -> bool {
        matches!(self, BufferType::BinaryMessage | BufferType::Utf8Message)
    }
}

/// Blocking transport: every call returns once its stage is done.
///
/// **Contract:**
/// - Calls are made in handshake order: `open`, `send_upgrade_request`,
///   `receive_response`, `complete_upgrade`; then any mix of `send` and
///   `receive`; finally `close`.
/// - `send` and `receive` may run concurrently on different threads.
pub trait HttpTransport: Send + Sync {
    /// Resolve `settings.host` and connect.
    fn open(&self, settings: &SessionSettings) -> Result<()>;

    /// Send the GET request carrying the upgrade headers.
    fn send_upgrade_request(&self, path: &str) -> Result<()>;

    /// Block for the response head; returns its status code.
    fn receive_response(&self) -> Result<u16>;

    /// Validate the `101` response and switch to message framing.
    fn complete_upgrade(&self) -> Result<()>;

    /// Send one message (or fragment) of the given type.
    fn send(&self, kind: BufferType, data: &[u8]) -> Result<()>;

    /// Receive up to `buf.len()` bytes of the current message.
    fn receive(&self, buf: &mut [u8]) -> Result<(usize, BufferType)>;

    /// Graceful close handshake, then release the connection. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Stage of an asynchronous request, reported with failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    SendRequest,
    ReceiveResponse,
    Upgrade,
    ReadData,
    WriteData,
    Close,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStage::SendRequest => "send request",
            RequestStage::ReceiveResponse => "receive response",
            RequestStage::Upgrade => "upgrade",
            RequestStage::ReadData => "read data",
            RequestStage::WriteData => "write data",
            RequestStage::Close => "close",
        };
        f.write_str(s)
    }
}

/// Progress notification delivered to a [`StatusCallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    RequestSent,
    HeadersAvailable { status: u16 },
    UpgradeComplete,
    ReadComplete { data: Vec<u8>, buffer_type: BufferType },
    WriteComplete { bytes: usize },
    CloseComplete,
    RequestError { stage: RequestStage, error: OvioError },
}

/// Receives the context value registered with the transport and an event.
/// Invoked on whatever thread finished the stage.
pub type StatusCallback = Arc<dyn Fn(u64, StatusEvent) + Send + Sync>;

/// Callback-driven transport. Every stage method returns at once; its
/// outcome arrives later as a [`StatusEvent`].
///
/// **Contract:**
/// - An `Err` returned by a stage method means the stage was never
///   started and no event will follow for it.
/// - Each started stage produces exactly one event: its completion event
///   or `RequestError`.
pub trait AsyncHttpTransport: Send + Sync {
    /// Register where events go. `context` is passed back verbatim.
    fn set_callback(&self, context: u64, callback: StatusCallback);

    /// Resolve and connect. Synchronous.
    fn open(&self, settings: &SessionSettings) -> Result<()>;

    /// Completes with `RequestSent`.
    fn send_request(&self, path: &str) -> Result<()>;

    /// Completes with `HeadersAvailable`.
    fn receive_response(&self) -> Result<()>;

    /// Completes with `UpgradeComplete`.
    fn complete_upgrade(&self) -> Result<()>;

    /// Completes with `ReadComplete` carrying at most `max_len` bytes.
    fn receive(&self, max_len: usize) -> Result<()>;

    /// Completes with `WriteComplete`.
    fn send(&self, kind: BufferType, data: Vec<u8>) -> Result<()>;

    /// Completes with `CloseComplete`.
    fn close(&self) -> Result<()>;
}
