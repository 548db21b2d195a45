//! # ovio - Overlapped I/O completion engine
//!
//! Start an operation, get a handle back, learn about completion through
//! a waitable signal or a callback on a worker thread.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ovio::{BlockingPipeClient, BlockingPipeServer, PipeConfig, INFINITE};
//!
//! let mut server = BlockingPipeServer::create(PipeConfig::new("demo")?)?;
//! std::thread::spawn(|| {
//!     let client = BlockingPipeClient::connect("demo", INFINITE).unwrap();
//!     client.write(b"ping").unwrap();
//! });
//! server.connect()?;
//! assert_eq!(server.read(4096)?, b"ping");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │      WebSocket / AsyncWebSocket, pipes, ThreadPool work     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌─────────────┐     ┌─────────────┐
//!    │ ovio-ws   │      │ pipe        │     │ ThreadPool  │
//!    │ sessions  │      │ strategies  │     │ (Dispatcher)│
//!    └───────────┘      └─────────────┘     └─────────────┘
//!          │                   │
//!          ▼                   ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │   Reactor (epoll) ─► PendingOperation ─► CompletionSignal│
//!    └─────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

// Re-export core types
pub use ovio_core::{
    Arena, ChannelState, CompletionSignal, Dispatcher, InlineDispatcher, Job, OpStatus, OvioError,
    ReadState, ResetMode, Result, SessionStatus, Token, WriteState, INFINITE,
};

// Re-export env utilities
pub use ovio_core::{env_get, env_get_bool, env_get_ms, env_get_opt};

// Re-export engine types
pub use ovio_module::pipe::{
    AccessDescriptor, Blocking, BlockingPipeClient, BlockingPipeServer, Instances, IoStrategy,
    NamedPipeClient, NamedPipeServer, Overlapped, OverlappedPipeClient, OverlappedPipeServer,
    PipeConfig, PipeName,
};
pub use ovio_module::{
    Interest, IoPoll, OverlappedIo, PendingOperation, PipeEnv, PoolConfig, Reactor, ReactorConfig,
    ThreadPool, Transfer, WorkToken,
};

// Re-export session types
pub use ovio_ws::{
    AsyncHttpTransport, AsyncWebSocket, BufferType, ClientCertificate, ConnectionResult,
    HttpTransport, PooledTransport, ReadResult, ReceiveHandle, RequestStage, SessionSettings,
    StatusEvent, TcpTransport, WebSocket, WriteResult,
};

/// Asynchronous session whose transport stages run on `pool`.
///
/// A receive occupies one worker until data arrives, so the pool should
/// allow at least two workers when sends overlap receives.
pub fn async_session(settings: SessionSettings, pool: Arc<ThreadPool>) -> Result<AsyncWebSocket> {
    if pool.max_threads() < 2 {
        log::warn!("async_session: pool max {} serialises sends behind receives", pool.max_threads());
    }
    AsyncWebSocket::new(settings, PooledTransport::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_async_session_reports_connect_failure() {
        let pool = Arc::new(ThreadPool::new(1, 2).unwrap());
        // Port 1 on loopback refuses connections
        let ws = async_session(SessionSettings::new("127.0.0.1", 1), pool).unwrap();
        assert!(ws.connect().is_err());
        assert_eq!(ws.status(), SessionStatus::Error);
        assert!(ws.connection_result().wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_pool_dispatches_jobs() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let done = CompletionSignal::manual();
        let signal = done.clone();
        pool.dispatch(Box::new(move || {
            signal.signal().unwrap();
        }))
        .unwrap();
        assert!(done.wait(Some(Duration::from_secs(5)), false).unwrap());
    }
}
