//! # ovio-ws - Streaming protocol sessions
//!
//! WebSocket-style client sessions in two flavours sharing one handshake
//! and frame codec:
//!
//! | Session          | Transport trait        | Default transport | Results          |
//! |------------------|------------------------|-------------------|------------------|
//! | `WebSocket`      | `HttpTransport`        | `TcpTransport`    | returned inline  |
//! | `AsyncWebSocket` | `AsyncHttpTransport`   | `PooledTransport` | `*Result` + signal |
//!
//! ## Modules
//!
//! - `settings` - Per-session configuration
//! - `frame` - RFC 6455 frame codec
//! - `handshake` - HTTP/1.1 upgrade request and response
//! - `transport` - Transport traits and status events
//! - `tcp` - Plain-TCP blocking transport
//! - `pooled` - Dispatcher-backed callback transport
//! - `registry` - Token registry for callback contexts
//! - `websocket` - Blocking session
//! - `async_websocket` - Callback-driven session

pub mod async_websocket;
pub mod frame;
pub mod handshake;
pub mod pooled;
pub mod registry;
pub mod settings;
pub mod tcp;
pub mod transport;
pub mod websocket;

pub use async_websocket::{AsyncWebSocket, ConnectionResult, ReadResult, WriteResult};
pub use pooled::PooledTransport;
pub use registry::{SessionRegistry, SessionToken};
pub use settings::{ClientCertificate, SessionSettings};
pub use tcp::TcpTransport;
pub use transport::{
    AsyncHttpTransport, BufferType, HttpTransport, RequestStage, StatusCallback, StatusEvent,
};
pub use websocket::{ReceiveHandle, WebSocket};
