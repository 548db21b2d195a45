//! # ovio-core
//!
//! Core types for the ovio completion engine.
//!
//! Everything above this crate (the reactor, named pipes, the worker pool,
//! protocol sessions) reports results through the types defined here, so
//! a waiter never needs to know which layer produced a completion.
//!
//! ## Modules
//!
//! - `signal` - Completion signal (manual/auto reset, optionally named)
//! - `state` - Operation, channel and session state enums
//! - `token` - Generation-checked handle type
//! - `arena` - Slot arena indexed by tokens
//! - `dispatch` - Continuation dispatch trait
//! - `error` - Error type and numeric codes
//! - `env` - Environment variable utilities

pub mod arena;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod signal;
pub mod state;
pub mod token;

// Re-exports for convenience
pub use arena::Arena;
pub use dispatch::{Dispatcher, InlineDispatcher, Job};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};
pub use error::{OvioError, Result};
pub use signal::{CompletionSignal, ResetMode};
pub use state::{ChannelState, OpStatus, ReadState, SessionStatus, WriteState};
pub use token::Token;

/// Timeout value meaning "wait forever".
pub const INFINITE: Option<std::time::Duration> = None;
