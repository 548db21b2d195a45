//! # ovio-module - Default implementations
//!
//! The Linux machinery behind the ovio core types. Each piece favours
//! correctness and simplicity; waiters only ever see `ovio-core` types.
//!
//! ## Default stack
//!
//! | Concern             | Implementation     | Backed by                   |
//! |---------------------|--------------------|-----------------------------|
//! | Readiness engine    | Reactor            | epoll + eventfd             |
//! | In-flight call      | PendingOperation   | CompletionSignal            |
//! | Buffered call       | OverlappedIo       | PendingOperation + `Vec<u8>`|
//! | Named duplex pipe   | NamedPipeServer    | `AF_UNIX` `SOCK_SEQPACKET`  |
//! | Work dispatch       | ThreadPool         | SegQueue + condvar          |

pub mod config;
pub mod eventfd_notifier;
pub mod overlapped;
pub mod pending;
pub mod pipe;
pub mod reactor;
pub mod thread_pool;

pub use config::{PipeEnv, PoolConfig, ReactorConfig};
pub use overlapped::OverlappedIo;
pub use pending::{Interest, IoPoll, PendingOperation, Transfer};
pub use reactor::Reactor;
pub use thread_pool::{ThreadPool, WorkToken};
