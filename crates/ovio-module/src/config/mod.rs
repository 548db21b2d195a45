//! Configuration for the reactor, the thread pool and pipes.
//!
//! Library defaults live in [`defaults`]; `from_env()` applies `OVIO_*`
//! overrides on top. Explicit builder calls win over both.
//!
//! ```rust,ignore
//! use ovio_module::config::PoolConfig;
//!
//! let config = PoolConfig::from_env().max_threads(8);
//! ```

pub mod defaults;

use ovio_core::env::{env_get, env_get_ms, env_get_opt};
use std::path::PathBuf;
use std::time::Duration;

/// Thread pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    /// Idle threads above `min_threads` retire after this long
    pub idle_timeout: Duration,
    /// Upper bound on simultaneously created work items
    pub max_work_items: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PoolConfig {
    /// Environment variables (all optional):
    /// - `OVIO_POOL_MIN` - Minimum threads
    /// - `OVIO_POOL_MAX` - Maximum threads (default: available parallelism)
    /// - `OVIO_POOL_IDLE_MS` - Idle retirement timeout
    pub fn from_env() -> Self {
        Self {
            min_threads: env_get("OVIO_POOL_MIN", defaults::POOL_MIN_THREADS),
            max_threads: env_get("OVIO_POOL_MAX", default_max_threads()),
            idle_timeout: env_get_ms("OVIO_POOL_IDLE_MS", defaults::POOL_IDLE_MS),
            max_work_items: defaults::POOL_MAX_WORK_ITEMS,
        }
    }

    pub fn min_threads(mut self, n: usize) -> Self {
        self.min_threads = n;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }
}

fn default_max_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(defaults::POOL_MIN_THREADS)
}

/// Completion reactor settings.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Events drained per `epoll_wait`
    pub max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ReactorConfig {
    /// - `OVIO_REACTOR_EVENTS` - epoll batch size
    pub fn from_env() -> Self {
        Self {
            max_events: env_get("OVIO_REACTOR_EVENTS", defaults::REACTOR_EVENTS).max(1),
        }
    }
}

/// Process-wide pipe settings that do not belong to one pipe.
#[derive(Debug, Clone)]
pub struct PipeEnv {
    /// Directory holding pipe socket files
    pub socket_dir: PathBuf,
    pub buffer_size: usize,
    pub max_message: usize,
}

impl PipeEnv {
    /// - `OVIO_PIPE_DIR` - Socket directory (default `$XDG_RUNTIME_DIR`, then `/tmp`)
    /// - `OVIO_PIPE_BUFFER` - Kernel buffer per direction
    /// - `OVIO_PIPE_MAX_MESSAGE` - Largest accepted message
    pub fn from_env() -> Self {
        let socket_dir = env_get_opt::<PathBuf>("OVIO_PIPE_DIR")
            .or_else(|| env_get_opt::<PathBuf>("XDG_RUNTIME_DIR"))
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(std::env::temp_dir);
        Self {
            socket_dir,
            buffer_size: env_get("OVIO_PIPE_BUFFER", defaults::PIPE_BUFFER_SIZE),
            max_message: env_get("OVIO_PIPE_MAX_MESSAGE", defaults::PIPE_MAX_MESSAGE),
        }
    }
}
