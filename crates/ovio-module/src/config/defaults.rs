//! Library defaults, overridable through the environment.

/// Minimum live pool threads
pub const POOL_MIN_THREADS: usize = 1;

/// Idle time before a thread above the minimum retires
pub const POOL_IDLE_MS: u64 = 10_000;

/// Live work items a pool tracks at once
pub const POOL_MAX_WORK_ITEMS: usize = 65_536;

/// epoll_wait batch size
pub const REACTOR_EVENTS: usize = 64;

/// Kernel socket buffer per pipe direction
pub const PIPE_BUFFER_SIZE: usize = 4096;

/// Largest message a pipe read will accept
pub const PIPE_MAX_MESSAGE: usize = 64 * 1024;

/// Socket file permissions when no descriptor is given
pub const PIPE_ACCESS_MODE: u32 = 0o600;

/// Poll interval while a client waits for a busy pipe
pub const PIPE_BUSY_RETRY_MS: u64 = 10;
