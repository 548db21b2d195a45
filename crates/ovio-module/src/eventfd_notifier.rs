//! `EventFdNotifier`: reactor wakeup through an eventfd.
//!
//! The reactor thread sleeps in `epoll_wait`; shutting down writes to this
//! eventfd so the sleep ends immediately.
//! Multiple notifications before the reactor drains the counter coalesce
//! into one wakeup (eventfd counter semantics).

use ovio_core::error::{OvioError, Result};

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct EventFdNotifier {
    fd: OwnedFd,
}

impl EventFdNotifier {
    /// Create a non-blocking, close-on-exec eventfd.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(OvioError::last_os_error("eventfd"));
        }
        // Safety: fd was just returned by eventfd and is owned by nobody else.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Increment the counter, waking any poller.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // EAGAIN: counter saturated, a wakeup is already pending
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(OvioError::from_errno("eventfd write", err.raw_os_error().unwrap_or(libc::EIO)));
        }
        Ok(())
    }

    /// Reset the counter. Returns how many notifications were coalesced.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl AsRawFd for EventFdNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_coalesce() {
        let n = EventFdNotifier::create().unwrap();
        assert_eq!(n.drain(), 0);
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert_eq!(n.drain(), 3);
        assert_eq!(n.drain(), 0);
    }
}
