//! Thin wrappers over the `AF_UNIX` / `SOCK_SEQPACKET` calls pipes use.
//!
//! Everything returns `nix::Result` so callers can match `Errno::EAGAIN`
//! and friends before classifying into `OvioError`.

use nix::errno::Errno;

use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

#[inline]
fn check(ret: libc::c_int) -> nix::Result<libc::c_int> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

#[inline]
fn check_size(ret: libc::ssize_t) -> nix::Result<usize> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as usize)
    }
}

fn sockaddr(path: &Path) -> nix::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    // Safety: all-zero is a valid sockaddr_un.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(Errno::ENAMETOOLONG);
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// New close-on-exec seqpacket socket.
pub(crate) fn socket(nonblocking: bool) -> nix::Result<OwnedFd> {
    let mut ty = libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC;
    if nonblocking {
        ty |= libc::SOCK_NONBLOCK;
    }
    let fd = check(unsafe { libc::socket(libc::AF_UNIX, ty, 0) })?;
    // Safety: fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn bind(fd: BorrowedFd<'_>, path: &Path) -> nix::Result<()> {
    let (addr, len) = sockaddr(path)?;
    check(unsafe {
        libc::bind(fd.as_raw_fd(), &addr as *const _ as *const libc::sockaddr, len)
    })?;
    Ok(())
}

pub(crate) fn listen(fd: BorrowedFd<'_>, backlog: libc::c_int) -> nix::Result<()> {
    check(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(())
}

pub(crate) fn connect(fd: BorrowedFd<'_>, path: &Path) -> nix::Result<()> {
    let (addr, len) = sockaddr(path)?;
    check(unsafe {
        libc::connect(fd.as_raw_fd(), &addr as *const _ as *const libc::sockaddr, len)
    })?;
    Ok(())
}

pub(crate) fn accept(listener: BorrowedFd<'_>, nonblocking: bool) -> nix::Result<OwnedFd> {
    let mut flags = libc::SOCK_CLOEXEC;
    if nonblocking {
        flags |= libc::SOCK_NONBLOCK;
    }
    let fd = check(unsafe {
        libc::accept4(listener.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut(), flags)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Send one message. Never raises SIGPIPE.
pub(crate) fn send(fd: BorrowedFd<'_>, data: &[u8], nonblocking: bool) -> nix::Result<usize> {
    let mut flags = libc::MSG_NOSIGNAL;
    if nonblocking {
        flags |= libc::MSG_DONTWAIT;
    }
    check_size(unsafe {
        libc::send(fd.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len(), flags)
    })
}

/// Receive one message into `buf`; a longer message is truncated.
pub(crate) fn recv(fd: BorrowedFd<'_>, buf: &mut [u8], nonblocking: bool) -> nix::Result<usize> {
    let flags = if nonblocking { libc::MSG_DONTWAIT } else { 0 };
    check_size(unsafe {
        libc::recv(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// Full length of the next message without consuming it. Zero means the
/// peer has shut down.
pub(crate) fn peek_len(fd: BorrowedFd<'_>, nonblocking: bool) -> nix::Result<usize> {
    let mut probe = [0u8; 1];
    let mut flags = libc::MSG_PEEK | libc::MSG_TRUNC;
    if nonblocking {
        flags |= libc::MSG_DONTWAIT;
    }
    check_size(unsafe {
        libc::recv(fd.as_raw_fd(), probe.as_mut_ptr() as *mut libc::c_void, probe.len(), flags)
    })
}

/// Drop the next message.
pub(crate) fn discard(fd: BorrowedFd<'_>, nonblocking: bool) -> nix::Result<()> {
    let mut probe = [0u8; 1];
    recv(fd, &mut probe, nonblocking).map(|_| ())
}

/// Bytes queued for reading across all pending messages.
pub(crate) fn readable_bytes(fd: BorrowedFd<'_>) -> nix::Result<usize> {
    let mut count: libc::c_int = 0;
    // Safety: FIONREAD writes one c_int.
    unsafe { fionread(fd.as_raw_fd(), &mut count) }?;
    Ok(count.max(0) as usize)
}

/// Raise both socket buffers to at least `size` bytes.
pub(crate) fn ensure_buffer_size(fd: BorrowedFd<'_>, size: usize) -> nix::Result<()> {
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        let mut current: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        check(unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                opt,
                &mut current as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        })?;
        let wanted = size.min(libc::c_int::MAX as usize) as libc::c_int;
        if wanted > current {
            check(unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    opt,
                    &wanted as *const libc::c_int as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            })?;
        }
    }
    Ok(())
}

pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> nix::Result<()> {
    let flags = check(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    check(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) })?;
    Ok(())
}

/// Shut down both directions, waking any thread blocked on `fd`.
pub(crate) fn shutdown(fd: BorrowedFd<'_>) {
    unsafe {
        libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR);
    }
}

/// Wait up to `timeout_ms` for `fd` to become readable.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: libc::c_int) -> nix::Result<bool> {
    let mut pfd = libc::pollfd { fd: fd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
    match check(unsafe { libc::poll(&mut pfd, 1, timeout_ms) }) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    fn pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_peek_reports_full_length() {
        let (a, b) = pair();
        send(a.as_fd(), &[7u8; 300], false).unwrap();
        assert_eq!(peek_len(b.as_fd(), true).unwrap(), 300);
        assert_eq!(readable_bytes(b.as_fd()).unwrap(), 300);

        let mut buf = vec![0u8; 300];
        assert_eq!(recv(b.as_fd(), &mut buf, true).unwrap(), 300);
        assert_eq!(peek_len(b.as_fd(), true), Err(Errno::EAGAIN));
    }

    #[test]
    fn test_message_boundaries_kept() {
        let (a, b) = pair();
        send(a.as_fd(), b"one", false).unwrap();
        send(a.as_fd(), b"three", false).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(recv(b.as_fd(), &mut buf, false).unwrap(), 3);
        assert_eq!(recv(b.as_fd(), &mut buf, false).unwrap(), 5);
    }

    #[test]
    fn test_peer_close_reads_zero() {
        let (a, b) = pair();
        drop(a);
        assert_eq!(peek_len(b.as_fd(), true).unwrap(), 0);
        assert_eq!(send(b.as_fd(), b"x", true), Err(Errno::EPIPE));
    }

    #[test]
    fn test_sockaddr_too_long() {
        let long = Path::new("/tmp").join("y".repeat(200));
        assert_eq!(sockaddr(&long).unwrap_err(), Errno::ENAMETOOLONG);
    }
}
