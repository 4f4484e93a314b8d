//! Non-blocking socket creation, grounded on the teacher's
//! `src/sys/unix/socket.rs` (`socket_addr`, `new_socket`).

use std::io;
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Stream,
    Datagram,
}

pub(crate) fn domain_of(addr: &std::net::SocketAddr) -> libc::c_int {
    match addr {
        std::net::SocketAddr::V4(..) => libc::AF_INET,
        std::net::SocketAddr::V6(..) => libc::AF_INET6,
    }
}

/// Create a non-blocking, close-on-exec socket for `domain`/`kind`.
///
/// On Linux/the BSDs the flags ride along in the `socket(2)` type argument;
/// elsewhere (macOS, Solaris) `SOCK_NONBLOCK`/`SOCK_CLOEXEC` don't exist and
/// the equivalent `fcntl` calls are made after creation, exactly as the
/// teacher's `new_socket` does it.
pub(crate) fn new_socket(domain: libc::c_int, kind: SockKind) -> io::Result<RawFd> {
    let ty = match kind {
        SockKind::Stream => libc::SOCK_STREAM,
        SockKind::Datagram => libc::SOCK_DGRAM,
    };

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd",
    ))]
    let socket_type = ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd",
    )))]
    let socket_type = ty;

    let fd = syscall!(socket(domain, socket_type, 0))?;

    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "illumos",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd",
    )))]
    {
        set_cloexec(fd)?;
        set_nonblocking(fd)?;
    }

    Ok(fd)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    let _ = unsafe { libc::close(fd) };
}
