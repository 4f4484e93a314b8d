//! The surface-visible result taxonomy (spec.md §7).
//!
//! Modelled the way the teacher crate keeps its own error surface small and
//! hand-written rather than reaching for a derive-macro error crate: a plain
//! enum, a `Display` impl, and `std::error::Error`.

use std::fmt;
use std::io;

/// Outcome of a synchronous call, or the terminal state carried by a
/// completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    NoMemory,
    /// Kernel buffer exhaustion (`ENOBUFS`).
    NoResources,
    NoPerm,
    AddrInUse,
    AddrNotAvail,
    /// The socket is already bound.
    Bound,
    ConnRefused,
    NetUnreach,
    HostUnreach,
    TimedOut,
    Eof,
    Cancelled,
    Unexpected,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Status::Success => "success",
            Status::NoMemory => "no memory",
            Status::NoResources => "no resources available",
            Status::NoPerm => "permission denied",
            Status::AddrInUse => "address in use",
            Status::AddrNotAvail => "address not available",
            Status::Bound => "socket already bound",
            Status::ConnRefused => "connection refused",
            Status::NetUnreach => "network unreachable",
            Status::HostUnreach => "host unreachable",
            Status::TimedOut => "timed out",
            Status::Eof => "end of file",
            Status::Cancelled => "operation cancelled",
            Status::Unexpected => "unexpected error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Status {}

/// Maps an `errno` from a failed `bind(2)` call (spec.md §4.3 `Bind`).
pub(crate) fn bind_errno_to_status(err: &io::Error) -> Status {
    match err.raw_os_error() {
        Some(libc::EACCES) => Status::NoPerm,
        Some(libc::EADDRNOTAVAIL) => Status::AddrNotAvail,
        Some(libc::EADDRINUSE) => Status::AddrInUse,
        Some(libc::EINVAL) => Status::Bound,
        _ => Status::Unexpected,
    }
}

/// Maps an `errno` from a failed inline `connect(2)` call (spec.md §4.3
/// `Connect`) that is neither soft (`EINPROGRESS`/`EAGAIN`) nor success.
pub(crate) fn connect_errno_to_status(err: &io::Error) -> Option<Status> {
    match err.raw_os_error() {
        Some(libc::ECONNREFUSED) => Some(Status::ConnRefused),
        Some(libc::ENETUNREACH) => Some(Status::NetUnreach),
        Some(libc::EHOSTUNREACH) => Some(Status::HostUnreach),
        Some(libc::ETIMEDOUT) => Some(Status::TimedOut),
        _ => None,
    }
}

/// True for the `SOFT_ERROR` macro's set in the original: errno values that
/// mean "try again later", never a terminal outcome.
#[allow(unreachable_patterns)] // EAGAIN == EWOULDBLOCK on most platforms
pub(crate) fn is_soft_errno(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) | None
    )
}
