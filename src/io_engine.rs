//! The errno decision tables for a single non-blocking recv/send attempt
//! (spec.md §4.4), grounded on the original's `doio_recv`/`doio_send`.
//!
//! `doio_recv`'s `SOFT_OR_HARD` handling of `ECONNREFUSED`/`ENETUNREACH`/
//! `EHOSTUNREACH` and its `ENOBUFS` arm mirror the original byte-for-byte: a
//! connected stream socket goes `Hard` with the mapped status (sticky on the
//! socket, so every later `Recv` that finds the queue already failed repeats
//! it), an unconnected datagram socket just retries (`Soft`).
//!
//! Deliberately reproduces one asymmetry from the original rather than
//! "fixing" it (see `SPEC_FULL.md`'s Open Questions): in `doio_recv`, an
//! unrecognised negative return logs an "unexpected" status but still
//! reports `Success` (falling through to process whatever was read, which
//! for an unrecognised error is zero bytes); in `doio_send`, the analogous
//! branch reports `Hard`. Two different authors, two different defaults;
//! the behavioural gap is real in the source this crate is modelled on.

use std::mem::{self, MaybeUninit};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use log::warn;

use crate::addr::{socket_addr, to_socket_addr};
use crate::ancillary::{self, DecodedAncillary, CMSG_SPACE_ESTIMATE};
use crate::fd::SockKind;
use crate::status::{is_soft_errno, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoOutcome {
    /// `EAGAIN`/`EWOULDBLOCK`/`EINTR`: no progress, try again once readable.
    Soft,
    /// A fatal error; the operation (and the direction, for a stream) is
    /// done.
    Hard,
    /// Stream peer shut down its write side (`read` returned `0`).
    Eof,
    Success,
}

pub(crate) struct RecvOutcome {
    pub(crate) outcome: IoOutcome,
    pub(crate) bytes: usize,
    pub(crate) from: Option<SocketAddr>,
    pub(crate) ancillary: DecodedAncillary,
    pub(crate) status: Status,
}

pub(crate) struct SendOutcome {
    pub(crate) outcome: IoOutcome,
    pub(crate) bytes: usize,
    pub(crate) status: Status,
}

fn build_iovecs_mut(slices: &mut [&mut [u8]]) -> Vec<libc::iovec> {
    slices
        .iter_mut()
        .map(|s| libc::iovec {
            iov_base: s.as_mut_ptr() as *mut libc::c_void,
            iov_len: s.len(),
        })
        .collect()
}

fn build_iovecs(slices: &[&[u8]]) -> Vec<libc::iovec> {
    slices
        .iter()
        .map(|s| libc::iovec {
            iov_base: s.as_ptr() as *mut libc::c_void,
            iov_len: s.len(),
        })
        .collect()
}

/// Attempt one non-blocking `recvmsg`. `slices` is the scatter-gather
/// destination (already capped to the request's iovec limit by the
/// caller); for a stream socket `want_ancillary` is always `false`.
pub(crate) fn doio_recv(
    fd: RawFd,
    kind: SockKind,
    slices: &mut [&mut [u8]],
    want_ancillary: bool,
) -> RecvOutcome {
    let mut iovecs = build_iovecs_mut(slices);
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut control = if want_ancillary {
        vec![0u8; CMSG_SPACE_ESTIMATE]
    } else {
        Vec::new()
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = storage.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = iovecs.as_mut_ptr();
    msg.msg_iovlen = iovecs.len() as _;
    if !control.is_empty() {
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;
    }

    let ret = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if is_soft_errno(&err) {
            return RecvOutcome {
                outcome: IoOutcome::Soft,
                bytes: 0,
                from: None,
                ancillary: DecodedAncillary::default(),
                status: Status::Success,
            };
        }

        let soft_or_hard = match err.raw_os_error() {
            Some(libc::ECONNREFUSED) => Some(Status::ConnRefused),
            Some(libc::ENETUNREACH) => Some(Status::NetUnreach),
            Some(libc::EHOSTUNREACH) => Some(Status::HostUnreach),
            _ => None,
        };
        if let Some(mapped) = soft_or_hard {
            return if kind == SockKind::Stream {
                RecvOutcome {
                    outcome: IoOutcome::Hard,
                    bytes: 0,
                    from: None,
                    ancillary: DecodedAncillary::default(),
                    status: mapped,
                }
            } else {
                RecvOutcome {
                    outcome: IoOutcome::Soft,
                    bytes: 0,
                    from: None,
                    ancillary: DecodedAncillary::default(),
                    status: Status::Success,
                }
            };
        }

        if err.raw_os_error() == Some(libc::ENOBUFS) {
            return RecvOutcome {
                outcome: IoOutcome::Hard,
                bytes: 0,
                from: None,
                ancillary: DecodedAncillary::default(),
                status: Status::NoResources,
            };
        }

        warn!("sockloop: recvmsg on fd {fd} returned unexpected error: {err}");
        return RecvOutcome {
            outcome: IoOutcome::Success,
            bytes: 0,
            from: None,
            ancillary: DecodedAncillary::default(),
            status: Status::Unexpected,
        };
    }

    let bytes = ret as usize;
    let ancillary = if want_ancillary {
        unsafe { ancillary::decode(&msg) }
    } else {
        DecodedAncillary::default()
    };

    let from = if kind == SockKind::Datagram && msg.msg_namelen > 0 {
        unsafe { to_socket_addr(storage.as_ptr()).ok() }
    } else {
        None
    };

    if kind == SockKind::Stream && bytes == 0 {
        return RecvOutcome {
            outcome: IoOutcome::Eof,
            bytes: 0,
            from,
            ancillary,
            status: Status::Eof,
        };
    }

    RecvOutcome {
        outcome: IoOutcome::Success,
        bytes,
        from,
        ancillary,
        status: Status::Success,
    }
}

/// Attempt one non-blocking `sendmsg`. `dest` is set for an unconnected
/// datagram send; `extra_control` carries an encoded `IPV6_PKTINFO` cmsg
/// when the caller asked to pin the outbound source address/interface.
pub(crate) fn doio_send(
    fd: RawFd,
    slices: &[&[u8]],
    dest: Option<&SocketAddr>,
    extra_control: Option<&[u8]>,
) -> SendOutcome {
    let iovecs = build_iovecs(slices);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };

    let (name_ptr, name_len) = match dest {
        Some(addr) => {
            let (ptr, len) = socket_addr(addr);
            (ptr as *mut libc::sockaddr, len)
        }
        None => (std::ptr::null_mut(), 0),
    };
    msg.msg_name = name_ptr as *mut libc::c_void;
    msg.msg_namelen = name_len;
    msg.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iovecs.len() as _;

    if let Some(control) = extra_control {
        msg.msg_control = control.as_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;
    }

    let ret = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        return if is_soft_errno(&err) {
            SendOutcome {
                outcome: IoOutcome::Soft,
                bytes: 0,
                status: Status::Success,
            }
        } else if err.raw_os_error() == Some(libc::EPIPE)
            || err.raw_os_error() == Some(libc::ECONNRESET)
        {
            SendOutcome {
                outcome: IoOutcome::Hard,
                bytes: 0,
                status: Status::ConnRefused,
            }
        } else {
            SendOutcome {
                outcome: IoOutcome::Hard,
                bytes: 0,
                status: Status::Unexpected,
            }
        };
    }

    SendOutcome {
        outcome: IoOutcome::Success,
        bytes: ret as usize,
        status: Status::Success,
    }
}
