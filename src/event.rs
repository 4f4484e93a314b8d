//! Completion events delivered to consumer tasks (spec.md §3 "Request
//! events", §9 "Callback/event dispatch").

use std::net::SocketAddr;
use std::sync::Arc;

use crate::status::Status;

/// Per-packet ancillary info decoded off (or to be attached to) a datagram
/// (spec.md §4.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub interface_index: u32,
    /// IPv6 destination address the datagram was addressed to.
    pub dest_addr: Option<std::net::Ipv6Addr>,
}

/// Kernel receive timestamp, normalised to `(seconds, nanoseconds)`
/// (spec.md §4.5: "convert (seconds, microseconds) -> (seconds,
/// nanoseconds = micros * 1000)").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

/// Attribute flags carried on a completion event (spec.md §3). Hand-rolled
/// rather than pulling in the `bitflags` crate for six bits, in keeping with
/// the teacher's own small `Ready`/`Interest` bitsets in `src/interests.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventAttrs(u8);

impl EventAttrs {
    pub const ATTACHED_TO_TASK: EventAttrs = EventAttrs(0b0000_0001);
    pub const TRUNCATED: EventAttrs = EventAttrs(0b0000_0010);
    pub const CTRUNCATED: EventAttrs = EventAttrs(0b0000_0100);
    pub const HAS_PKTINFO: EventAttrs = EventAttrs(0b0000_1000);
    pub const HAS_TIMESTAMP: EventAttrs = EventAttrs(0b0001_0000);
    pub const FATAL_ERROR: EventAttrs = EventAttrs(0b0010_0000);

    pub const fn empty() -> Self {
        EventAttrs(0)
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for EventAttrs {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        EventAttrs(self.0 | rhs.0)
    }
}

/// The sum type of consumer-visible completion kinds
/// (spec.md §9 "Callback/event dispatch": `RecvDone`, `SendDone`, `NewConn`,
/// `Connect`, `RecvMark`, `SendMark`; the two internal kinds, `Readable` and
/// `Writable`, never leave the crate and are not represented here — they are
/// plain dispatcher calls posted to the task scheduler, see `socket.rs`).
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    RecvDone {
        status: Status,
        bytes: usize,
        from: Option<SocketAddr>,
        timestamp: Option<Timestamp>,
        pktinfo: Option<PacketInfo>,
        attrs: EventAttrs,
    },
    SendDone {
        status: Status,
        bytes: usize,
    },
    NewConn {
        status: Status,
        socket: Option<Arc<crate::socket::Socket>>,
        peer: Option<SocketAddr>,
    },
    Connect {
        status: Status,
    },
    RecvMark {
        status: Status,
    },
    SendMark {
        status: Status,
    },
}

impl CompletionEvent {
    pub fn status(&self) -> Status {
        match self {
            CompletionEvent::RecvDone { status, .. }
            | CompletionEvent::SendDone { status, .. }
            | CompletionEvent::NewConn { status, .. }
            | CompletionEvent::Connect { status, .. }
            | CompletionEvent::RecvMark { status, .. }
            | CompletionEvent::SendMark { status, .. } => *status,
        }
    }
}
