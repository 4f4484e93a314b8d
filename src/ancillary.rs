//! Ancillary (`cmsg`) decode/encode for datagram sockets: `IPV6_PKTINFO` and
//! `SO_TIMESTAMP` on receive, `IPV6_PKTINFO` on send (spec.md §4.5).

use std::mem;
use std::net::Ipv6Addr;

use crate::event::{EventAttrs, PacketInfo, Timestamp};

/// Bytes of ancillary control-message space to reserve per datagram recv;
/// enough for one `in6_pktinfo` plus one `timeval`, each with cmsg header
/// overhead.
pub(crate) const CMSG_SPACE_ESTIMATE: usize = 256;

#[derive(Debug, Default, Clone)]
pub(crate) struct DecodedAncillary {
    pub(crate) pktinfo: Option<PacketInfo>,
    pub(crate) timestamp: Option<Timestamp>,
    pub(crate) attrs: EventAttrs,
}

/// Walk the `cmsghdr` chain in `msg`, extracting the fields this crate
/// cares about. Unrecognised cmsg types are skipped.
///
/// # Safety
/// `msg` must be a `msghdr` that was just filled in by a successful
/// `recvmsg(2)` call using the same `msg_control` buffer.
pub(crate) unsafe fn decode(msg: &libc::msghdr) -> DecodedAncillary {
    let mut out = DecodedAncillary::default();

    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        out.attrs.insert(EventAttrs::TRUNCATED);
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        out.attrs.insert(EventAttrs::CTRUNCATED);
    }

    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        match (hdr.cmsg_level, hdr.cmsg_type) {
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                let data = libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo;
                let info = &*data;
                let addr = Ipv6Addr::from(info.ipi6_addr.s6_addr);
                out.pktinfo = Some(PacketInfo {
                    interface_index: info.ipi6_ifindex as u32,
                    dest_addr: Some(addr),
                });
                out.attrs.insert(EventAttrs::HAS_PKTINFO);
            }
            (libc::SOL_SOCKET, t) if t == so_timestamp_cmsg_type() => {
                let data = libc::CMSG_DATA(cmsg) as *const libc::timeval;
                let tv = &*data;
                out.timestamp = Some(Timestamp {
                    seconds: tv.tv_sec as i64,
                    nanoseconds: (tv.tv_usec as u32).saturating_mul(1000),
                });
                out.attrs.insert(EventAttrs::HAS_TIMESTAMP);
            }
            _ => {}
        }
        cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
    }

    out
}

fn so_timestamp_cmsg_type() -> libc::c_int {
    libc::SCM_TIMESTAMP
}

/// Build the control-message buffer requesting an `IPV6_PKTINFO` to be
/// attached to an outbound datagram.
pub(crate) fn encode_pktinfo(info: &PacketInfo) -> Vec<u8> {
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as u32) } as usize;
    let mut buf = vec![0u8; space];

    let pktinfo = libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr {
            s6_addr: info.dest_addr.unwrap_or(Ipv6Addr::UNSPECIFIED).octets(),
        },
        ipi6_ifindex: info.interface_index as libc::c_uint,
    };

    unsafe {
        let msg_ptr = buf.as_mut_ptr() as *mut libc::cmsghdr;
        (*msg_ptr).cmsg_level = libc::IPPROTO_IPV6;
        (*msg_ptr).cmsg_type = libc::IPV6_PKTINFO;
        (*msg_ptr).cmsg_len =
            libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as libc::size_t;
        let data = libc::CMSG_DATA(msg_ptr) as *mut libc::in6_pktinfo;
        data.write(pktinfo);
    }

    buf
}
