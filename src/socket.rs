//! The `Socket` type and its operations (spec.md §4.3), grounded on the
//! original's `isc_socket_t` and its `isc_socket_{bind,listen,accept,
//! connect,recv,send,recvmark,sendmark,cancel}` entry points, translated
//! into Rust ownership: the manual `references` counter of the original
//! becomes `Arc<Socket>`'s own strong count (attach = hold a clone, detach =
//! drop one), and final teardown becomes `Socket`'s `Drop` impl rather than
//! a hand-checked "if refs == 0" branch.
//!
//! Every `drive_*_locked` helper runs with the socket's state lock held but
//! never calls the scheduler directly — it appends to a `Completions` list
//! instead, which the caller posts only after releasing the lock. A
//! `TaskScheduler` is free to run actions inline on the calling thread (the
//! trait doesn't forbid it), and posting while still holding this socket's
//! own mutex would deadlock the moment a callback issued another request
//! against the same socket.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use log::{trace, warn};

use crate::addr::{self, socket_addr};
use crate::ancillary;
use crate::buffer::BufferList;
use crate::event::{CompletionEvent, EventAttrs, PacketInfo};
use crate::fd::{self, SockKind};
use crate::io_engine::{self, IoOutcome};
use crate::manager::{ManagerConfig, SocketManager};
use crate::scheduler::{Action, TaskHandle, TaskScheduler};
use crate::status::Status;

/// Where received bytes land. Wrapped in `Arc<Mutex<_>>` and shared with the
/// caller: the caller keeps a clone so it can read the data back out once
/// the completion fires, without this crate needing to hand the buffer back
/// inside the event itself (spec.md §4.3's recv event carries only
/// `bytes`/`status`/metadata, not the payload).
pub enum RecvTarget {
    Region(Box<[u8]>),
    BufferList(BufferList),
}

pub type SharedRecvTarget = Arc<Mutex<RecvTarget>>;

/// What a `Send`/`SendV`/`SendTo`/`SendToV` reads from. Shared so the same
/// buffer can be reused by the caller across one completion and the next
/// submission without a copy.
#[derive(Clone)]
pub enum SendSource {
    Region(Arc<[u8]>),
    BufferList(Arc<Mutex<BufferList>>),
}

/// One pending completion's destination: the task it's delivered to and the
/// callback invoked on that task's turn (Glossary: "Event" sender + action).
#[derive(Clone)]
pub struct Delivery {
    pub task: TaskHandle,
    pub callback: Arc<dyn Fn(CompletionEvent) + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    Recv,
    Send,
    Accept,
    Connect,
    All,
}

struct RecvRequest {
    delivery: Delivery,
    target: SharedRecvTarget,
    minimum: usize,
    bytes_so_far: usize,
    want_ancillary: bool,
}

struct SendRequest {
    delivery: Delivery,
    source: SendSource,
    dest: Option<SocketAddr>,
    bytes_so_far: usize,
    pktinfo: Option<PacketInfo>,
}

struct AcceptRequest {
    delivery: Delivery,
}

struct ConnectRequest {
    delivery: Delivery,
}

enum RecvItem {
    Data(RecvRequest),
    Mark(Delivery),
}

enum SendItem {
    Data(SendRequest),
    Mark(Delivery),
}

pub(crate) struct SocketState {
    fd: RawFd,
    kind: SockKind,
    listener: bool,
    connected: bool,
    connecting: bool,
    recv_result: Status,
    send_result: Status,
    recv_queue: VecDeque<RecvItem>,
    send_queue: VecDeque<SendItem>,
    accept_queue: VecDeque<AcceptRequest>,
    connect_req: Option<ConnectRequest>,
    pending_recv: bool,
    pending_send: bool,
    pending_accept: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    /// Extra one-byte scatter target appended to datagram receives so an
    /// oversize datagram is detectable via "bytes read > declared capacity"
    /// even on kernels that don't surface `MSG_TRUNC`.
    overflow_scratch: [u8; 1],
}

/// A managed, non-blocking socket. Always reached through an `Arc`; the
/// last `Arc` being dropped runs `Drop`, which marks the fd `ClosePending`
/// in the manager (if one was ever opened) and wakes the watcher to close
/// it, mirroring the original's refcount-to-zero teardown without a manual
/// counter.
pub struct Socket {
    manager: Weak<SocketManager>,
    scheduler: Arc<dyn TaskScheduler>,
    state: Mutex<SocketState>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Socket")
            .field("fd", &state.fd)
            .field("kind", &state.kind)
            .finish()
    }
}

/// Completions accumulated while the socket lock is held; posted to the
/// scheduler only once the lock is released (see module docs).
type Completions = Vec<(Delivery, CompletionEvent)>;

fn flush(scheduler: &Arc<dyn TaskScheduler>, completions: Completions) {
    for (delivery, event) in completions {
        let Delivery { task, callback } = delivery;
        let action: Action = Arc::new(move || callback(event.clone()));
        scheduler.send_and_detach(task, action);
    }
}

impl Socket {
    pub(crate) fn new_unbound(
        manager: Weak<SocketManager>,
        scheduler: Arc<dyn TaskScheduler>,
        kind: SockKind,
    ) -> Arc<Self> {
        Arc::new(Socket {
            manager,
            scheduler,
            state: Mutex::new(SocketState {
                fd: -1,
                kind,
                listener: false,
                connected: false,
                connecting: false,
                recv_result: Status::Success,
                send_result: Status::Success,
                recv_queue: VecDeque::new(),
                send_queue: VecDeque::new(),
                accept_queue: VecDeque::new(),
                connect_req: None,
                pending_recv: false,
                pending_send: false,
                pending_accept: false,
                local_addr: None,
                peer_addr: None,
                overflow_scratch: [0u8; 1],
            }),
        })
    }

    pub fn get_type(&self) -> SockKind {
        self.state.lock().unwrap().kind
    }

    fn manager(&self) -> Option<Arc<SocketManager>> {
        self.manager.upgrade()
    }

    fn ensure_fd(&self, state: &mut SocketState, addr: &SocketAddr) -> io::Result<RawFd> {
        if state.fd >= 0 {
            return Ok(state.fd);
        }
        let domain = fd::domain_of(addr);
        let new_fd = fd::new_socket(domain, state.kind)?;
        state.fd = new_fd;
        Ok(new_fd)
    }

    /// Binds to `addr`, creating the underlying fd if one doesn't exist yet
    /// and registering it with the manager.
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Status {
        let mut state = self.state.lock().unwrap();
        let fd = match self.ensure_fd(&mut state, &addr) {
            Ok(fd) => fd,
            Err(e) => return crate::status::bind_errno_to_status(&e),
        };
        let (ptr, len) = socket_addr(&addr);
        let res = unsafe { libc::bind(fd, ptr, len) };
        if res < 0 {
            return crate::status::bind_errno_to_status(&io::Error::last_os_error());
        }
        state.local_addr = Some(addr);
        drop(state);
        if let Some(manager) = self.manager() {
            manager.register(fd, self);
        }
        Status::Success
    }

    pub fn listen(&self, backlog: i32) -> Status {
        let mut state = self.state.lock().unwrap();
        if state.fd < 0 {
            return Status::Unexpected;
        }
        let res = unsafe { libc::listen(state.fd, backlog) };
        if res < 0 {
            return crate::status::bind_errno_to_status(&io::Error::last_os_error());
        }
        state.listener = true;
        Status::Success
    }

    pub fn accept(
        self: &Arc<Self>,
        task: TaskHandle,
        callback: Arc<dyn Fn(CompletionEvent) + Send + Sync>,
    ) -> Status {
        let delivery = Delivery { task, callback };
        let mut state = self.state.lock().unwrap();
        if !state.listener {
            return Status::Unexpected;
        }
        self.scheduler.attach(&delivery.task);
        state.accept_queue.push_back(AcceptRequest { delivery });
        let fd = state.fd;
        let mut completions = Vec::new();
        let watch = self.drive_accept_locked(&mut state, &mut completions);
        drop(state);
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
        Status::Success
    }

    pub fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        task: TaskHandle,
        callback: Arc<dyn Fn(CompletionEvent) + Send + Sync>,
    ) -> Status {
        let delivery = Delivery { task, callback };
        let mut state = self.state.lock().unwrap();
        let fd = match self.ensure_fd(&mut state, &addr) {
            Ok(fd) => fd,
            Err(e) => return crate::status::bind_errno_to_status(&e),
        };
        let (ptr, len) = socket_addr(&addr);
        let res = unsafe { libc::connect(fd, ptr, len) };
        let err = if res < 0 {
            Some(io::Error::last_os_error())
        } else {
            None
        };

        drop(state);
        if let Some(manager) = self.manager() {
            manager.register(fd, self);
        }
        let mut state = self.state.lock().unwrap();
        state.peer_addr = Some(addr);

        match err {
            None => {
                state.connected = true;
                drop(state);
                self.scheduler.attach(&delivery.task);
                flush(
                    &self.scheduler,
                    vec![(delivery, CompletionEvent::Connect { status: Status::Success })],
                );
                Status::Success
            }
            Some(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                state.connecting = true;
                self.scheduler.attach(&delivery.task);
                state.connect_req = Some(ConnectRequest { delivery });
                drop(state);
                self.apply_watch(fd, (false, true));
                Status::Success
            }
            Some(e) => {
                let status = crate::status::connect_errno_to_status(&e).unwrap_or(Status::Unexpected);
                drop(state);
                self.scheduler.attach(&delivery.task);
                flush(&self.scheduler, vec![(delivery, CompletionEvent::Connect { status })]);
                Status::Success
            }
        }
    }

    pub fn recv(
        self: &Arc<Self>,
        target: SharedRecvTarget,
        minimum: usize,
        want_ancillary: bool,
        task: TaskHandle,
        callback: Arc<dyn Fn(CompletionEvent) + Send + Sync>,
    ) -> Status {
        let delivery = Delivery { task, callback };
        let mut state = self.state.lock().unwrap();
        self.scheduler.attach(&delivery.task);
        state.recv_queue.push_back(RecvItem::Data(RecvRequest {
            delivery,
            target,
            minimum,
            bytes_so_far: 0,
            want_ancillary,
        }));
        let fd = state.fd;
        let mut completions = Vec::new();
        let watch = self.drive_recv_locked(&mut state, &mut completions);
        drop(state);
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
        Status::Success
    }

    pub fn send(
        self: &Arc<Self>,
        source: SendSource,
        dest: Option<SocketAddr>,
        pktinfo: Option<PacketInfo>,
        task: TaskHandle,
        callback: Arc<dyn Fn(CompletionEvent) + Send + Sync>,
    ) -> Status {
        let delivery = Delivery { task, callback };
        let mut state = self.state.lock().unwrap();
        self.scheduler.attach(&delivery.task);
        state.send_queue.push_back(SendItem::Data(SendRequest {
            delivery,
            source,
            dest,
            bytes_so_far: 0,
            pktinfo,
        }));
        let fd = state.fd;
        let mut completions = Vec::new();
        let watch = self.drive_send_locked(&mut state, &mut completions);
        drop(state);
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
        Status::Success
    }

    pub fn recv_mark(
        self: &Arc<Self>,
        task: TaskHandle,
        callback: Arc<dyn Fn(CompletionEvent) + Send + Sync>,
    ) -> Status {
        let delivery = Delivery { task, callback };
        let mut state = self.state.lock().unwrap();
        self.scheduler.attach(&delivery.task);
        state.recv_queue.push_back(RecvItem::Mark(delivery));
        let fd = state.fd;
        let mut completions = Vec::new();
        let watch = self.drive_recv_locked(&mut state, &mut completions);
        drop(state);
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
        Status::Success
    }

    pub fn send_mark(
        self: &Arc<Self>,
        task: TaskHandle,
        callback: Arc<dyn Fn(CompletionEvent) + Send + Sync>,
    ) -> Status {
        let delivery = Delivery { task, callback };
        let mut state = self.state.lock().unwrap();
        self.scheduler.attach(&delivery.task);
        state.send_queue.push_back(SendItem::Mark(delivery));
        let fd = state.fd;
        let mut completions = Vec::new();
        let watch = self.drive_send_locked(&mut state, &mut completions);
        drop(state);
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
        Status::Success
    }

    /// Cancels queued-but-not-yet-completed requests of `kind` belonging to
    /// `task` (every request in that category if `task` is `None`),
    /// delivering each a `Cancelled` completion. Requests belonging to other
    /// tasks are left queued, in their original relative order.
    pub fn cancel(&self, task: Option<TaskHandle>, kind: CancelKind) {
        let matches_task =
            |d: &Delivery| task.as_ref().map_or(true, |t| Arc::ptr_eq(&d.task, t));
        let mut completions = Vec::new();
        let fd;
        let watch;
        {
            let mut state = self.state.lock().unwrap();
            if matches!(kind, CancelKind::Recv | CancelKind::All) {
                let mut remaining = VecDeque::new();
                while let Some(item) = state.recv_queue.pop_front() {
                    let hit = match &item {
                        RecvItem::Data(req) => matches_task(&req.delivery),
                        RecvItem::Mark(delivery) => matches_task(delivery),
                    };
                    if !hit {
                        remaining.push_back(item);
                        continue;
                    }
                    match item {
                        RecvItem::Data(req) => completions.push((
                            req.delivery,
                            CompletionEvent::RecvDone {
                                status: Status::Cancelled,
                                bytes: 0,
                                from: None,
                                timestamp: None,
                                pktinfo: None,
                                attrs: EventAttrs::empty(),
                            },
                        )),
                        RecvItem::Mark(delivery) => completions.push((
                            delivery,
                            CompletionEvent::RecvMark { status: Status::Cancelled },
                        )),
                    }
                }
                state.recv_queue = remaining;
                if state.recv_queue.is_empty() {
                    state.pending_recv = false;
                }
            }
            if matches!(kind, CancelKind::Send | CancelKind::All) {
                let mut remaining = VecDeque::new();
                while let Some(item) = state.send_queue.pop_front() {
                    let hit = match &item {
                        SendItem::Data(req) => matches_task(&req.delivery),
                        SendItem::Mark(delivery) => matches_task(delivery),
                    };
                    if !hit {
                        remaining.push_back(item);
                        continue;
                    }
                    match item {
                        SendItem::Data(req) => completions.push((
                            req.delivery,
                            CompletionEvent::SendDone { status: Status::Cancelled, bytes: 0 },
                        )),
                        SendItem::Mark(delivery) => completions.push((
                            delivery,
                            CompletionEvent::SendMark { status: Status::Cancelled },
                        )),
                    }
                }
                state.send_queue = remaining;
                if state.send_queue.is_empty() {
                    state.pending_send = false;
                }
            }
            if matches!(kind, CancelKind::Accept | CancelKind::All) {
                let mut remaining = VecDeque::new();
                while let Some(req) = state.accept_queue.pop_front() {
                    if !matches_task(&req.delivery) {
                        remaining.push_back(req);
                        continue;
                    }
                    completions.push((
                        req.delivery,
                        CompletionEvent::NewConn { status: Status::Cancelled, socket: None, peer: None },
                    ));
                }
                state.accept_queue = remaining;
                if state.accept_queue.is_empty() {
                    state.pending_accept = false;
                }
            }
            if matches!(kind, CancelKind::Connect | CancelKind::All) {
                let hit = state.connect_req.as_ref().is_some_and(|req| matches_task(&req.delivery));
                if hit {
                    let req = state.connect_req.take().unwrap();
                    state.connecting = false;
                    completions.push((req.delivery, CompletionEvent::Connect { status: Status::Cancelled }));
                }
            }

            fd = state.fd;
            let read = if state.listener {
                !state.accept_queue.is_empty()
            } else {
                !state.recv_queue.is_empty()
            };
            let write = !state.send_queue.is_empty() || state.connecting;
            watch = (read, write);
        }
        // A poke is issued unconditionally, even when nothing in `kind`
        // actually matched `task`, so the Watcher always re-checks this fd's
        // interest set promptly rather than only on its next unrelated wakeup.
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
    }

    pub fn get_sock_name(&self) -> io::Result<SocketAddr> {
        let state = self.state.lock().unwrap();
        if let Some(addr) = state.local_addr {
            return Ok(addr);
        }
        addr::getsockname(state.fd)
    }

    pub fn get_peer_name(&self) -> io::Result<SocketAddr> {
        let state = self.state.lock().unwrap();
        if let Some(addr) = state.peer_addr {
            return Ok(addr);
        }
        addr::getpeername(state.fd)
    }

    fn apply_watch(&self, fd: RawFd, (read, write): (bool, bool)) {
        if fd < 0 {
            return;
        }
        if let Some(manager) = self.manager() {
            manager.update_watch(fd, read, write);
        }
    }

    /// Upper bound on how many buffers one `BufferList` gather/scatter folds
    /// into a single `iovec` array (spec.md §4.4's "capped by a configured
    /// maximum iovec count", `ManagerConfig::max_iovecs`). Falls back to the
    /// default if the manager has already been torn down.
    fn max_iovecs(&self) -> usize {
        self.manager()
            .map(|m| m.config.max_iovecs.max(1))
            .unwrap_or_else(|| ManagerConfig::default().max_iovecs)
    }

    /// Drains as much of the recv queue as can complete without blocking,
    /// appending each finished request's completion to `completions`.
    /// Returns the `(read, write)` interest the manager should now watch
    /// this fd for.
    fn drive_recv_locked(&self, state: &mut SocketState, completions: &mut Completions) -> (bool, bool) {
        loop {
            match state.recv_queue.front_mut() {
                None => return (false, state.pending_send),
                Some(RecvItem::Mark(_)) => {
                    if let Some(RecvItem::Mark(delivery)) = state.recv_queue.pop_front() {
                        let status = state.recv_result;
                        completions.push((delivery, CompletionEvent::RecvMark { status }));
                    }
                    continue;
                }
                Some(RecvItem::Data(_)) => {}
            }

            if !state.recv_result.is_success() {
                if let Some(RecvItem::Data(req)) = state.recv_queue.pop_front() {
                    let status = state.recv_result;
                    completions.push((
                        req.delivery,
                        CompletionEvent::RecvDone {
                            status,
                            bytes: 0,
                            from: None,
                            timestamp: None,
                            pktinfo: None,
                            attrs: EventAttrs::empty(),
                        },
                    ));
                    continue;
                }
            }

            let fd = state.fd;
            if fd < 0 {
                return (false, state.pending_send);
            }

            let req = match state.recv_queue.front_mut() {
                Some(RecvItem::Data(req)) => req,
                _ => unreachable!(),
            };

            let want_overflow = state.kind == SockKind::Datagram;
            let max_iovecs = self.max_iovecs();
            let mut target = req.target.lock().unwrap();
            let (outcome, bytes, from, ancillary_data, status) = {
                match &mut *target {
                    RecvTarget::Region(buf) => {
                        let tail = &mut buf[req.bytes_so_far..];
                        let capacity = tail.len();
                        let mut slices: Vec<&mut [u8]> = vec![tail];
                        if want_overflow {
                            slices.push(&mut state.overflow_scratch[..]);
                        }
                        let mut r = io_engine::doio_recv(fd, state.kind, &mut slices, req.want_ancillary);
                        if want_overflow && r.bytes > capacity {
                            r.bytes = capacity;
                            r.ancillary.attrs.insert(EventAttrs::TRUNCATED);
                        }
                        (r.outcome, r.bytes, r.from, r.ancillary, r.status)
                    }
                    RecvTarget::BufferList(list) => {
                        let cap = if want_overflow {
                            max_iovecs.saturating_sub(1).max(1)
                        } else {
                            max_iovecs
                        };
                        let mut slices: Vec<&mut [u8]> =
                            list.iter_mut().take(cap).map(|b| b.available_mut()).collect();
                        let capacity: usize = slices.iter().map(|s| s.len()).sum();
                        if want_overflow {
                            slices.push(&mut state.overflow_scratch[..]);
                        }
                        let mut r = io_engine::doio_recv(fd, state.kind, &mut slices, req.want_ancillary);
                        if want_overflow && r.bytes > capacity {
                            r.bytes = capacity;
                            r.ancillary.attrs.insert(EventAttrs::TRUNCATED);
                        }
                        if r.bytes > 0 {
                            list.advance(r.bytes);
                        }
                        (r.outcome, r.bytes, r.from, r.ancillary, r.status)
                    }
                }
            };
            drop(target);

            match outcome {
                IoOutcome::Soft => {
                    state.pending_recv = true;
                    return (true, state.pending_send);
                }
                IoOutcome::Eof | IoOutcome::Hard => {
                    state.pending_recv = false;
                    state.recv_result = status;
                    if let Some(RecvItem::Data(req)) = state.recv_queue.pop_front() {
                        completions.push((
                            req.delivery,
                            CompletionEvent::RecvDone {
                                status,
                                bytes: req.bytes_so_far,
                                from,
                                timestamp: None,
                                pktinfo: None,
                                attrs: ancillary_data.attrs,
                            },
                        ));
                    }
                    continue;
                }
                IoOutcome::Success if !status.is_success() => {
                    // An unrecognised negative `recvmsg` return (see
                    // `io_engine`'s module doc comment): no bytes were
                    // transferred, but the request must still be told.
                    state.pending_recv = false;
                    state.recv_result = status;
                    if let Some(RecvItem::Data(req)) = state.recv_queue.pop_front() {
                        completions.push((
                            req.delivery,
                            CompletionEvent::RecvDone {
                                status,
                                bytes: req.bytes_so_far,
                                from,
                                timestamp: None,
                                pktinfo: None,
                                attrs: ancillary_data.attrs,
                            },
                        ));
                    }
                    continue;
                }
                IoOutcome::Success => {
                    req.bytes_so_far += bytes;
                    let done = state.kind == SockKind::Datagram
                        || bytes == 0
                        || req.bytes_so_far >= req.minimum;
                    if !done {
                        state.pending_recv = true;
                        return (true, state.pending_send);
                    }
                    state.pending_recv = false;
                    if let Some(RecvItem::Data(req)) = state.recv_queue.pop_front() {
                        completions.push((
                            req.delivery,
                            CompletionEvent::RecvDone {
                                status: Status::Success,
                                bytes: req.bytes_so_far,
                                from,
                                timestamp: ancillary_data.timestamp,
                                pktinfo: ancillary_data.pktinfo,
                                attrs: ancillary_data.attrs,
                            },
                        ));
                    }
                    continue;
                }
            }
        }
    }

    fn drive_send_locked(&self, state: &mut SocketState, completions: &mut Completions) -> (bool, bool) {
        loop {
            match state.send_queue.front_mut() {
                None => return (state.pending_recv, false),
                Some(SendItem::Mark(_)) => {
                    if let Some(SendItem::Mark(delivery)) = state.send_queue.pop_front() {
                        let status = state.send_result;
                        completions.push((delivery, CompletionEvent::SendMark { status }));
                    }
                    continue;
                }
                Some(SendItem::Data(_)) => {}
            }

            if !state.send_result.is_success() {
                if let Some(SendItem::Data(req)) = state.send_queue.pop_front() {
                    let status = state.send_result;
                    completions.push((req.delivery, CompletionEvent::SendDone { status, bytes: 0 }));
                    continue;
                }
            }

            let fd = state.fd;
            if fd < 0 {
                return (state.pending_recv, false);
            }

            let req = match state.send_queue.front_mut() {
                Some(SendItem::Data(req)) => req,
                _ => unreachable!(),
            };

            let control = req.pktinfo.as_ref().map(ancillary::encode_pktinfo);
            let outcome = match &req.source {
                SendSource::Region(bytes) => {
                    let tail = &bytes[req.bytes_so_far..];
                    io_engine::doio_send(fd, &[tail], req.dest.as_ref(), control.as_deref())
                }
                SendSource::BufferList(list) => {
                    let guard = list.lock().unwrap();
                    let slices: Vec<&[u8]> =
                        guard.iter().take(self.max_iovecs()).map(|b| b.used()).collect();
                    io_engine::doio_send(fd, &slices, req.dest.as_ref(), control.as_deref())
                }
            };

            match outcome.outcome {
                IoOutcome::Soft => {
                    state.pending_send = true;
                    return (state.pending_recv, true);
                }
                IoOutcome::Hard | IoOutcome::Eof => {
                    state.pending_send = false;
                    state.send_result = outcome.status;
                    if let Some(SendItem::Data(req)) = state.send_queue.pop_front() {
                        completions.push((
                            req.delivery,
                            CompletionEvent::SendDone { status: state.send_result, bytes: req.bytes_so_far },
                        ));
                    }
                    continue;
                }
                IoOutcome::Success => {
                    req.bytes_so_far += outcome.bytes;
                    state.pending_send = false;
                    if let Some(SendItem::Data(req)) = state.send_queue.pop_front() {
                        completions.push((
                            req.delivery,
                            CompletionEvent::SendDone { status: Status::Success, bytes: req.bytes_so_far },
                        ));
                    }
                    continue;
                }
            }
        }
    }

    fn drive_accept_locked(&self, state: &mut SocketState, completions: &mut Completions) -> (bool, bool) {
        loop {
            if state.accept_queue.is_empty() {
                return (false, state.pending_send);
            }
            let fd = state.fd;
            let mut peer_storage: std::mem::MaybeUninit<libc::sockaddr_storage> =
                std::mem::MaybeUninit::uninit();
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let client_fd = unsafe {
                libc::accept4(
                    fd,
                    peer_storage.as_mut_ptr() as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if client_fd < 0 {
                let err = io::Error::last_os_error();
                if crate::status::is_soft_errno(&err) {
                    state.pending_accept = true;
                    return (true, state.pending_send);
                }
                warn!("sockloop: accept4 on fd {fd} failed: {err}");
                continue;
            }
            state.pending_accept = false;
            let peer = unsafe { addr::to_socket_addr(peer_storage.as_ptr()).ok() };

            let req = state.accept_queue.pop_front().unwrap();
            let client = Socket::new_unbound(self.manager.clone(), Arc::clone(&self.scheduler), state.kind);
            {
                let mut client_state = client.state.lock().unwrap();
                client_state.fd = client_fd;
                client_state.connected = true;
                client_state.peer_addr = peer;
            }
            if let Some(manager) = self.manager() {
                manager.register(client_fd, &client);
            }

            completions.push((
                req.delivery,
                CompletionEvent::NewConn { status: Status::Success, socket: Some(client), peer },
            ));
        }
    }

    fn drive_connect_locked(&self, state: &mut SocketState, completions: &mut Completions) -> (bool, bool) {
        let Some(req) = state.connect_req.take() else {
            return (state.pending_recv, false);
        };
        let fd = state.fd;
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        state.connecting = false;
        let status = if res < 0 || err != 0 {
            let io_err = io::Error::from_raw_os_error(if res < 0 {
                io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
            } else {
                err
            });
            crate::status::connect_errno_to_status(&io_err).unwrap_or(Status::Unexpected)
        } else {
            state.connected = true;
            Status::Success
        };
        completions.push((req.delivery, CompletionEvent::Connect { status }));
        (state.pending_recv, false)
    }

    /// Called by the watcher when `poll` reports this fd readable.
    pub(crate) fn on_readable(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        let fd = state.fd;
        trace!("sockloop: fd {fd} readable");
        let mut completions = Vec::new();
        let watch = if state.listener {
            self.drive_accept_locked(&mut state, &mut completions)
        } else {
            self.drive_recv_locked(&mut state, &mut completions)
        };
        drop(state);
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
    }

    /// Called by the watcher when `poll` reports this fd writable.
    pub(crate) fn on_writable(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        let fd = state.fd;
        trace!("sockloop: fd {fd} writable");
        let mut completions = Vec::new();
        let watch = if state.connecting {
            self.drive_connect_locked(&mut state, &mut completions)
        } else {
            self.drive_send_locked(&mut state, &mut completions)
        };
        drop(state);
        self.apply_watch(fd, watch);
        flush(&self.scheduler, completions);
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.state.lock().unwrap().fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let fd = self.state.get_mut().unwrap().fd;
        // A skeleton socket that never acquired an fd (e.g. an `Accept`
        // target cancelled before the peer connected) was never counted in
        // `nsockets`, so there's nothing to retire.
        if fd < 0 {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.retire(fd);
        }
    }
}
