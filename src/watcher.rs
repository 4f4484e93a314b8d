//! The Watcher thread: the single loop that owns `poll(2)` and dispatches
//! readiness to sockets (spec.md §4.2), grounded on the original's
//! `watcher()` thread function and on the teacher's
//! `src/sys/unix/selector/poll.rs` selector, which is the one era of `mio`
//! built directly on `poll` rather than `epoll`/`kqueue`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{error, trace};

use crate::control::ControlMsg;
use crate::fd::close_fd;
use crate::manager::{FdSlot, SocketManager};

/// Runs until a `Shutdown` control message arrives. Never holds a `Socket`
/// lock while blocked in `poll` — the snapshot of what to watch is taken
/// and released before the call, and readiness is dispatched by fd after
/// `poll` returns, relocking one socket at a time.
pub(crate) fn run(manager: Arc<SocketManager>) {
    let control_fd = manager.control.read_fd();

    loop {
        let mut pollfds = vec![libc::pollfd {
            fd: control_fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut watched_fds: Vec<RawFd> = Vec::new();

        {
            let state = manager.state.lock().unwrap();
            for fd in 0..=state.maxfd {
                let idx = fd as usize;
                if idx >= state.watch.len() {
                    continue;
                }
                let bits = state.watch[idx];
                if !bits.read && !bits.write {
                    continue;
                }
                let mut events = 0;
                if bits.read {
                    events |= libc::POLLIN;
                }
                if bits.write {
                    events |= libc::POLLOUT;
                }
                pollfds.push(libc::pollfd { fd, events, revents: 0 });
                watched_fds.push(fd);
            }
        }

        let ret = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("sockloop: poll failed: {err}");
            continue;
        }

        if pollfds[0].revents != 0 {
            let msgs = manager.control.drain(manager.config.control_drain_batch);
            if msgs.iter().any(|m| matches!(m, ControlMsg::Shutdown)) {
                trace!("sockloop: watcher received shutdown");
                return;
            }
        }

        for (i, fd) in watched_fds.iter().copied().enumerate() {
            let revents = pollfds[i + 1].revents;
            if revents == 0 {
                continue;
            }

            let socket = {
                let state = manager.state.lock().unwrap();
                match state.slots.get(fd as usize) {
                    Some(FdSlot::Managed(weak)) => weak.upgrade(),
                    _ => None,
                }
            };
            let Some(socket) = socket else { continue };

            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                socket.on_readable();
            }
            if revents & (libc::POLLOUT | libc::POLLERR) != 0 {
                socket.on_writable();
            }
        }

        close_pending(&manager);
    }
}

/// Sockets whose last reference was dropped are marked `ClosePending` by
/// `Socket::drop`; only the watcher ever calls `close(2)` on a managed fd,
/// so that a fd is never reused by the kernel while this thread might still
/// be about to `poll` it.
fn close_pending(manager: &Arc<SocketManager>) {
    let mut state = manager.state.lock().unwrap();
    for idx in 0..state.slots.len() {
        if matches!(state.slots[idx], FdSlot::ClosePending) {
            close_fd(idx as RawFd);
            state.slots[idx] = FdSlot::Closed;
            state.watch[idx] = Default::default();
        }
    }
}
