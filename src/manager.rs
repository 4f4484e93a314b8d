//! The socket manager: fd table, readiness-bit bookkeeping and the
//! lock/thread lifecycle around the Watcher (spec.md §4.1, §4.2), grounded
//! on the original's `isc_socketmgr_t` (`fds`, `fdstate`, `read_fds`,
//! `write_fds`, `maxfd`, `nsockets`, `refs`) and on the teacher's
//! `Poll`/registry split in `src/poll.rs`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use log::debug;

use crate::control::{ControlChannel, ControlMsg};
use crate::fd::SockKind;
use crate::scheduler::{Allocator, TaskScheduler};
use crate::socket::Socket;
use crate::watcher;

/// Tunables mirroring the teacher's deprecated `EventLoopBuilder`/`Config`
/// knobs, generalised from "number of `Token`s to preallocate" to the
/// analogous capacities this crate needs (spec.md's ambient configuration
/// surface).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on how many buffers a single `RecvV`/`SendV` will fold
    /// into one `iovec` array before falling back to chunked operations.
    pub max_iovecs: usize,
    /// How many control-channel frames the watcher drains in one pass
    /// before going back to `poll`.
    pub control_drain_batch: usize,
    /// Initial capacity reserved in the fd table and poll fd list.
    pub initial_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_iovecs: 16,
            control_drain_batch: 64,
            initial_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WatchBits {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

pub(crate) enum FdSlot {
    Closed,
    Managed(Weak<Socket>),
    ClosePending,
}

pub(crate) struct ManagerState {
    pub(crate) slots: Vec<FdSlot>,
    pub(crate) watch: Vec<WatchBits>,
    pub(crate) maxfd: i32,
    pub(crate) nsockets: usize,
    pub(crate) shutting_down: bool,
}

impl ManagerState {
    fn ensure_capacity(&mut self, fd: RawFd) {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || FdSlot::Closed);
            self.watch.resize_with(idx + 1, WatchBits::default);
        }
    }
}

/// Owns the fd table, the control channel and the Watcher thread. Always
/// handed out wrapped in an `Arc` (`create`); `Socket`s hold only a `Weak`
/// back-pointer to it, so the reference graph between a manager and its
/// sockets has exactly one owning direction (manager -> socket, via the fd
/// table) and one non-owning direction (socket -> manager).
pub struct SocketManager {
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) shutdown_cv: Condvar,
    pub(crate) control: ControlChannel,
    watcher: Mutex<Option<JoinHandle<()>>>,
    scheduler: Arc<dyn TaskScheduler>,
    allocator: Arc<dyn Allocator>,
    pub(crate) config: ManagerConfig,
}

impl SocketManager {
    pub fn create(
        scheduler: Arc<dyn TaskScheduler>,
        allocator: Arc<dyn Allocator>,
        config: ManagerConfig,
    ) -> io::Result<Arc<Self>> {
        let control = ControlChannel::new()?;
        let initial = config.initial_capacity;
        let manager = Arc::new(SocketManager {
            state: Mutex::new(ManagerState {
                slots: (0..initial).map(|_| FdSlot::Closed).collect(),
                watch: vec![WatchBits::default(); initial],
                maxfd: -1,
                nsockets: 0,
                shutting_down: false,
            }),
            shutdown_cv: Condvar::new(),
            control,
            watcher: Mutex::new(None),
            scheduler,
            allocator,
            config,
        });

        let thread_manager = Arc::clone(&manager);
        let handle = std::thread::Builder::new()
            .name("sockloop-watcher".into())
            .spawn(move || watcher::run(thread_manager))?;
        *manager.watcher.lock().unwrap() = Some(handle);

        Ok(manager)
    }

    pub fn create_socket(self: &Arc<Self>, kind: SockKind) -> Arc<Socket> {
        Socket::new_unbound(Arc::downgrade(self), Arc::clone(&self.scheduler), kind)
    }

    /// Blocks until every socket the caller created has been detached, then
    /// shuts the watcher thread down and closes the control channel.
    pub fn destroy(self: Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.shutting_down = true;
            while state.nsockets != 0 {
                state = self.shutdown_cv.wait(state).unwrap();
            }
        }
        self.control.poke(ControlMsg::Shutdown);
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            let _ = handle.join();
        }

        // The watcher may have exited on the same wakeup that delivered the
        // last socket's close, without looping back around to actually
        // close it; make sure nothing managed is left open.
        let mut state = self.state.lock().unwrap();
        for idx in 0..state.slots.len() {
            if matches!(state.slots[idx], FdSlot::ClosePending) {
                crate::fd::close_fd(idx as RawFd);
                state.slots[idx] = FdSlot::Closed;
            }
        }
    }

    pub(crate) fn scheduler(&self) -> Arc<dyn TaskScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub(crate) fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    /// Inserts `socket` at `fd` as `Managed` and bumps `nsockets`. Called
    /// once a socket's fd is actually created (at `Bind`/`Connect`/a
    /// completed `Accept`), never at `create_socket` time, since a skeleton
    /// socket awaiting `Accept` has no fd yet.
    ///
    /// Idempotent per fd: `Bind` followed by `Connect` on the same socket
    /// (binding a source port before connecting out) ensures the same fd
    /// twice, and registering it twice must not double-count `nsockets` —
    /// `Socket`'s `Drop` retires a given fd exactly once.
    pub(crate) fn register(&self, fd: RawFd, socket: &Arc<Socket>) {
        let mut state = self.state.lock().unwrap();
        state.ensure_capacity(fd);
        let already_managed = matches!(state.slots[fd as usize], FdSlot::Managed(_));
        state.slots[fd as usize] = FdSlot::Managed(Arc::downgrade(socket));
        if !already_managed {
            state.nsockets += 1;
        }
        if fd > state.maxfd {
            state.maxfd = fd;
        }
        debug!("sockloop: registered fd {fd}, nsockets={}", state.nsockets);
    }

    /// Marks `fd` for close by the watcher and decrements `nsockets`; called
    /// from `Socket`'s `Drop` once its last reference goes away, with the
    /// invariant (upheld by `Socket`) that its request queues are already
    /// empty by that point.
    pub(crate) fn retire(&self, fd: RawFd) {
        let mut signal = false;
        {
            let mut state = self.state.lock().unwrap();
            if fd >= 0 && (fd as usize) < state.slots.len() {
                state.slots[fd as usize] = FdSlot::ClosePending;
                state.watch[fd as usize] = WatchBits::default();
            }
            if state.nsockets > 0 {
                state.nsockets -= 1;
            }
            if state.shutting_down && state.nsockets == 0 {
                signal = true;
            }
        }
        if fd >= 0 {
            self.control.poke(ControlMsg::Poke(fd));
        }
        if signal {
            self.shutdown_cv.notify_all();
        }
    }

    /// Updates the read/write interest bits for `fd` and wakes the watcher
    /// so it picks up the change on its next `poll` (spec.md §4.2).
    pub(crate) fn update_watch(&self, fd: RawFd, read: bool, write: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.ensure_capacity(fd);
            state.watch[fd as usize] = WatchBits { read, write };
        }
        self.control.poke(ControlMsg::Poke(fd));
    }
}
