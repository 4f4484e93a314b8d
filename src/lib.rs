//! Asynchronous, multiplexed socket I/O over a dedicated readiness-watcher
//! thread, dispatching completions to an external task scheduler.
//!
//! A [`SocketManager`] owns a [`libc::poll`]-based Watcher thread and a
//! table of managed [`Socket`]s. Callers submit `Recv`/`Send`/`Accept`/
//! `Connect` requests; this crate performs the non-blocking syscalls when
//! the fd is ready and posts a [`CompletionEvent`] back to the caller's
//! [`scheduler::TaskScheduler`] once each request resolves. No request ever
//! blocks the caller's thread, and the Watcher thread never runs caller
//! code directly — it only ever posts work onto the scheduler.
//!
//! See `SPEC_FULL.md` in the repository root for the full behavioural
//! contract this crate implements.

#[macro_use]
mod macros;

mod addr;
mod ancillary;
mod buffer;
mod control;
mod event;
mod fd;
mod io_engine;
mod manager;
mod scheduler;
mod socket;
mod status;
mod system;
mod watcher;

pub use buffer::{Buffer, BufferList};
pub use event::{CompletionEvent, EventAttrs, PacketInfo, Timestamp};
pub use fd::SockKind;
pub use manager::{ManagerConfig, SocketManager};
pub use scheduler::{Action, AllocTag, Allocator, Task, TaskHandle, TaskScheduler};
pub use socket::{CancelKind, Delivery, RecvTarget, SendSource, SharedRecvTarget, Socket};
pub use status::Status;
pub use system::SystemAllocator;
