//! External collaborator interfaces (spec.md §1, §6): the generic task
//! scheduler and the memory allocator. Both are out of scope for this
//! crate's own implementation; only the surface they must expose is defined
//! here, as trait objects so the rest of the crate need not be generic over
//! an embedder-supplied scheduler type (mirroring how the teacher crate
//! keeps its own `Evented`/`event::Source` traits object-safe via
//! `SourceFd`-style adapters rather than threading a type parameter through
//! `Poll`).

use std::fmt;
use std::sync::Arc;

/// A scheduler-visible unit of execution with its own FIFO event queue
/// (Glossary: "Task").
pub trait Task: Send + Sync + fmt::Debug {
    /// Opaque identity, used only for equality/debugging by callers; the
    /// crate never interprets it.
    fn id(&self) -> u64;
}

/// A task handle as seen by this crate.
pub type TaskHandle = Arc<dyn Task>;

/// A unit of deferred work posted to a task's queue. Captures everything it
/// needs by closure; the scheduler's only job is to run it, once, on the
/// task's own thread-of-execution, in the order it was enqueued relative to
/// other actions posted to the same task (Glossary: "Event" carries
/// `(type, sender, action, arg, payload)" — here collapsed to a single
/// closure that already closes over sender/arg/payload).
pub type Action = Arc<dyn Fn() + Send + Sync>;

/// Required from the external task/event scheduler (spec.md §6).
pub trait TaskScheduler: Send + Sync {
    /// Enqueue `action` on `task`'s queue. FIFO relative to other actions
    /// sent to the same task.
    fn send(&self, task: &TaskHandle, action: Action);

    /// Like `send`, but additionally releases the caller's reference to
    /// `task` (spec.md §6: "additionally releases the caller's reference to
    /// `task`").
    fn send_and_detach(&self, task: TaskHandle, action: Action);

    /// Reference-count `task` up.
    fn attach(&self, task: &TaskHandle);

    /// Reference-count `task` down.
    fn detach(&self, task: &TaskHandle);
}

/// Tag identifying the logical context an allocation belongs to, so an
/// embedder's allocator can account / pool by purpose (spec.md §1: "memory
/// allocator (acquire/release fixed-size regions tagged to a context)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocTag {
    Socket,
    Request,
    Buffer,
}

/// Required from the external memory allocator (spec.md §6). The default,
/// used when an embedder has no pooled allocator to plug in, is the global
/// Rust allocator (`system.rs`).
pub trait Allocator: Send + Sync {
    fn get(&self, tag: AllocTag, size: usize) -> Option<*mut u8>;

    /// # Safety
    /// `ptr` must have been returned by `get` with the same `tag` and
    /// `size`, and not already released.
    unsafe fn put(&self, tag: AllocTag, ptr: *mut u8, size: usize);
}
