//! In-process `TaskScheduler`/`Task` stand-in for driving end-to-end tests
//! against real non-blocking sockets without pulling in a real embedder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sockloop::{Action, Task, TaskHandle, TaskScheduler};

#[derive(Debug)]
pub struct TestTask {
    id: u64,
}

impl Task for TestTask {
    fn id(&self) -> u64 {
        self.id
    }
}

pub fn test_task() -> TaskHandle {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Arc::new(TestTask {
        id: NEXT.fetch_add(1, Ordering::Relaxed),
    })
}

/// Runs every posted action immediately, on whatever thread posted it
/// (often the watcher thread). Good enough to drive real socket I/O
/// end-to-end without reimplementing per-task queue ordering in the test
/// harness; attach/detach only track a live count for leak assertions.
#[derive(Debug, Default)]
pub struct InlineScheduler {
    attached: std::sync::atomic::AtomicI64,
}

impl InlineScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(InlineScheduler::default())
    }

    pub fn attached_count(&self) -> i64 {
        self.attached.load(Ordering::SeqCst)
    }
}

impl TaskScheduler for InlineScheduler {
    fn send(&self, _task: &TaskHandle, action: Action) {
        action();
    }

    fn send_and_detach(&self, task: TaskHandle, action: Action) {
        action();
        self.detach(&task);
    }

    fn attach(&self, _task: &TaskHandle) {
        self.attached.fetch_add(1, Ordering::SeqCst);
    }

    fn detach(&self, _task: &TaskHandle) {
        self.attached.fetch_sub(1, Ordering::SeqCst);
    }
}
