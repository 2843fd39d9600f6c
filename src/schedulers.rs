//! The three dispatch strategies behind a common trait.

use std::thread;

use crate::task::TaskRef;
use crate::thread_pool::ThreadPool;

/// Anything that can accept a task for execution.
pub trait Scheduler {
    /// Queue the task, or run it inline when queuing is no longer possible.
    fn schedule(&self, task: TaskRef);
}

impl Scheduler for ThreadPool {
    fn schedule(&self, task: TaskRef) {
        self.shared.schedule(task);
    }
}

/// Runs every task synchronously on the submitting thread.
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, task: TaskRef) {
        task.run();
    }
}

/// Spawns a fresh OS thread per task. No pooling; the thread exits when the
/// task returns.
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, task: TaskRef) {
        thread::Builder::new()
            .name("libasync-task".into())
            .spawn(move || task.run())
            .expect("failed to spawn task thread");
    }
}
