//! A work-stealing scheduler for short, run-to-completion tasks.
//!
//! What this crate provides:
//! - A fixed pool of worker threads, each with its own work-stealing deque,
//!   fed by a public queue for submissions from outside the pool.
//! - A nested wait protocol: a worker that waits on another task keeps
//!   executing queued work instead of blocking its thread.
//! - Two alternate dispatch strategies sharing the same machinery, one
//!   running tasks inline and one spawning a thread per task.
//! - Workers park on auto-reset events when idle rather than spinning, at
//!   the cost of some wake-up latency.
//!
//! The pool's worker count defaults to the platform's parallelism and can be
//! overridden with the `LIBASYNC_NUM_THREADS` environment variable.

mod core;
mod event;
mod schedulers;
mod task;
mod thread_pool;
mod wait;


pub use event::AutoResetEvent;
pub use schedulers::{InlineScheduler, Scheduler, ThreadScheduler};
pub use task::{TaskHandle, TaskRef};
pub use thread_pool::{
    ThreadPool, ThreadPoolBuilder, ThreadPoolId, WorkerHook, NUM_THREADS_VAR,
};
pub use wait::{set_thread_wait_handler, wait_for_task, WaitHandler};

use std::sync::OnceLock;

/// Schedule `body` through `scheduler` and return the wait handle.
pub fn schedule_with<S, F>(scheduler: &S, body: F) -> TaskHandle
where
    S: Scheduler + ?Sized,
    F: FnOnce() + Send + 'static,
{
    let (task, handle) = TaskRef::new(body);
    scheduler.schedule(task);
    handle
}

/// The process-wide thread pool, started on first use.
pub fn threadpool_scheduler() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| ThreadPool::builder().build())
}

pub fn inline_scheduler() -> &'static InlineScheduler {
    &InlineScheduler
}

pub fn thread_scheduler() -> &'static ThreadScheduler {
    &ThreadScheduler
}

/// Run `body` on the process-wide thread pool.
pub fn schedule_pool<F>(body: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    schedule_with(threadpool_scheduler(), body)
}

/// Run `body` synchronously on the calling thread.
pub fn schedule_inline<F>(body: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    schedule_with(inline_scheduler(), body)
}

/// Run `body` on a dedicated, freshly spawned thread.
pub fn schedule_per_thread<F>(body: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    schedule_with(thread_scheduler(), body)
}
