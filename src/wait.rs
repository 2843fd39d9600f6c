//! Per-thread wait handlers.
//!
//! `wait_for_task` blocks until a task completes. How it blocks depends on
//! the calling thread: pool workers keep running other tasks instead of
//! blocking their thread, everyone else parks on a local event.

use std::cell::Cell;
use std::sync::atomic::{self, Ordering};
use std::sync::Arc;

use crate::core::{with_current_worker, WorkerContext};
use crate::event::AutoResetEvent;
use crate::task::TaskHandle;

/// The function `wait_for_task` dispatches to on the current thread.
pub type WaitHandler = fn(&TaskHandle);

thread_local! {
    static WAIT_HANDLER: Cell<WaitHandler> = Cell::new(generic_wait_handler as WaitHandler);
}

/// Block until `task` completes, through the current thread's wait handler.
pub fn wait_for_task(task: &TaskHandle) {
    let handler = WAIT_HANDLER.with(|handler| handler.get());
    handler(task);
}

/// Install `handler` for the current thread and return the previous one.
///
/// Pool workers install the pumping handler at startup; other threads get
/// the parking one by default.
pub fn set_thread_wait_handler(handler: WaitHandler) -> WaitHandler {
    WAIT_HANDLER.with(|current| current.replace(handler))
}

/// Park the calling thread on a fresh event until the task completes.
pub(crate) fn generic_wait_handler(task: &TaskHandle) {
    if task.ready() {
        return;
    }

    let event = Arc::new(AutoResetEvent::new());
    let ev = Arc::clone(&event);
    task.on_finish(move || ev.signal());
    event.wait();
}

/// Keep executing other tasks until the waited task completes, parking only
/// when there is nothing to run. Falls back to the parking handler if the
/// calling thread turns out not to be a pool worker.
pub(crate) fn threadpool_wait_handler(task: &TaskHandle) {
    with_current_worker(|worker| match worker {
        Some(worker) => nested_wait(worker, task),
        None => generic_wait_handler(task),
    })
}

fn nested_wait(worker: &WorkerContext, task: &TaskHandle) {
    profiling::scope!("wait_for_task");

    let shared = &worker.shared;
    let event = worker.event();
    let mut continuation_added = false;

    loop {
        if task.ready() {
            return;
        }

        if let Some(t) = worker.queue.pop() {
            t.run();
            continue;
        }

        loop {
            if let Some(t) = shared.pop_public() {
                t.run();
                break;
            }

            if let Some(t) = worker.steal() {
                t.run();
                break;
            }

            // Same park sequence as the worker main loop, with the waited
            // task's completion as a second wake source on the same event.
            event.reset();
            shared.waiters.register(event);
            atomic::fence(Ordering::SeqCst);

            if task.ready() {
                shared.waiters.remove(event);
                return;
            }

            // Attach the continuation lazily and at most once, now that we
            // are committed to parking.
            if !continuation_added {
                let ev = Arc::clone(event);
                task.on_finish(move || ev.signal());
                continuation_added = true;
            }

            if shared.has_ready_work(worker.index) {
                shared.waiters.remove(event);
                continue;
            }

            event.wait();
            shared.waiters.remove(event);

            if task.ready() {
                return;
            }
        }
    }
}
