//! Tasks are the unit of work the scheduler moves around.
//!
//! A spawned task is split in two halves: a [`TaskRef`], the run side, which
//! the queues transport and a worker eventually consumes by calling `run`,
//! and a [`TaskHandle`], the wait side, which observes completion and can
//! register continuations.

use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::wait::wait_for_task;

/// An erased pointer to a heap task, together with the function that knows
/// how to execute it.
///
/// This is a deconstructed trait object: the true type of `pointer` is
/// `*const HeapTask<F>` for some closure type `F`, but we hide it and carry
/// the matching execute function instead. Each `TaskRef` **must** be executed
/// exactly once, or else the task's data leaks and its waiters never wake.
pub struct TaskRef {
    pointer: *const (),
    run_fn: unsafe fn(*const ()),
}

// The pointee is a HeapTask built from a Send closure and only ever touched
// by the thread that consumes the TaskRef.
unsafe impl Send for TaskRef {}

impl TaskRef {
    /// Move `body` to the heap and return the run and wait halves of the
    /// resulting task.
    pub fn new<F>(body: F) -> (TaskRef, TaskHandle)
    where
        F: FnOnce() + Send + 'static,
    {
        let core = Arc::new(TaskCore::new());
        let task = Box::new(HeapTask {
            core: Arc::clone(&core),
            body,
        });

        let task_ref = TaskRef {
            pointer: Box::into_raw(task) as *const (),
            run_fn: execute_heap_task::<F>,
        };

        (task_ref, TaskHandle { core })
    }

    /// Execute and consume the task.
    ///
    /// A panicking body is caught so that the executing worker returns to
    /// its scheduling loop; the task still completes and wakes its waiters.
    pub fn run(self) {
        unsafe { (self.run_fn)(self.pointer) }
    }
}

/// A task stored on the heap: the closure to run plus the completion record
/// shared with the handles.
struct HeapTask<F>
where
    F: FnOnce() + Send,
{
    core: Arc<TaskCore>,
    body: F,
}

unsafe fn execute_heap_task<F>(pointer: *const ())
where
    F: FnOnce() + Send + 'static,
{
    let task = Box::from_raw(pointer as *mut HeapTask<F>);
    let HeapTask { core, body } = *task;

    if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
        eprintln!("libasync: task body panicked");
    }

    core.finish();
}

/// The completion record of a task. Completion is published before the
/// continuations run, so a continuation can assume `ready()` is true by the
/// time it is invoked.
pub(crate) struct TaskCore {
    finished: AtomicBool,
    continuations: ContinuationList,
}

impl TaskCore {
    fn new() -> Self {
        TaskCore {
            finished: AtomicBool::new(false),
            continuations: ContinuationList::new(),
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.continuations.take_all(run_continuation);
    }

    /// Register a callback to run when the task completes. Runs it right away
    /// if the task is already done.
    pub(crate) fn on_finish(&self, callback: Continuation) {
        if self.ready() {
            callback();
            return;
        }

        self.continuations.push(callback);

        // `finish` may have drained the list between our check above and the
        // push. Whoever observes both the push and the finished flag drains
        // again; take_all hands each callback out exactly once.
        if self.finished.load(Ordering::SeqCst) {
            self.continuations.take_all(run_continuation);
        }
    }
}

fn run_continuation(callback: Continuation) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        eprintln!("libasync: completion continuation panicked");
    }
}

pub(crate) type Continuation = Box<dyn FnOnce() + Send>;

/// The wait side of a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    /// Whether the task has finished executing.
    pub fn ready(&self) -> bool {
        self.core.ready()
    }

    /// Register a callback invoked exactly once when the task completes
    /// (immediately, if it already has).
    pub fn on_finish<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.on_finish(Box::new(callback));
    }

    /// Block until the task completes, through the current thread's wait
    /// handler. On a pool worker this keeps executing other tasks instead of
    /// blocking the thread.
    pub fn wait(&self) {
        wait_for_task(self);
    }
}

/// A lock-free multi-producer list of completion callbacks.
///
/// Pushes may race with each other and with `take_all`; `take_all` swaps the
/// whole list out atomically, so each pushed callback is handed out to
/// exactly one drainer.
struct ContinuationList {
    head: AtomicPtr<Node>,
}

struct Node {
    callback: Option<Continuation>,
    next: *mut Node,
}

// Raw node pointers are only dereferenced by the thread that swapped them
// out; payloads are Send.
unsafe impl Send for ContinuationList {}
unsafe impl Sync for ContinuationList {}

impl ContinuationList {
    fn new() -> Self {
        ContinuationList {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, callback: Continuation) {
        let node = Box::into_raw(Box::new(Node {
            callback: Some(callback),
            next: ptr::null_mut(),
        }));

        unsafe {
            loop {
                let head = self.head.load(Ordering::Acquire);
                (*node).next = head;

                if self
                    .head
                    .compare_exchange(head, node, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    fn take_all(&self, mut each: impl FnMut(Continuation)) {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::SeqCst);

        // The swapped-out chain is now exclusively ours.
        while !node.is_null() {
            unsafe {
                let mut boxed = Box::from_raw(node);
                if let Some(callback) = boxed.callback.take() {
                    each(callback);
                }
                node = boxed.next;
            }
        }
    }
}

impl Drop for ContinuationList {
    fn drop(&mut self) {
        self.take_all(|callback| drop(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_marks_ready() {
        let (task, handle) = TaskRef::new(|| {});
        assert!(!handle.ready());
        task.run();
        assert!(handle.ready());
    }

    #[test]
    fn continuation_fires_on_completion() {
        let fired = Arc::new(AtomicUsize::new(0));

        let (task, handle) = TaskRef::new(|| {});
        let f = Arc::clone(&fired);
        handle.on_finish(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        task.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn continuation_after_completion_runs_immediately() {
        let (task, handle) = TaskRef::new(|| {});
        task.run();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        handle.on_finish(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_body_still_completes() {
        let (task, handle) = TaskRef::new(|| panic!("boom"));
        task.run();
        assert!(handle.ready());
    }

    #[test]
    fn continuations_observe_ready() {
        let (task, handle) = TaskRef::new(|| {});
        let observer = handle.clone();
        let saw_ready = Arc::new(AtomicBool::new(false));
        let s = Arc::clone(&saw_ready);
        handle.on_finish(move || {
            s.store(observer.ready(), Ordering::SeqCst);
        });

        task.run();
        assert!(saw_ready.load(Ordering::SeqCst));
    }
}
