//! The pool scheduler: construction, configuration and teardown.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_deque::{Injector, Worker as WorkerQueue};
use crossbeam_utils::CachePadded;

use crate::core::{with_current_worker, worker_main, Shared, WaiterList, WorkerContext, WorkerSlot};
use crate::event::AutoResetEvent;
use crate::task::{TaskHandle, TaskRef};

static NEXT_THREADPOOL_ID: AtomicU32 = AtomicU32::new(0);

/// Environment variable overriding the default worker count.
pub const NUM_THREADS_VAR: &str = "LIBASYNC_NUM_THREADS";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadPoolId(u32);

/// A reference to a pool of worker threads.
///
/// Tasks scheduled from a pool worker go on that worker's own deque; tasks
/// scheduled from anywhere else go through the public queue. Teardown runs
/// either explicitly via [`ThreadPool::shut_down`] or when the last handle
/// to the pool is dropped.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
    teardown: Arc<TeardownGuard>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            num_threads: None,
            stack_size: None,
            start_handler: None,
            exit_handler: None,
        }
    }

    /// Queue `body` for execution on the pool.
    pub fn schedule<F>(&self, body: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (task, handle) = TaskRef::new(body);
        self.shared.schedule(task);
        handle
    }

    pub fn num_workers(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn id(&self) -> ThreadPoolId {
        self.shared.id
    }

    /// Stop the workers and drain the queues.
    ///
    /// Sets the shutdown flag, wakes every parked worker, joins the worker
    /// threads, then runs any task left in the public queue inline on the
    /// calling thread. Idempotent. Must not be called from one of this
    /// pool's own workers. Afterwards `schedule` runs tasks inline on the
    /// caller.
    pub fn shut_down(&self) {
        self.shared.shut_down();
    }
}

/// Runs the shutdown sequence when the last handle to a pool goes away.
///
/// Held by the pool handles but not by the workers, so the guard drops as
/// soon as user code lets go of the pool.
struct TeardownGuard {
    shared: Arc<Shared>,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        // A task can carry the last handle onto one of this pool's own
        // workers, which cannot join itself. Teardown is then left to the
        // process; the workers stay parked.
        let on_own_worker = with_current_worker(
            |worker| matches!(worker, Some(w) if w.shared.id == self.shared.id),
        );
        if !on_own_worker {
            self.shared.shut_down();
        }
    }
}

/// Called on a worker thread as it starts or exits.
pub trait WorkerHook: Send + Sync {
    fn run(&self, worker: usize);
}

impl<F> WorkerHook for F
where
    F: Fn(usize) + Send + Sync + 'static,
{
    fn run(&self, worker: usize) {
        self(worker)
    }
}

pub(crate) struct PoolHooks {
    pub(crate) start: Option<Box<dyn WorkerHook>>,
    pub(crate) exit: Option<Box<dyn WorkerHook>>,
}

pub struct ThreadPoolBuilder {
    num_threads: Option<usize>,
    stack_size: Option<usize>,
    start_handler: Option<Box<dyn WorkerHook>>,
    exit_handler: Option<Box<dyn WorkerHook>>,
}

impl ThreadPoolBuilder {
    /// Use exactly `num_threads` workers instead of the default policy.
    pub fn with_worker_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads.max(1));
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.start_handler = Some(Box::new(handler));
        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> ThreadPool {
        let num_threads = self.num_threads.unwrap_or_else(default_num_threads);

        let mut slots = Vec::with_capacity(num_threads);
        let mut queues = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let queue = WorkerQueue::new_lifo();
            slots.push(CachePadded::new(WorkerSlot {
                stealer: queue.stealer(),
                event: Arc::new(AutoResetEvent::new()),
            }));
            queues.push(Some(queue));
        }

        let shared = Arc::new(Shared {
            slots,
            injector: Injector::new(),
            waiters: WaiterList::with_capacity(num_threads),
            shutdown: AtomicBool::new(false),
            id: ThreadPoolId(NEXT_THREADPOOL_ID.fetch_add(1, Ordering::Relaxed)),
            handles: Mutex::new(Vec::with_capacity(num_threads)),
            hooks: PoolHooks {
                start: self.start_handler,
                exit: self.exit_handler,
            },
        });

        for index in 0..num_threads {
            let ctx = WorkerContext::new(
                index,
                queues[index].take().unwrap(),
                Arc::clone(&shared),
            );

            let mut builder =
                thread::Builder::new().name(format!("libasync-worker-{}", index));
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }

            // A partial pool is not usable, treat spawn failure as fatal.
            let handle = builder
                .spawn(move || worker_main(ctx))
                .expect("failed to spawn worker thread");
            shared.handles.lock().unwrap().push(handle);
        }

        ThreadPool {
            shared: Arc::clone(&shared),
            teardown: Arc::new(TeardownGuard { shared }),
        }
    }
}

fn default_num_threads() -> usize {
    resolve_num_threads(std::env::var(NUM_THREADS_VAR).ok().as_deref())
}

/// Worker count policy: the environment wins when it parses as an integer,
/// with values below one clamped to one; anything unparseable falls back to
/// the platform's reported parallelism.
pub(crate) fn resolve_num_threads(var: Option<&str>) -> usize {
    if let Some(n) = var.and_then(|s| s.trim().parse::<i64>().ok()) {
        return n.max(1) as usize;
    }

    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_from_env_value() {
        assert_eq!(resolve_num_threads(Some("3")), 3);
        assert_eq!(resolve_num_threads(Some(" 8 ")), 8);
    }

    #[test]
    fn thread_count_clamps_to_one() {
        assert_eq!(resolve_num_threads(Some("0")), 1);
        assert_eq!(resolve_num_threads(Some("-4")), 1);
    }

    #[test]
    fn malformed_thread_count_falls_back() {
        let fallback = resolve_num_threads(None);
        assert!(fallback >= 1);
        assert_eq!(resolve_num_threads(Some("lots")), fallback);
        assert_eq!(resolve_num_threads(Some("")), fallback);
        assert_eq!(resolve_num_threads(Some("99999999999999999999")), fallback);
    }
}
