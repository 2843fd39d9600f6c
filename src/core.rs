//! Shared scheduler state and the worker main loop.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use crossbeam_utils::{Backoff, CachePadded};

use crate::event::AutoResetEvent;
use crate::task::TaskRef;
use crate::thread_pool::{PoolHooks, ThreadPoolId};
use crate::wait;

/// Data accessible by all workers and by submitting threads.
pub(crate) struct Shared {
    /// One slot per worker, cache-line aligned so that thieves hammering one
    /// worker's stealer don't invalidate its neighbours.
    pub(crate) slots: Vec<CachePadded<WorkerSlot>>,

    /// Queue for tasks submitted from outside the pool.
    pub(crate) injector: Injector<TaskRef>,

    /// Parked workers waiting for a submission.
    pub(crate) waiters: WaiterList,

    pub(crate) shutdown: AtomicBool,

    pub(crate) id: ThreadPoolId,

    pub(crate) handles: Mutex<Vec<JoinHandle<()>>>,

    pub(crate) hooks: PoolHooks,
}

/// The externally visible half of a worker: its stealer and its park event.
pub(crate) struct WorkerSlot {
    pub(crate) stealer: Stealer<TaskRef>,
    pub(crate) event: Arc<AutoResetEvent>,
}

impl Shared {
    /// Queue a task and wake one parked worker, if any.
    pub(crate) fn schedule(&self, task: TaskRef) {
        profiling::scope!("schedule");

        // After teardown the contract degrades to running inline on the caller.
        if self.shutdown.load(Ordering::Acquire) {
            task.run();
            return;
        }

        let mut task = Some(task);
        with_current_worker(|worker| {
            if let Some(worker) = worker {
                // A worker of another pool is an outside submitter here.
                if worker.shared.id == self.id {
                    worker.queue.push(task.take().unwrap());
                }
            }
        });
        if let Some(task) = task {
            self.injector.push(task);
        }

        // Pairs with the fence in the park sequence: a parking worker either
        // shows up in the waiter list here, or sees the push above in its
        // post-registration recheck.
        atomic::fence(Ordering::SeqCst);

        // Unsynchronized emptiness hint; the pop below rechecks under the lock.
        if self.waiters.is_empty() {
            return;
        }

        if let Some(event) = self.waiters.pop() {
            event.signal();
        }
    }

    pub(crate) fn pop_public(&self) -> Option<TaskRef> {
        let backoff = Backoff::new();
        for _ in 0..50 {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => backoff.spin(),
            }
        }

        // Still contended after the retry budget. Callers treat this like an
        // empty queue and recheck before parking.
        None
    }

    /// Whether any queue other than worker `skip`'s own holds a task.
    pub(crate) fn has_ready_work(&self, skip: usize) -> bool {
        if !self.injector.is_empty() {
            return true;
        }
        self.slots
            .iter()
            .enumerate()
            .any(|(i, slot)| i != skip && !slot.stealer.is_empty())
    }

    /// Stop the workers and drain the public queue.
    ///
    /// Sets the shutdown flag once, wakes every registered waiter, joins the
    /// worker threads, then runs whatever is left in the public queue inline
    /// on the calling thread. Idempotent.
    pub(crate) fn shut_down(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            for event in self.waiters.drain() {
                event.signal();
            }
        }

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        // Workers drain their own deques before exiting, so whatever is left
        // sits in the public queue. The workers are gone by now, so pops
        // cannot be contended into a spurious None.
        while let Some(task) = self.pop_public() {
            task.run();
        }
    }
}

/// The set of parked workers, each represented by its event.
///
/// An entry means "this worker is, or is about to be, parked and wants a
/// wake-up on the next submission".
pub(crate) struct WaiterList {
    events: Mutex<Vec<Arc<AutoResetEvent>>>,
    len: AtomicUsize,
}

impl WaiterList {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        WaiterList {
            events: Mutex::new(Vec::with_capacity(capacity)),
            len: AtomicUsize::new(0),
        }
    }

    /// Racy fast path. A true result is only a hint.
    pub(crate) fn is_empty(&self) -> bool {
        self.len.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn register(&self, event: &Arc<AutoResetEvent>) {
        let mut events = self.events.lock().unwrap();
        events.push(Arc::clone(event));
        self.len.store(events.len(), Ordering::SeqCst);
    }

    /// Remove `event` if still present. No-op when a waker already popped it.
    pub(crate) fn remove(&self, event: &Arc<AutoResetEvent>) {
        let mut events = self.events.lock().unwrap();
        events.retain(|e| !Arc::ptr_eq(e, event));
        self.len.store(events.len(), Ordering::SeqCst);
    }

    pub(crate) fn pop(&self) -> Option<Arc<AutoResetEvent>> {
        let mut events = self.events.lock().unwrap();
        let event = events.pop();
        self.len.store(events.len(), Ordering::SeqCst);
        event
    }

    pub(crate) fn drain(&self) -> Vec<Arc<AutoResetEvent>> {
        let mut events = self.events.lock().unwrap();
        self.len.store(0, Ordering::SeqCst);
        std::mem::take(&mut *events)
    }
}

/// The worker-owned half of a pool thread: its deque and steal order rng.
pub(crate) struct WorkerContext {
    pub(crate) index: usize,
    pub(crate) queue: WorkerQueue<TaskRef>,
    rng: RefCell<fastrand::Rng>,
    pub(crate) shared: Arc<Shared>,
}

impl WorkerContext {
    pub(crate) fn new(index: usize, queue: WorkerQueue<TaskRef>, shared: Arc<Shared>) -> Self {
        WorkerContext {
            index,
            queue,
            // Seeding with the index gives each worker its own steal order.
            rng: RefCell::new(fastrand::Rng::with_seed(index as u64)),
            shared,
        }
    }

    pub(crate) fn event(&self) -> &Arc<AutoResetEvent> {
        &self.shared.slots[self.index].event
    }

    /// One round over the other workers, in an order drawn from our own rng
    /// so that idle workers don't all converge on the same victim.
    pub(crate) fn steal(&self) -> Option<TaskRef> {
        let slots = &self.shared.slots;
        let mut victims: Vec<usize> = (0..slots.len()).collect();
        self.rng.borrow_mut().shuffle(&mut victims);

        for victim in victims {
            if victim == self.index {
                continue;
            }

            // Give up on a persistently contended victim and move on.
            let backoff = Backoff::new();
            for _ in 0..50 {
                match slots[victim].stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => backoff.spin(),
                }
            }
        }

        // A task pushed mid-round may have been missed; its submitter wakes a
        // worker, so it is not stranded.
        None
    }

    fn run(&self) {
        let shared = &self.shared;

        'main: loop {
            while let Some(task) = self.queue.pop() {
                task.run();
            }

            loop {
                if let Some(task) = shared.pop_public() {
                    task.run();
                    break;
                }

                // Local and public queues are empty, safe to stop.
                if shared.shutdown.load(Ordering::Acquire) {
                    break 'main;
                }

                if let Some(task) = self.steal() {
                    task.run();
                    break;
                }

                // Park sequence: reset, register, fence, recheck, wait. The
                // registration goes first so that a submission either sees us
                // in the waiter list and signals, or happened early enough
                // that the rechecks below see its task.
                let event = self.event();
                event.reset();
                shared.waiters.register(event);
                atomic::fence(Ordering::SeqCst);

                if shared.shutdown.load(Ordering::SeqCst) {
                    shared.waiters.remove(event);
                    break 'main;
                }
                if shared.has_ready_work(self.index) {
                    shared.waiters.remove(event);
                    continue;
                }

                event.wait();
                shared.waiters.remove(event);
            }
        }

        // Only this worker pushes to its own deque, and every exit path above
        // runs with the deque drained.
        debug_assert!(self.queue.is_empty());
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<*const WorkerContext> = const { Cell::new(ptr::null()) };
}

/// Run `f` with the current thread's pool worker context, or `None` when the
/// current thread is not a pool worker. A single TLS load.
pub(crate) fn with_current_worker<R>(f: impl FnOnce(Option<&WorkerContext>) -> R) -> R {
    CURRENT_WORKER.with(|current| {
        let pointer = current.get();
        if pointer.is_null() {
            f(None)
        } else {
            // Only set by worker_main for the duration of the worker's life
            // on its own thread.
            f(Some(unsafe { &*pointer }))
        }
    })
}

pub(crate) fn worker_main(ctx: WorkerContext) {
    profiling::register_thread!("libasync worker");

    let previous = wait::set_thread_wait_handler(wait::threadpool_wait_handler);
    CURRENT_WORKER.with(|current| current.set(&ctx as *const WorkerContext));

    if let Some(hook) = &ctx.shared.hooks.start {
        hook.run(ctx.index);
    }

    ctx.run();

    if let Some(hook) = &ctx.shared.hooks.exit {
        hook.run(ctx.index);
    }

    CURRENT_WORKER.with(|current| current.set(ptr::null()));
    wait::set_thread_wait_handler(previous);
}
