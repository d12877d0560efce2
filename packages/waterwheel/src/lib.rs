//! Single-threaded cooperative fiber executor.
//!
//! A fiber is a `'static` future spawned onto an [`Executor`]. Fibers run on
//! the thread that calls [`Executor::run`], one at a time, each running
//! uninterrupted until it returns `Pending` (parks on some external wakeup)
//! or completes. There is no preemption and no work stealing; this crate is
//! deliberately not thread safe.
//!
//! Scheduling is strictly FIFO: fibers are queued in the order they are made
//! runnable and run in that order. Two properties follow that cooperative
//! code can lean on:
//!
//! - a fiber woken before another fiber yields runs before that yield
//!   returns, and
//! - [`yield_now`] puts the caller behind every currently runnable fiber.
//!
//! Wakeups are idempotent. Waking a fiber that is already queued does not
//! queue it twice, and waking a fiber that has completed is a no-op. Wakers
//! remain safe to call (and cheap to drop) after their fiber is gone.

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    mem::ManuallyDrop,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

/// Handle to a fiber executor. Cheap to clone; all clones drive the same run
/// queue, so a fiber may hold a clone and spawn siblings from inside itself.
#[derive(Default)]
pub struct Executor(Rc<Shared>);

#[derive(Default)]
struct Shared {
    // runnable fibers, front is next to run.
    run_queue: RefCell<VecDeque<Rc<Fiber>>>,
    // spawned minus completed.
    live: Cell<usize>,
}

// one spawned fiber.
struct Fiber {
    // the fiber's future. none once the fiber has completed. taken out of the
    // cell while being polled so the fiber's own waker may re-queue it.
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    // whether the fiber currently sits in the run queue. checked by wakeups
    // to keep them idempotent.
    queued: Cell<bool>,
    // weak so that wakers outliving the executor degrade to no-ops instead of
    // keeping the run queue alive.
    executor: Weak<Shared>,
}

impl Executor {
    /// Construct an executor with an empty run queue.
    pub fn new() -> Self {
        Executor::default()
    }

    /// Spawn a fiber at the back of the run queue.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let fiber = Rc::new(Fiber {
            future: RefCell::new(Some(Box::pin(future))),
            queued: Cell::new(true),
            executor: Rc::downgrade(&self.0),
        });
        self.0.live.set(self.0.live.get() + 1);
        self.0.run_queue.borrow_mut().push_back(fiber);
    }

    /// Run fibers in FIFO order until the run queue is empty.
    ///
    /// Returns the number of fibers that are still parked — `0` means every
    /// spawned fiber ran to completion, nonzero means some fiber is waiting
    /// on a wakeup that never came (or the caller intends to `run` again
    /// after arranging one).
    pub fn run(&self) -> usize {
        loop {
            let fiber = self.0.run_queue.borrow_mut().pop_front();
            let Some(fiber) = fiber else { break };
            fiber.queued.set(false);

            // take the future out so a self-wake during poll can re-queue the
            // fiber without touching the cell we are holding it in.
            let future = fiber.future.borrow_mut().take();
            let Some(mut future) = future else { continue };

            let waker = fiber_waker(&fiber);
            let mut cx = Context::from_waker(&waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    self.0.live.set(self.0.live.get() - 1);
                    trace!(live = self.0.live.get(), "fiber completed");
                }
                Poll::Pending => {
                    *fiber.future.borrow_mut() = Some(future);
                }
            }
        }
        self.0.live.get()
    }
}

impl Clone for Executor {
    fn clone(&self) -> Self {
        Executor(Rc::clone(&self.0))
    }
}

// make the fiber runnable, unless it is already queued or its executor is
// gone. never polls anything itself, so it is safe to call from anywhere,
// including from inside a poll of the same fiber.
fn schedule(fiber: &Rc<Fiber>) {
    let Some(shared) = fiber.executor.upgrade() else {
        return;
    };
    if fiber.queued.replace(true) {
        return;
    }
    shared.run_queue.borrow_mut().push_back(Rc::clone(fiber));
}

/// Put the current fiber at the back of the run queue and give every other
/// runnable fiber a turn before resuming.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

// ==== waker plumbing ====
//
// a waker is a reference-counted pointer to the fiber. the vtable functions
// touch the Rc count and the run queue, neither of which is thread safe:
// every waker must stay on the thread that runs the executor. wakers here
// only ever flow into waiter slots of other single-threaded structures
// polled by the same executor, which keeps that invariant.

fn fiber_waker(fiber: &Rc<Fiber>) -> Waker {
    let data = Rc::into_raw(Rc::clone(fiber)) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(data, VTABLE)) }
}

const VTABLE: &RawWakerVTable =
    &RawWakerVTable::new(vtable_clone, vtable_wake, vtable_wake_by_ref, vtable_drop);

unsafe fn vtable_clone(data: *const ()) -> RawWaker {
    let fiber = ManuallyDrop::new(Rc::from_raw(data as *const Fiber));
    RawWaker::new(Rc::into_raw(Rc::clone(&fiber)) as *const (), VTABLE)
}

unsafe fn vtable_wake(data: *const ()) {
    let fiber = Rc::from_raw(data as *const Fiber);
    schedule(&fiber);
}

unsafe fn vtable_wake_by_ref(data: *const ()) {
    let fiber = ManuallyDrop::new(Rc::from_raw(data as *const Fiber));
    schedule(&fiber);
}

unsafe fn vtable_drop(data: *const ()) {
    drop(Rc::from_raw(data as *const Fiber));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(log: &Rc<RefCell<Vec<u32>>>, event: u32) {
        log.borrow_mut().push(event);
    }

    #[test]
    fn fibers_run_in_spawn_order() {
        let exec = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let log = Rc::clone(&log);
            exec.spawn(async move { record(&log, i) });
        }
        assert_eq!(exec.run(), 0);
        assert_eq!(*log.borrow(), [0, 1, 2, 3]);
    }

    #[test]
    fn yield_now_runs_every_other_fiber_first() {
        let exec = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = Rc::clone(&log);
            exec.spawn(async move {
                record(&log, 1);
                yield_now().await;
                record(&log, 4);
            });
        }
        {
            let log = Rc::clone(&log);
            exec.spawn(async move {
                record(&log, 2);
                yield_now().await;
                record(&log, 5);
            });
        }
        {
            let log = Rc::clone(&log);
            exec.spawn(async move { record(&log, 3) });
        }
        assert_eq!(exec.run(), 0);
        assert_eq!(*log.borrow(), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn spawn_from_inside_a_fiber() {
        let exec = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let exec2 = exec.clone();
            let log = Rc::clone(&log);
            exec.spawn(async move {
                record(&log, 1);
                let log = Rc::clone(&log);
                exec2.spawn(async move { record(&log, 2) });
            });
        }
        assert_eq!(exec.run(), 0);
        assert_eq!(*log.borrow(), [1, 2]);
    }

    #[test]
    fn parked_fiber_counts_as_live() {
        let exec = Executor::new();
        exec.spawn(async {
            std::future::pending::<()>().await;
        });
        assert_eq!(exec.run(), 1);
    }

    #[test]
    fn woken_fiber_runs_before_yield_returns() {
        // a fiber made runnable before another fiber yields must get a turn
        // before that yield resolves.
        let exec = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let waker_slot: Rc<RefCell<Option<Waker>>> = Rc::new(RefCell::new(None));
        {
            let log = Rc::clone(&log);
            let waker_slot = Rc::clone(&waker_slot);
            exec.spawn(async move {
                // park until someone stashes our waker and wakes it.
                std::future::poll_fn(|cx| {
                    let mut slot = waker_slot.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(cx.waker().clone());
                        Poll::Pending
                    } else {
                        Poll::Ready(())
                    }
                })
                .await;
                record(&log, 2);
            });
        }
        {
            let log = Rc::clone(&log);
            let waker_slot = Rc::clone(&waker_slot);
            exec.spawn(async move {
                record(&log, 1);
                // double wake: the second is a no-op.
                let waker = waker_slot.borrow().clone().unwrap();
                waker.wake_by_ref();
                waker.wake();
                yield_now().await;
                record(&log, 3);
            });
        }
        assert_eq!(exec.run(), 0);
        assert_eq!(*log.borrow(), [1, 2, 3]);
    }
}
