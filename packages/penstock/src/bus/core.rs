// channel core: one bounded queue of messages plus the park/wake machinery.
//
// this layer carries all of the unsafety. it exposes an interface that is
// safe and panic-free but inconvenient; the api module wraps it into the
// public bus surface.
//
// every mutation here happens in a single borrow of the channel state, with
// no suspension point inside, so each operation is atomic with respect to
// the cooperative scheduler. the only two places a fiber can lose the cpu
// are the `Parked` future (after linking a waiter) and the yield inside the
// close protocol's drain loop.

use super::{
    error::{NoChannelError, TryError, WouldBlockError},
    waiter_queue::{WaiterHandle, WaiterQueue},
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};


// spare waiter node allocations kept per channel, so the steady-state park
// path does not allocate.
const WAITER_POOL_SIZE: usize = 4;


// shared handle to one channel.
pub(crate) struct Chan(Rc<RefCell<State>>);

// channel state.
struct State {
    // maximum queue length. positive.
    capacity: usize,
    // buffered messages, front is oldest.
    queue: VecDeque<u32>,
    // fibers parked until the channel is not full.
    send_waiters: WaiterQueue,
    // fibers parked until the channel is not empty.
    recv_waiters: WaiterQueue,
    // monotonic false -> true. once set, nothing new is enqueued and no new
    // waiter is linked through the blocking loops (their retry observes the
    // flag first).
    closed: bool,
    // pool of spare unlinked waiter nodes.
    pool: [Option<WaiterHandle>; WAITER_POOL_SIZE],
}

// which waiter queue a parked fiber sits in.
#[derive(Copy, Clone)]
pub(crate) enum Side {
    Send,
    Recv,
}

impl Chan {
    // construct an open channel with an empty queue.
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Chan(Rc::new(RefCell::new(State {
            capacity: capacity.get(),
            queue: VecDeque::with_capacity(capacity.get()),
            send_waiters: WaiterQueue::new(),
            recv_waiters: WaiterQueue::new(),
            closed: false,
            pool: [None, None, None, None],
        })))
    }

    // whether two handles refer to the same channel.
    pub(crate) fn same_channel(a: &Chan, b: &Chan) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    pub(crate) fn is_full(&self) -> bool {
        let st = self.0.borrow();
        st.queue.len() == st.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.0.borrow().queue.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.0.borrow().capacity
    }

    // ==== non-blocking operations ====

    // append one message, or fail without side effects. on success, notifies
    // the receiver at the front of the recv waiter queue, if any.
    pub(crate) fn try_send(&self, value: u32) -> Result<(), TryError> {
        let mut st = self.0.borrow_mut();
        if st.closed {
            return Err(NoChannelError.into());
        }
        if st.queue.len() == st.capacity {
            return Err(WouldBlockError.into());
        }
        st.queue.push_back(value);
        debug_assert!(st.queue.len() <= st.capacity);
        st.recv_waiters.wake_front();
        Ok(())
    }

    // pop the oldest message, or fail without side effects. a closed channel
    // still drains: only closed-and-empty reports the channel as gone. on
    // success, notifies the sender at the front of the send waiter queue.
    pub(crate) fn try_recv(&self) -> Result<u32, TryError> {
        let mut st = self.0.borrow_mut();
        let Some(value) = st.queue.pop_front() else {
            return Err(if st.closed {
                TryError::from(NoChannelError)
            } else {
                TryError::from(WouldBlockError)
            });
        };
        st.send_waiters.wake_front();
        Ok(value)
    }

    // append up to `values.len()` messages, bounded by free capacity, in
    // order. fails without side effects if the channel is closed or full;
    // otherwise moves at least one message (given a non-empty input) and
    // notifies the front receiver once.
    #[cfg(feature = "batch")]
    pub(crate) fn try_send_batch(&self, values: &[u32]) -> Result<usize, TryError> {
        let mut st = self.0.borrow_mut();
        if st.closed {
            return Err(NoChannelError.into());
        }
        let free = st.capacity - st.queue.len();
        if free == 0 {
            return Err(WouldBlockError.into());
        }
        let moved = values.len().min(free);
        st.queue.extend(&values[..moved]);
        debug_assert!(st.queue.len() <= st.capacity);
        if moved > 0 {
            st.recv_waiters.wake_front();
        }
        Ok(moved)
    }

    // pop up to `out.len()` messages, bounded by queue length, in order.
    // fails without side effects if nothing is buffered; otherwise moves at
    // least one message (given a non-empty output buffer) and notifies the
    // front sender once.
    #[cfg(feature = "batch")]
    pub(crate) fn try_recv_batch(&self, out: &mut [u32]) -> Result<usize, TryError> {
        let mut st = self.0.borrow_mut();
        if st.queue.is_empty() {
            return Err(if st.closed {
                TryError::from(NoChannelError)
            } else {
                TryError::from(WouldBlockError)
            });
        }
        let mut moved = 0;
        while moved < out.len() {
            let Some(value) = st.queue.pop_front() else { break };
            out[moved] = value;
            moved += 1;
        }
        if moved > 0 {
            st.send_waiters.wake_front();
        }
        Ok(moved)
    }

    // ==== blocking operations ====
    //
    // each is the same condition loop: try, park on would-block, re-check on
    // resume. a woken fiber can never assume its condition still holds; the
    // wakeup may have been consumed by an interleaved peer, or the channel
    // may have closed. parking re-registers at the tail, which preserves
    // FIFO wakeup order across retries.

    pub(crate) async fn send(&self, value: u32) -> Result<(), NoChannelError> {
        loop {
            match self.try_send(value) {
                Ok(()) => {
                    self.chain_wake_send();
                    return Ok(());
                }
                Err(TryError::NoChannel(err)) => return Err(err),
                Err(TryError::WouldBlock(_)) => self.park(Side::Send).await,
            }
        }
    }

    pub(crate) async fn recv(&self) -> Result<u32, NoChannelError> {
        loop {
            match self.try_recv() {
                Ok(value) => {
                    self.chain_wake_recv();
                    return Ok(value);
                }
                Err(TryError::NoChannel(err)) => return Err(err),
                Err(TryError::WouldBlock(_)) => self.park(Side::Recv).await,
            }
        }
    }

    // blocking batch variants return the count moved by the first attempt
    // that made progress; callers wanting an exact total loop themselves.
    // this partial-transfer contract lets senders and receivers with
    // mismatched batch sizes make progress without deadlocking each other.

    #[cfg(feature = "batch")]
    pub(crate) async fn send_batch(&self, values: &[u32]) -> Result<usize, NoChannelError> {
        loop {
            match self.try_send_batch(values) {
                Ok(moved) => {
                    self.chain_wake_send();
                    return Ok(moved);
                }
                Err(TryError::NoChannel(err)) => return Err(err),
                Err(TryError::WouldBlock(_)) => self.park(Side::Send).await,
            }
        }
    }

    #[cfg(feature = "batch")]
    pub(crate) async fn recv_batch(&self, out: &mut [u32]) -> Result<usize, NoChannelError> {
        loop {
            match self.try_recv_batch(out) {
                Ok(moved) => {
                    self.chain_wake_recv();
                    return Ok(moved);
                }
                Err(TryError::NoChannel(err)) => return Err(err),
                Err(TryError::WouldBlock(_)) => self.park(Side::Recv).await,
            }
        }
    }

    // ==== wake plumbing ====

    // hand the wakeup chain onward after a completed send: if capacity is
    // still free and a sender is parked, that sender can proceed. outside
    // batch interleavings a free slot cannot coexist with parked senders,
    // so this usually finds nothing; batch transfers rely on it to drain
    // parked peers promptly.
    pub(crate) fn chain_wake_send(&self) {
        let mut st = self.0.borrow_mut();
        if st.queue.len() < st.capacity {
            st.send_waiters.wake_front();
        }
    }

    // symmetric hand-off after a completed recv.
    pub(crate) fn chain_wake_recv(&self) {
        let mut st = self.0.borrow_mut();
        if !st.queue.is_empty() {
            st.recv_waiters.wake_front();
        }
    }

    // park the calling fiber on one of this channel's waiter queues. the
    // future links a waiter node on first poll, resolves once the node is
    // notified, and unlinks on resolve or drop.
    pub(crate) fn park(&self, side: Side) -> Parked {
        Parked {
            chan: self.clone(),
            side,
            node: None,
        }
    }

    // ==== close protocol ====

    // set the closed flag and notify every parked fiber, in FIFO order, on
    // both queues. does not suspend; the caller follows up with
    // `drain_waiters`.
    pub(crate) fn start_close(&self) {
        let mut st = self.0.borrow_mut();
        st.closed = true;
        st.send_waiters.wake_all();
        st.recv_waiters.wake_all();
    }

    // yield until every woken fiber has resumed, observed the closed flag,
    // and unlinked its waiter. one scheduling round suffices on a FIFO
    // executor, but looping keeps the protocol correct on any executor.
    pub(crate) async fn drain_waiters(&self) {
        while self.has_waiters() {
            yield_once().await;
        }
    }

    fn has_waiters(&self) -> bool {
        let st = self.0.borrow();
        !st.send_waiters.is_empty() || !st.recv_waiters.is_empty()
    }
}

impl Clone for Chan {
    fn clone(&self) -> Self {
        Chan(Rc::clone(&self.0))
    }
}


// future for one stay in a waiter queue.
//
// the waiter node lives on the heap (pooled per channel) and is owned by
// this future; the channel only links to it. the node is linked on first
// poll and unlinked by this future on resume or drop, never by the channel,
// so the unlink-before-frame-exit ordering the queues rely on is enforced
// by `Drop` rather than by caller discipline.
pub(crate) struct Parked {
    chan: Chan,
    side: Side,
    // some iff the node is currently linked.
    node: Option<WaiterHandle>,
}

impl Future for Parked {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        let mut st = this.chan.0.borrow_mut();
        let st = &mut *st;
        let queue = match this.side {
            Side::Send => &mut st.send_waiters,
            Side::Recv => &mut st.recv_waiters,
        };
        match this.node.take() {
            None => {
                // first poll: link at the tail and suspend.
                let mut node = pool_take(&mut st.pool).unwrap_or_else(WaiterHandle::new);
                debug_assert!(!node.is_linked());
                // safety: the node is fresh or pooled, so it is unlinked.
                unsafe {
                    queue.push(&mut node);
                    queue.set_waker(&mut node, cx.waker().clone());
                }
                this.node = Some(node);
                Poll::Pending
            }
            Some(mut node) => {
                // safety: the node is linked, and only ever into `queue`.
                if unsafe { queue.is_notified(&node) } {
                    unsafe { queue.remove(&mut node) };
                    pool_put(&mut st.pool, node);
                    Poll::Ready(())
                } else {
                    // spurious poll: stay linked, refresh the waker.
                    unsafe { queue.set_waker(&mut node, cx.waker().clone()) };
                    this.node = Some(node);
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for Parked {
    fn drop(&mut self) {
        let Some(mut node) = self.node.take() else {
            return;
        };
        let mut st = self.chan.0.borrow_mut();
        let st = &mut *st;
        let queue = match self.side {
            Side::Send => &mut st.send_waiters,
            Side::Recv => &mut st.recv_waiters,
        };
        // safety: node is some iff linked, and only ever into `queue`.
        let notified = unsafe { queue.is_notified(&node) };
        unsafe { queue.remove(&mut node) };
        if notified {
            // this fiber consumed a wakeup it will never act on; pass it to
            // the next waiter so no state change goes unobserved.
            queue.wake_front();
        }
        pool_put(&mut st.pool, node);
    }
}

fn pool_take(pool: &mut [Option<WaiterHandle>; WAITER_POOL_SIZE]) -> Option<WaiterHandle> {
    pool.iter_mut().find_map(Option::take)
}

fn pool_put(pool: &mut [Option<WaiterHandle>; WAITER_POOL_SIZE], node: WaiterHandle) {
    debug_assert!(!node.is_linked());
    if let Some(slot) = pool.iter_mut().find(|slot| slot.is_none()) {
        *slot = Some(node);
    }
    // otherwise the node just drops and frees
}


// yield-once future: re-queue the calling fiber behind everything currently
// runnable, resume on the next turn. used by the close protocol's drain
// loop.
fn yield_once() -> YieldOnce {
    YieldOnce { yielded: false }
}

struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
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


#[cfg(test)]
mod tests {
    use super::*;

    fn chan(capacity: usize) -> Chan {
        Chan::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn try_send_fills_to_capacity_then_blocks() {
        let ch = chan(2);
        assert_eq!(ch.try_send(1), Ok(()));
        assert_eq!(ch.try_send(2), Ok(()));
        assert_eq!(ch.try_send(3), Err(WouldBlockError.into()));
        assert_eq!(ch.len(), 2);
    }

    #[test]
    fn try_recv_drains_in_fifo_order() {
        let ch = chan(3);
        for v in [10, 20, 30] {
            ch.try_send(v).unwrap();
        }
        assert_eq!(ch.try_recv(), Ok(10));
        assert_eq!(ch.try_recv(), Ok(20));
        assert_eq!(ch.try_recv(), Ok(30));
        assert_eq!(ch.try_recv(), Err(WouldBlockError.into()));
    }

    #[test]
    fn closed_channel_rejects_sends_but_drains_recvs() {
        let ch = chan(4);
        ch.try_send(7).unwrap();
        ch.start_close();
        assert_eq!(ch.try_send(8), Err(NoChannelError.into()));
        assert_eq!(ch.try_recv(), Ok(7));
        assert_eq!(ch.try_recv(), Err(NoChannelError.into()));
    }

    #[cfg(feature = "batch")]
    #[test]
    fn try_send_batch_moves_up_to_free_capacity() {
        let ch = chan(3);
        assert_eq!(ch.try_send_batch(&[1, 2, 3, 4, 5]), Ok(3));
        assert_eq!(ch.try_send_batch(&[4]), Err(WouldBlockError.into()));
        assert_eq!(ch.try_recv(), Ok(1));
        assert_eq!(ch.try_send_batch(&[4]), Ok(1));
    }

    #[cfg(feature = "batch")]
    #[test]
    fn try_recv_batch_moves_up_to_buffered_length() {
        let ch = chan(4);
        ch.try_send_batch(&[1, 2, 3]).unwrap();
        let mut out = [0; 8];
        assert_eq!(ch.try_recv_batch(&mut out), Ok(3));
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(ch.try_recv_batch(&mut out), Err(WouldBlockError.into()));
    }

    #[cfg(feature = "batch")]
    #[test]
    fn try_recv_batch_respects_output_length() {
        let ch = chan(4);
        ch.try_send_batch(&[1, 2, 3, 4]).unwrap();
        let mut out = [0; 2];
        assert_eq!(ch.try_recv_batch(&mut out), Ok(2));
        assert_eq!(out, [1, 2]);
        assert_eq!(ch.try_recv_batch(&mut out), Ok(2));
        assert_eq!(out, [3, 4]);
    }
}
