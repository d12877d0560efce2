// intrusively linked FIFO of parked-fiber waiter nodes.
//
// one queue per channel per direction. a node is pushed when a fiber parks,
// and removed by that fiber when it resumes (or by its future's drop). the
// queue itself never unlinks or frees nodes: waking is done by flagging a
// node as notified and firing its waker, and the woken fiber unlinks itself
// on its next poll. that keeps traversal during a wake-all trivially safe,
// since a wake only schedules the fiber, it never runs it.

use std::{ptr::NonNull, task::Waker};


// FIFO queue of waiter nodes. wakes in insertion order.
#[derive(Default)]
pub(crate) struct WaiterQueue {
    // front and back of the queue, unless the queue is empty.
    front_back: Option<(NonNull<WaiterNode>, NonNull<WaiterNode>)>,
}

// handle to a waiter node allocation. the handle owns the allocation while
// the node is unlinked; while linked, the allocation may only be touched
// through the queue it is linked into.
pub(crate) struct WaiterHandle {
    // allocation for the node.
    ptr: NonNull<WaiterNode>,
    // whether the node is currently linked.
    linked: bool,
}

// heap allocation for a waiter node.
#[derive(Default)]
struct WaiterNode {
    // next node towards the back.
    to_back: Option<NonNull<WaiterNode>>,
    // next node towards the front.
    to_front: Option<NonNull<WaiterNode>>,
    // set by a wake before the waker fires; consumed by the parked fiber when
    // it unlinks. distinguishes a real wakeup from a spurious poll.
    notified: bool,
    // the waker of the parked fiber, if it has polled since linking.
    waker: Option<Waker>,
}

impl WaiterQueue {
    // construct empty.
    pub(crate) fn new() -> Self {
        WaiterQueue::default()
    }

    // whether no node is linked.
    pub(crate) fn is_empty(&self) -> bool {
        self.front_back.is_none()
    }

    // link the node to the back of this queue.
    //
    // UB if:
    //
    // - the node is already linked.
    pub(crate) unsafe fn push(&mut self, node: &mut WaiterHandle) {
        debug_assert!(!node.linked, "UB");

        node.linked = true;
        let alloc = node.ptr.as_mut();
        debug_assert!(alloc.to_front.is_none());
        debug_assert!(alloc.to_back.is_none());
        debug_assert!(alloc.waker.is_none());
        debug_assert!(!alloc.notified);
        if let &mut Some((_, ref mut back)) = &mut self.front_back {
            // node becomes the new back, and the new to_back of the old back
            let back_alloc = back.as_mut();
            debug_assert!(back_alloc.to_back.is_none());
            back_alloc.to_back = Some(node.ptr);
            alloc.to_front = Some(*back);
            *back = node.ptr;
        } else {
            // edge case: node becomes the only node in the queue
            self.front_back = Some((node.ptr, node.ptr));
        }
    }

    // unlink the node from this queue, clearing its waker and notified flag.
    //
    // UB if:
    //
    // - the node is not linked.
    // - the node is linked to a different queue.
    pub(crate) unsafe fn remove(&mut self, node: &mut WaiterHandle) {
        debug_assert!(node.linked, "UB");
        debug_assert!(self.front_back.is_some(), "UB");

        node.linked = false;
        let alloc = node.ptr.as_mut();
        alloc.waker = None;
        alloc.notified = false;
        match (alloc.to_front, alloc.to_back) {
            (None, None) => {
                // edge case: node was the only node in the queue
                debug_assert_eq!(self.front_back, Some((node.ptr, node.ptr)));
                self.front_back = None;
            }
            (None, Some(mut to_back)) => {
                // node was the front: its to_back becomes the new front
                to_back.as_mut().to_front = None;
                if let Some((front, _)) = &mut self.front_back {
                    debug_assert_eq!(*front, node.ptr);
                    *front = to_back;
                }
            }
            (Some(mut to_front), None) => {
                // node was the back: its to_front becomes the new back
                to_front.as_mut().to_back = None;
                if let Some((_, back)) = &mut self.front_back {
                    debug_assert_eq!(*back, node.ptr);
                    *back = to_front;
                }
            }
            (Some(mut to_front), Some(mut to_back)) => {
                // node was interior: its neighbors link to each other
                debug_assert_eq!(to_front.as_ref().to_back, Some(node.ptr));
                debug_assert_eq!(to_back.as_ref().to_front, Some(node.ptr));
                to_front.as_mut().to_back = Some(to_back);
                to_back.as_mut().to_front = Some(to_front);
            }
        }
        alloc.to_front = None;
        alloc.to_back = None;
    }

    // whether the node has been notified by a wake.
    //
    // UB if:
    //
    // - the node is not linked.
    // - the node is linked to a different queue.
    pub(crate) unsafe fn is_notified(&self, node: &WaiterHandle) -> bool {
        debug_assert!(node.linked, "UB");
        node.ptr.as_ref().notified
    }

    // install the parked fiber's waker on the node, replacing any previous
    // one.
    //
    // UB if:
    //
    // - the node is not linked.
    // - the node is linked to a different queue.
    pub(crate) unsafe fn set_waker(&mut self, node: &mut WaiterHandle, waker: Waker) {
        debug_assert!(node.linked, "UB");
        node.ptr.as_mut().waker = Some(waker);
    }

    // notify the node at the front of this queue and fire its waker, if the
    // queue is non-empty. waking an already-notified front is a no-op beyond
    // re-firing a waker it may have re-installed.
    pub(crate) fn wake_front(&mut self) {
        unsafe {
            if let Some((mut front, _)) = self.front_back {
                let alloc = front.as_mut();
                alloc.notified = true;
                if let Some(waker) = alloc.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    // notify every node, front to back, and fire each waker. nothing is
    // unlinked here; each woken fiber unlinks its own node when it resumes.
    pub(crate) fn wake_all(&mut self) {
        unsafe {
            let mut next = self.front_back.map(|(front, _)| front);
            while let Some(mut curr) = next {
                let alloc = curr.as_mut();
                alloc.notified = true;
                if let Some(waker) = alloc.waker.take() {
                    waker.wake();
                }
                next = alloc.to_back;
            }
        }
    }
}

impl WaiterHandle {
    // construct an unlinked node allocation.
    pub(crate) fn new() -> Self {
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(WaiterNode::default()))) };
        WaiterHandle { ptr, linked: false }
    }

    // whether this node is linked.
    pub(crate) fn is_linked(&self) -> bool {
        self.linked
    }
}

impl Drop for WaiterQueue {
    fn drop(&mut self) {
        // a linked node implies a live parked future, and every parked future
        // keeps its channel (and therefore this queue) alive. so by the time
        // the queue drops, nothing can still be linked.
        debug_assert!(self.front_back.is_none(), "waiter queue dropped non-empty");
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        // the handle owns the allocation only while unlinked. a linked handle
        // is never dropped (parked futures unlink in their own drop first).
        debug_assert!(!self.linked, "waiter handle dropped while linked");
        unsafe {
            if !self.linked {
                drop(Box::from_raw(self.ptr.as_ptr()));
            }
        }
    }
}
