// exposed API of the bus.

use super::{
    core::Chan,
    error::*,
};
use std::{
    cell::{Cell, RefCell},
    fmt,
    num::NonZeroUsize,
    rc::Rc,
};

#[cfg(feature = "broadcast")]
use super::core::Side;
#[cfg(feature = "broadcast")]
use smallvec::SmallVec;


/// Identifier of one open channel on a [`Bus`]
///
/// Ids are small non-negative integers, stable from [`Bus::open`] until the
/// matching [`Bus::close`] returns, after which the id may be handed out
/// again for a newly opened channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(usize);

impl ChannelId {
    /// Reconstruct an id from its raw index
    ///
    /// Useful when ids are carried through code that cannot hold a
    /// `ChannelId`. An index that does not name a live channel is not an
    /// error here; operations on it fail with [`NoChannelError`].
    pub fn from_index(index: usize) -> Self {
        ChannelId(index)
    }

    /// The raw slot index of this id
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// Handle to a message bus: a table of bounded many-to-many channels shared
/// by the fibers of one cooperative scheduler
///
/// Cheap to clone; all clones refer to the same bus. The bus is
/// single-threaded by construction — handles and operation futures are not
/// `Send` — and relies on the cooperative scheduling model for atomicity:
/// no operation yields the cpu except to park.
pub struct Bus(Rc<Shared>);

struct Shared {
    // channel slots. a slot is none when its id is free for reuse.
    slots: RefCell<Vec<Option<Chan>>>,
    // last-error slot, written by every failing operation.
    last_error: Cell<ErrorCode>,
}

impl Bus {
    /// Construct a bus with no channels
    pub fn new() -> Self {
        Bus(Rc::new(Shared {
            slots: RefCell::new(Vec::new()),
            last_error: Cell::new(ErrorCode::None),
        }))
    }

    /// Open a channel with the given capacity and return its id
    ///
    /// The lowest free id is reused; if none is free the table grows by one.
    /// Never fails.
    pub fn open(&self, capacity: NonZeroUsize) -> ChannelId {
        let chan = Chan::new(capacity);
        let mut slots = self.0.slots.borrow_mut();
        let index = match slots.iter().position(Option::is_none) {
            Some(index) => {
                slots[index] = Some(chan);
                index
            }
            None => {
                slots.push(Some(chan));
                slots.len() - 1
            }
        };
        debug!(id = index, capacity = capacity.get(), "channel opened");
        ChannelId(index)
    }

    /// Close a channel: reject all further traffic, wake every parked fiber,
    /// and free the id once they have drained
    ///
    /// A no-op on an id that is invalid or already closing. Every fiber
    /// parked on the channel resumes and completes its operation with
    /// [`NoChannelError`]. Messages buffered at close time stay receivable
    /// through [`Bus::try_recv`] until this returns and the slot is cleared;
    /// whatever remains then is discarded. The slot is cleared only after
    /// both waiter queues are empty, so the id is not reused out from under
    /// a parked fiber.
    pub async fn close(&self, id: ChannelId) {
        let chan = {
            let slots = self.0.slots.borrow();
            slots.get(id.0).and_then(|slot| slot.clone())
        };
        let Some(chan) = chan else { return };
        if chan.is_closed() {
            // another fiber is already driving the drain
            return;
        }
        debug!(id = id.0, "channel closing");
        chan.start_close();
        chan.drain_waiters().await;
        let mut slots = self.0.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(id.0) {
            if slot.as_ref().is_some_and(|occupant| Chan::same_channel(occupant, &chan)) {
                *slot = None;
            }
        }
    }

    /// Close every remaining channel
    ///
    /// Fibers blocked on any channel observe [`NoChannelError`] and complete
    /// their operations before this returns.
    pub async fn shutdown(&self) {
        debug!("bus shutting down");
        let count = self.0.slots.borrow().len();
        for index in 0..count {
            self.close(ChannelId(index)).await;
        }
    }

    // ==== scalar transfer ====

    /// Append a message to the channel's queue without blocking
    ///
    /// Fails with [`WouldBlockError`] if the queue is full, and with
    /// [`NoChannelError`] if the id is dead or the channel closed. On
    /// failure the channel is untouched.
    pub fn try_send(&self, id: ChannelId, value: u32) -> Result<(), TryError> {
        let result = match self.chan(id) {
            Ok(chan) => chan.try_send(value),
            Err(err) => Err(err.into()),
        };
        self.note_try(result)
    }

    /// Pop the oldest message from the channel's queue without blocking
    ///
    /// Fails with [`WouldBlockError`] if the queue is empty on a live
    /// channel. A closed channel drains first: it keeps yielding buffered
    /// messages and fails with [`NoChannelError`] only once empty.
    pub fn try_recv(&self, id: ChannelId) -> Result<u32, TryError> {
        let result = match self.chan(id) {
            Ok(chan) => chan.try_recv(),
            Err(err) => Err(err.into()),
        };
        self.note_try(result)
    }

    /// Append a message, parking the calling fiber while the channel is full
    ///
    /// Resolves with [`NoChannelError`] if the id is dead or the channel
    /// closes while waiting.
    pub async fn send(&self, id: ChannelId, value: u32) -> Result<(), NoChannelError> {
        let result = match self.chan(id) {
            Ok(chan) => chan.send(value).await,
            Err(err) => Err(err),
        };
        self.note(result)
    }

    /// Pop the oldest message, parking the calling fiber while the channel
    /// is empty
    ///
    /// Resolves with [`NoChannelError`] if the id is dead, or once the
    /// channel is closed and drained.
    pub async fn recv(&self, id: ChannelId) -> Result<u32, NoChannelError> {
        let result = match self.chan(id) {
            Ok(chan) => chan.recv().await,
            Err(err) => Err(err),
        };
        self.note(result)
    }

    // ==== vectorized transfer ====

    /// Append up to `values.len()` messages without blocking, in order
    ///
    /// Moves as many as free capacity allows and returns the count, at
    /// least 1 for a non-empty input. Fails with [`WouldBlockError`] if the
    /// queue is full, with no messages moved.
    #[cfg(feature = "batch")]
    pub fn try_send_batch(&self, id: ChannelId, values: &[u32]) -> Result<usize, TryError> {
        let result = match self.chan(id) {
            Ok(chan) => chan.try_send_batch(values),
            Err(err) => Err(err.into()),
        };
        self.note_try(result)
    }

    /// Pop up to `out.len()` messages without blocking, in order
    ///
    /// Moves as many as are buffered and returns the count, at least 1 when
    /// the queue is non-empty and `out` is not empty.
    #[cfg(feature = "batch")]
    pub fn try_recv_batch(&self, id: ChannelId, out: &mut [u32]) -> Result<usize, TryError> {
        let result = match self.chan(id) {
            Ok(chan) => chan.try_recv_batch(out),
            Err(err) => Err(err.into()),
        };
        self.note_try(result)
    }

    /// Append messages from `values`, parking while the channel is full
    ///
    /// Returns the count moved by the first attempt that made progress,
    /// which may be less than `values.len()`; loop to transfer exactly all
    /// of them. An empty `values` is a no-op returning 0.
    #[cfg(feature = "batch")]
    pub async fn send_batch(&self, id: ChannelId, values: &[u32]) -> Result<usize, NoChannelError> {
        let result = match self.chan(id) {
            Ok(chan) => {
                if values.is_empty() {
                    Ok(0)
                } else {
                    chan.send_batch(values).await
                }
            }
            Err(err) => Err(err),
        };
        self.note(result)
    }

    /// Pop messages into `out`, parking while the channel is empty
    ///
    /// Returns the count moved by the first attempt that made progress,
    /// which may be less than `out.len()`. An empty `out` is a no-op
    /// returning 0.
    #[cfg(feature = "batch")]
    pub async fn recv_batch(&self, id: ChannelId, out: &mut [u32]) -> Result<usize, NoChannelError> {
        let result = match self.chan(id) {
            Ok(chan) => {
                if out.is_empty() {
                    Ok(0)
                } else {
                    chan.recv_batch(out).await
                }
            }
            Err(err) => Err(err),
        };
        self.note(result)
    }

    // ==== broadcast ====

    /// Deposit `value` on every live channel, or fail without mutating any
    ///
    /// Atomic with respect to cooperative scheduling: there is no
    /// suspension point between the feasibility scan and the deposits.
    /// Fails with [`NoChannelError`] if no live channel exists, and with
    /// [`WouldBlockError`] if any live channel is full.
    #[cfg(feature = "broadcast")]
    pub fn try_broadcast(&self, value: u32) -> Result<(), TryError> {
        let result = self.try_broadcast_inner(value);
        self.note_try(result)
    }

    /// Deposit `value` on every live channel, parking until all have room
    ///
    /// Parks on one full channel at a time and rescans on wakeup, so a
    /// broadcast may retry several times under contention; each retry is
    /// all-or-nothing. Resolves with [`NoChannelError`] once no live
    /// channel remains.
    #[cfg(feature = "broadcast")]
    pub async fn broadcast(&self, value: u32) -> Result<(), NoChannelError> {
        let result = self.broadcast_inner(value).await;
        self.note(result)
    }

    #[cfg(feature = "broadcast")]
    fn try_broadcast_inner(&self, value: u32) -> Result<(), TryError> {
        let live = self.live_channels();
        if live.is_empty() {
            return Err(NoChannelError.into());
        }
        if live.iter().any(Chan::is_full) {
            return Err(WouldBlockError.into());
        }
        for chan in &live {
            // cannot fail: every channel just checked live and non-full, and
            // nothing has run in between
            let sent = chan.try_send(value);
            debug_assert!(sent.is_ok());
        }
        trace!(channels = live.len(), "broadcast delivered");
        Ok(())
    }

    #[cfg(feature = "broadcast")]
    async fn broadcast_inner(&self, value: u32) -> Result<(), NoChannelError> {
        loop {
            match self.try_broadcast_inner(value) {
                Ok(()) => {
                    // hand the wakeup chain onward wherever room remains
                    let slots = self.0.slots.borrow();
                    for chan in slots.iter().flatten() {
                        chan.chain_wake_send();
                    }
                    return Ok(());
                }
                Err(TryError::NoChannel(err)) => return Err(err),
                Err(TryError::WouldBlock(_)) => {
                    // park on the first full live channel; progress anywhere
                    // on it (recv or close) re-runs the scan
                    let full = self
                        .live_channels()
                        .into_iter()
                        .find(Chan::is_full);
                    let Some(chan) = full else {
                        // raced with a close; rescan settled the question
                        return Err(NoChannelError);
                    };
                    trace!("broadcast parking on a full channel");
                    chan.park(Side::Send).await;
                }
            }
        }
    }

    #[cfg(feature = "broadcast")]
    fn live_channels(&self) -> SmallVec<[Chan; 8]> {
        self.0
            .slots
            .borrow()
            .iter()
            .flatten()
            .filter(|chan| !chan.is_closed())
            .cloned()
            .collect()
    }

    // ==== queries ====

    /// Number of live channels on the bus
    pub fn channel_count(&self) -> usize {
        self.0.slots.borrow().iter().flatten().count()
    }

    /// Number of buffered messages, or none if the id names no channel
    pub fn len(&self, id: ChannelId) -> Option<usize> {
        self.chan(id).ok().map(|chan| chan.len())
    }

    /// Capacity of the channel, or none if the id names no channel
    pub fn capacity(&self, id: ChannelId) -> Option<usize> {
        self.chan(id).ok().map(|chan| chan.capacity())
    }

    /// Whether the id names no channel or names one that has been closed
    pub fn is_closed(&self, id: ChannelId) -> bool {
        self.chan(id).map(|chan| chan.is_closed()).unwrap_or(true)
    }

    // ==== the last-error slot ====

    /// The code recorded by the most recent failing operation
    ///
    /// Never cleared on success; meaningful only immediately after a failed
    /// call.
    pub fn last_error(&self) -> ErrorCode {
        self.0.last_error.get()
    }

    /// Overwrite the last-error slot
    pub fn set_last_error(&self, code: ErrorCode) {
        self.0.last_error.set(code);
    }

    // ==== plumbing ====

    // resolve an id to its channel handle.
    fn chan(&self, id: ChannelId) -> Result<Chan, NoChannelError> {
        self.0
            .slots
            .borrow()
            .get(id.0)
            .and_then(|slot| slot.clone())
            .ok_or(NoChannelError)
    }

    // record a blocking operation's outcome in the last-error slot.
    fn note<T>(&self, result: Result<T, NoChannelError>) -> Result<T, NoChannelError> {
        if result.is_err() {
            self.0.last_error.set(ErrorCode::NoChannel);
        }
        result
    }

    // record a non-blocking operation's outcome in the last-error slot.
    fn note_try<T>(&self, result: Result<T, TryError>) -> Result<T, TryError> {
        if let Err(err) = &result {
            self.0.last_error.set(err.code());
        }
        result
    }
}

impl Clone for Bus {
    fn clone(&self) -> Self {
        Bus(Rc::clone(&self.0))
    }
}

impl Default for Bus {
    fn default() -> Self {
        Bus::new()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // the last handle is gone, so nothing can drive a drain. mark every
        // channel closed and fire the wakers, so any operation future still
        // alive resolves to NoChannelError when next polled instead of
        // parking forever.
        for slot in self.slots.get_mut().iter_mut() {
            if let Some(chan) = slot.take() {
                chan.start_close();
            }
        }
    }
}
