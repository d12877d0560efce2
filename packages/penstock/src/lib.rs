//! A bounded many-to-many message bus for cooperative fibers.
//!
//! A [`Bus`] is a table of channels, each a bounded FIFO of `u32` messages.
//! Any fiber may send on or receive from any channel by id. Senders park
//! while a channel is full, receivers park while it is empty, and closing a
//! channel wakes every parked fiber with [`error::NoChannelError`]. Channels
//! can also be written all-at-once ([`Bus::broadcast`], feature `broadcast`)
//! or in batches with partial-transfer semantics ([`Bus::send_batch`],
//! feature `batch`).
//!
//! The bus is built for a single-threaded cooperative scheduler such as
//! `waterwheel`: operations are futures, wakeups go through [`std::task::Waker`],
//! and nothing is `Send`. Parked fibers are resumed strictly in FIFO order
//! per channel, and every woken fiber re-checks its condition before
//! completing, so the bus is correct on any executor that delivers wakeups,
//! FIFO or not.

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

mod bus;

pub use crate::bus::api::{Bus, ChannelId};

/// Error types
pub mod error {
    pub use crate::bus::error::*;
}
