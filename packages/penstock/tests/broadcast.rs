#![cfg(feature = "broadcast")]

// end-to-end scenarios for atomic broadcast.

use penstock::{
    error::{ErrorCode, NoChannelError, TryError, WouldBlockError},
    Bus,
};
use std::num::NonZeroUsize;
use waterwheel::Executor;

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

#[test]
fn one_full_channel_blocks_the_whole_broadcast() {
    let bus = Bus::new();
    let a = bus.open(cap(1));
    let b = bus.open(cap(1));

    bus.try_send(a, 9).unwrap();
    assert_eq!(
        bus.try_broadcast(7),
        Err(TryError::WouldBlock(WouldBlockError)),
    );
    assert_eq!(bus.last_error(), ErrorCode::WouldBlock);
    // nothing was deposited anywhere
    assert_eq!(bus.len(a), Some(1));
    assert_eq!(bus.len(b), Some(0));
}

#[test]
fn broadcast_deposits_in_one_atomic_step() {
    let bus = Bus::new();
    let a = bus.open(cap(2));
    let b = bus.open(cap(2));

    bus.try_broadcast(1).unwrap();
    bus.try_broadcast(2).unwrap();
    // every surviving channel sees the same relative order
    assert_eq!(bus.try_recv(a), Ok(1));
    assert_eq!(bus.try_recv(a), Ok(2));
    assert_eq!(bus.try_recv(b), Ok(1));
    assert_eq!(bus.try_recv(b), Ok(2));
}

#[test]
fn closed_channels_are_skipped_not_counted() {
    let exec = Executor::new();
    let bus = Bus::new();
    let a = bus.open(cap(1));
    let b = bus.open(cap(1));

    {
        let bus = bus.clone();
        exec.spawn(async move {
            bus.close(a).await;
            bus.try_broadcast(7).unwrap();
            assert_eq!(bus.try_recv(b), Ok(7));
            // with the last channel gone, broadcast has no audience
            bus.close(b).await;
            assert_eq!(
                bus.try_broadcast(8),
                Err(TryError::NoChannel(NoChannelError)),
            );
            assert_eq!(bus.last_error(), ErrorCode::NoChannel);
        });
    }
    assert_eq!(exec.run(), 0);
}

#[test]
fn blocking_broadcast_parks_until_the_full_channel_drains() {
    let exec = Executor::new();
    let bus = Bus::new();
    let a = bus.open(cap(1));
    let b = bus.open(cap(1));

    bus.try_send(a, 9).unwrap();
    {
        let bus = bus.clone();
        exec.spawn(async move {
            // a is full, so this parks on a's send queue until the receiver
            // makes room
            bus.broadcast(7).await.unwrap();
        });
    }
    {
        let bus = bus.clone();
        exec.spawn(async move {
            assert_eq!(bus.recv(a).await, Ok(9));
            // parking here hands the cpu to the broadcaster
            assert_eq!(bus.recv(a).await, Ok(7));
            assert_eq!(bus.try_recv(b), Ok(7));
        });
    }

    assert_eq!(exec.run(), 0);
}

#[test]
fn broadcast_survives_losing_its_parking_channel_to_a_close() {
    let exec = Executor::new();
    let bus = Bus::new();
    let a = bus.open(cap(1));
    let b = bus.open(cap(1));

    bus.try_send(a, 9).unwrap();
    {
        let bus = bus.clone();
        exec.spawn(async move {
            // parks on full a; a then closes, so the retry delivers to b only
            bus.broadcast(7).await.unwrap();
        });
    }
    {
        let bus = bus.clone();
        exec.spawn(async move {
            bus.close(a).await;
        });
    }

    assert_eq!(exec.run(), 0);
    assert_eq!(bus.try_recv(b), Ok(7));
    assert_eq!(bus.len(b), Some(0));
}

#[test]
fn broadcast_with_no_channels_is_terminal() {
    let exec = Executor::new();
    let bus = Bus::new();

    {
        let bus = bus.clone();
        exec.spawn(async move {
            assert_eq!(bus.broadcast(1).await, Err(NoChannelError));
        });
    }
    assert_eq!(exec.run(), 0);
}
