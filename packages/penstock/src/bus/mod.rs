// implementation of the bus.
//
// the architecture is a sparse table of channels, each of which is a bounded
// FIFO of messages plus two FIFO queues of parked fibers:
//
// bus handles wrap around Rc<shared state>
//                              |
//        /---------------------/
//        v
//     shared state: a Vec of channel slots (lowest free slot reused on
//        |          open) and the last-error cell
//        |
//        \------ each occupied slot holds a channel, itself an Rc handle
//                around single-threaded interior state:
//                   |
//                   |------ a VecDeque<u32> of buffered messages, capped at
//                   |       the channel's capacity
//                   |
//                   |------ a "send waiter queue": an intrusively linked
//                   |       FIFO of nodes, one per fiber parked until the
//                   |       channel is not full. the node belongs to the
//                   |       parked fiber's future, which links it on first
//                   |       poll and unlinks it on resume or drop; waking
//                   |       flags the node and fires its waker, so order of
//                   |       wakeups is insertion order.
//                   |
//                   \------ a "recv waiter queue", the same for fibers
//                           parked until the channel is not empty.
//
// all of this is single-threaded: fibers of one cooperative scheduler share
// the bus, mutation happens only from the currently running fiber, and the
// only suspension points are the park future and the close protocol's
// yields. Rc + RefCell take the place a lock would occupy in a threaded
// design, and nothing here is Send.
//
// the organization of the modules:
//
//      waiter_queue<-------core: owns the unsafety of the intrusive waiter
//                     |    ^     lists and presents safe, panic-free channel
//                     |    |     operations on a Chan handle.
//                     |    |
//                     \----api: wraps core into the public Bus surface: id
//                                table, lifecycle, broadcast, the last-error
//                                slot. re-exported at the crate root.
//
// the error module holds the error types, also re-exported at the crate
// root.

pub(crate) mod api;
pub(crate) mod error;

mod core;
mod waiter_queue;
