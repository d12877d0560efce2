// bus error types.

use thiserror::Error;


// ==== base error types ====


/// Error for referring to a channel that cannot serve the operation and never
/// will: the id is out of range, its slot is empty, or the channel is closed
/// with nothing left to give
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("no such channel")]
pub struct NoChannelError;

/// Error for an operation that cannot complete right now but may complete
/// later, once a peer makes progress on the channel
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("operation would block")]
pub struct WouldBlockError;


// ==== compound error types ====


/// Error for a non-blocking (`try_*`) bus operation
///
/// The blocking operations never surface [`WouldBlockError`]; they park the
/// calling fiber instead and retry, so their error type is the bare
/// [`NoChannelError`].
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TryError {
    /// The channel is gone, or closed with nothing left to give; retrying
    /// cannot succeed
    #[error(transparent)]
    NoChannel(#[from] NoChannelError),
    /// The channel is full (send) or empty (recv); retrying may succeed
    #[error(transparent)]
    WouldBlock(#[from] WouldBlockError),
}

impl TryError {
    /// Whether this error is terminal for the operation
    pub fn is_terminal(&self) -> bool {
        matches!(self, TryError::NoChannel(_))
    }

    pub(crate) fn code(&self) -> ErrorCode {
        match self {
            TryError::NoChannel(_) => ErrorCode::NoChannel,
            TryError::WouldBlock(_) => ErrorCode::WouldBlock,
        }
    }
}


// ==== the last-error slot ====


/// Code held in a bus's last-error slot
///
/// Every failing operation records its cause in the slot of the bus it was
/// called on before returning. The slot is never cleared on success, so it is
/// only meaningful immediately after a failed call; the `Result` returns are
/// the primary error interface.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum ErrorCode {
    /// No failure recorded yet
    #[default]
    None,
    /// The last failure was a [`NoChannelError`]
    NoChannel,
    /// The last failure was a [`WouldBlockError`]
    WouldBlock,
}
