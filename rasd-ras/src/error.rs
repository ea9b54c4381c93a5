//! Error types for Ranging Service operations.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Ranging Service protocol errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A wire frame was shorter than its fixed header requires.
    #[error("buffer too short")]
    BufferTooShort,

    /// A wire frame carried an opcode this implementation does not know.
    #[error("unknown opcode")]
    UnknownOpcode,

    /// The peer has not subscribed to the characteristic being sent on.
    #[error("peer not subscribed")]
    NotSubscribed,

    /// No free procedure buffer and no evictable victim.
    #[error("no ranging data buffers available")]
    NoBuffers,

    /// No stored procedure matches the requested ranging counter.
    #[error("no matching ranging data record")]
    NoRecords,

    /// An operation of the same kind is already in progress.
    #[error("operation already in progress")]
    Busy,

    /// A buffer claim no longer refers to a stored procedure.
    #[error("stale buffer claim")]
    StaleClaim,

    /// A procedure exceeded the fixed buffer storage bound.
    #[error("procedure storage exhausted")]
    StorageExhausted,

    /// The transport refused an outbound notification or indication.
    #[error("transport send failed")]
    SendFailed,

    /// A ranging-data transfer ended without a complete, valid image.
    #[error("ranging data receive incomplete")]
    Incomplete,
}
