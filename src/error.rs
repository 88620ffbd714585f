//! Error types for the protocol core.

use std::io;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a transfer.
///
/// Most of these are recovered locally (counted against a retry budget,
/// see [`crate::channel`]); they are only ever returned to the caller
/// when the retry budget is exhausted or the failure is unrecoverable.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying channel or file stream returned an I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Opening or configuring the serial port failed.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No data arrived on the channel within the expected deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A received packet's CRC16 or checksum trailer did not match.
    #[error("checksum or CRC mismatch")]
    Checksum,

    /// A received packet's sequence byte did not match its complement,
    /// or did not match the sequence the state machine expected.
    #[error("sequence number mismatch")]
    SequenceMismatch,

    /// The local or remote retry budget was exhausted.
    #[error("exhausted retry budget")]
    ExhaustedRetries,

    /// The peer sent two consecutive CAN bytes, or the local side did.
    #[error("transfer canceled")]
    Canceled,

    /// A protocol violation that cannot be resynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),
}
