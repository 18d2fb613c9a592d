//! Error types for the relay protocol.

use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the protocol layer.
///
/// Only `Protocol` and command-read `ConnectionClosed` are fatal to a session.
/// Transfer failures are absorbed by the retry wrapper and reported through
/// `RetriesExhausted` once the bound is spent.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Unparseable or unknown command, or a command missing required metadata.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer closed the connection before the declared payload arrived.
    #[error("transfer incomplete: received {received} of {expected} bytes")]
    TransferIncomplete { expected: u64, received: u64 },

    /// Every receive attempt failed.
    #[error("transfer failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<RelayError> },

    /// A file requested by the peer does not exist.
    #[error("file not found: {}", .0.display())]
    FileMissing(PathBuf),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame bytes were delimited correctly but could not be decoded.
    #[error("frame decode error: {0}")]
    Decode(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
