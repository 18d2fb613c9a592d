//! Capture Relay
//!
//! Session protocol between a capture client (camera device, phone app) and a
//! processing host. The client uploads a source image and a target media
//! file, may stream live JPEG frames, and can ask for the processed result.
//!
//! # Architecture
//!
//! The relay is a single-connection TCP listener. Each connection runs one
//! session, and each session is a command dispatch loop:
//!
//! 1. **Command line**: a JSON header (or a bare command name) terminated by `\n`.
//! 2. **File transfer**: exactly `file_size` bytes follow the header, acknowledged
//!    with `RETRY`* `DONE`.
//! 3. **Frame stream**: raw concatenated JPEGs split on SOI/EOI markers.
//! 4. **Ready gate**: `ready == have_source && have_target`; reaching it ends the
//!    session and wakes anyone waiting on the [`ReadySignal`].
//!
//! # Module Structure
//!
//! - `command`: command line codec
//! - `transfer`: sized file receive/send and the retry acknowledgment wrapper
//! - `frame`: JPEG deframer and decoder seam
//! - `session`: per-connection state machine and the `Processor` hook
//! - `server`: listener loop and background handle
//! - `client`: capture-side peer
//! - `config`: file + environment configuration

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod layout;
pub mod ready;
pub mod server;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use client::{CaptureClient, TransferAck};
pub use command::{Command, CommandEnvelope, Decoded};
pub use config::{LayoutMode, RelayConfig};
pub use connection::Connection;
pub use error::{RelayError, Result};
pub use frame::{DecodedFrame, FrameDecoder, FrameDeframer, JpegDecoder};
pub use layout::{DirectoryResolution, FileKind, ResponseFormat};
pub use ready::{ReadySignal, ReadyState};
pub use server::{RelayHandle, RelayServer, ServeStats, ServerConfig, ShutdownHandle};
pub use session::{
    FrameControl, Gate, NullProcessor, Processor, ReceivedFiles, Session, SessionOutcome,
    SessionProfile, SessionReport, TransferFailure,
};
pub use transfer::{FileHeader, RetryPolicy};
