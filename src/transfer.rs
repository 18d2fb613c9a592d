//! Length-declared file transfer.
//!
//! Inbound payloads are raw bytes of a size announced in the command header.
//! Outbound files are optionally preceded by a `SEND_FILE` JSON header and
//! then streamed in fixed-size chunks. Receives that come up short can be
//! retried a bounded number of times, with `RETRY`/`DONE` acknowledgments
//! written back to the peer.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::layout::ResponseFormat;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Sent after each failed receive attempt that will be retried.
pub const ACK_RETRY: &[u8] = b"RETRY";
/// Sent exactly once when a receive finishes, successfully or not.
pub const ACK_DONE: &[u8] = b"DONE";

pub const SEND_FILE_COMMAND: &str = "SEND_FILE";

// Declared sizes come from the peer; cap what is reserved up front.
const MAX_PREALLOC_BYTES: u64 = 16 * 1024 * 1024;

/// Header announcing an outbound file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub command: String,
    pub file_name: String,
    pub file_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause before each retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Read exactly `declared_size` bytes and store them at `dest`.
///
/// Never reads past the declared size. The destination is only replaced once
/// the whole payload is in hand.
pub fn receive_file<R: Read>(
    reader: &mut R,
    dest: &Path,
    declared_size: u64,
    chunk_size: usize,
) -> Result<u64> {
    log::info!("receiving {} bytes into {}", declared_size, dest.display());
    let mut buffer = Vec::with_capacity(declared_size.min(MAX_PREALLOC_BYTES) as usize);
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut received = 0u64;
    while received < declared_size {
        let want = (declared_size - received).min(chunk.len() as u64) as usize;
        let n = match reader.read(&mut chunk[..want]) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if n == 0 {
            return Err(RelayError::TransferIncomplete {
                expected: declared_size,
                received,
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
        received += n as u64;
    }
    write_atomic(dest, &buffer)?;
    log::info!("file saved to {}", dest.display());
    Ok(received)
}

/// `receive_file` with bounded retries and peer acknowledgments.
///
/// Writes `RETRY` after every failed attempt that will be retried and `DONE`
/// once at the end. Exhaustion is returned as `RetriesExhausted`; a failure
/// to write an acknowledgment is returned as-is.
pub fn receive_with_retry<S: Read + Write>(
    stream: &mut S,
    dest: &Path,
    declared_size: u64,
    policy: &RetryPolicy,
    chunk_size: usize,
) -> Result<u64> {
    let attempts = policy.attempts();
    let mut attempt = 0u32;
    let outcome = loop {
        attempt += 1;
        match receive_file(stream, dest, declared_size, chunk_size) {
            Ok(received) => break Ok(received),
            Err(err) => {
                log::warn!(
                    "receive attempt {}/{} for {} failed: {}",
                    attempt,
                    attempts,
                    dest.display(),
                    err
                );
                if attempt >= attempts {
                    break Err(RelayError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                stream.write_all(ACK_RETRY)?;
                stream.flush()?;
                if !policy.backoff.is_zero() {
                    std::thread::sleep(policy.backoff);
                }
            }
        }
    };
    stream.write_all(ACK_DONE)?;
    stream.flush()?;
    outcome
}

/// Stream the file at `path` to the peer.
///
/// A missing file is logged and reported as `FileMissing`; nothing is written.
pub fn send_file<W: Write>(
    writer: &mut W,
    path: &Path,
    format: ResponseFormat,
    chunk_size: usize,
) -> Result<u64> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            log::warn!("file not found: {}", path.display());
            return Err(RelayError::FileMissing(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    let file_size = file.metadata()?.len();

    if format == ResponseFormat::Headered {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = FileHeader {
            command: SEND_FILE_COMMAND.to_string(),
            file_name,
            file_size,
        };
        writer.write_all(&serde_json::to_vec(&header)?)?;
    }

    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;
    loop {
        let n = match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&chunk[..n])?;
        sent += n as u64;
    }
    writer.flush()?;
    log::info!("file sent: {} ({} bytes)", path.display(), sent);
    Ok(sent)
}

/// Write via a sibling temporary file and rename over `dest`.
fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = dest
        .file_name()
        .ok_or_else(|| RelayError::Protocol(format!("invalid destination {}", dest.display())))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".part");
    let tmp = dest.with_file_name(tmp_name);

    if let Err(err) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err.into());
    }
    if let Err(err) = std::fs::rename(&tmp, dest) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
