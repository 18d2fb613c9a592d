//! Command language.
//!
//! Each command arrives as the first line of a single bounded read:
//!
//! ```text
//! {"command":"SEND_SOURCE","file_name":"face.jpg","file_size":12345}\n<payload bytes...>
//! ```
//!
//! Older peers prefix the JSON object with the sentinel `0089`, and the oldest
//! ones send the bare command name with no structure at all. All three forms
//! decode to the same `CommandEnvelope`. Whatever follows the first newline is
//! handed back untouched so the caller can feed it to the transfer or frame
//! reader that consumes the payload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

/// Legacy prefix some peers put before the opening brace.
pub const LEGACY_SENTINEL: &str = "0089";

/// Upper bound for a single command read.
pub const DEFAULT_COMMAND_READ_LIMIT: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    SendSource,
    SendTarget,
    RequestFile,
    StartFrames,
    StopFrames,
    Exit,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::SendSource,
        Command::SendTarget,
        Command::RequestFile,
        Command::StartFrames,
        Command::StopFrames,
        Command::Exit,
    ];

    /// Wire token for this command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::SendSource => "SEND_SOURCE",
            Command::SendTarget => "SEND_TARGET",
            Command::RequestFile => "REQUEST_FILE",
            Command::StartFrames => "START_FRAMES",
            Command::StopFrames => "STOP_FRAMES",
            Command::Exit => "EXIT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.as_str() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed command plus its optional file metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandEnvelope {
    pub command: Command,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl CommandEnvelope {
    pub fn bare(command: Command) -> Self {
        Self {
            command,
            file_name: None,
            file_size: None,
        }
    }

    pub fn with_file(command: Command, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            command,
            file_name: Some(file_name.into()),
            file_size: Some(file_size),
        }
    }

    /// Encode as a single command line (terminated by `\n`).
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Header object as it appears on the wire. Extra keys are ignored.
#[derive(Debug, Deserialize)]
struct WireHeader {
    command: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

/// Result of decoding one command read.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A command, plus the raw bytes that followed the header line.
    Envelope {
        envelope: CommandEnvelope,
        rest: Vec<u8>,
    },
    /// Nothing recognizable; the caller must terminate the session.
    Unparseable,
}

/// Decode one inbound read. Never fails; malformed input is `Unparseable`.
pub fn decode(data: &[u8]) -> Decoded {
    let (header_bytes, rest) = match data.iter().position(|&b| b == b'\n') {
        Some(idx) => (&data[..idx], &data[idx + 1..]),
        None => (data, &[][..]),
    };
    let text = String::from_utf8_lossy(header_bytes);
    let header = strip_sentinel(text.trim());

    if let Some(envelope) = parse_header(header) {
        return Decoded::Envelope {
            envelope,
            rest: rest.to_vec(),
        };
    }

    if contains_token(data, Command::RequestFile.as_str().as_bytes()) {
        log::debug!("command header unparseable; matched REQUEST_FILE by substring");
        return Decoded::Envelope {
            envelope: CommandEnvelope::bare(Command::RequestFile),
            rest: Vec::new(),
        };
    }

    Decoded::Unparseable
}

/// Perform one bounded read and decode it.
///
/// Returns `Ok(None)` when the peer closed the connection.
pub fn read_command<R: Read>(reader: &mut R, limit: usize) -> std::io::Result<Option<Decoded>> {
    let mut buf = vec![0u8; limit.max(1)];
    let n = reader.read(&mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(decode(&buf[..n])))
}

fn strip_sentinel(header: &str) -> &str {
    header.strip_prefix(LEGACY_SENTINEL).unwrap_or(header)
}

fn parse_header(header: &str) -> Option<CommandEnvelope> {
    if header.is_empty() {
        return None;
    }
    if header.starts_with('{') {
        let wire: WireHeader = serde_json::from_str(header).ok()?;
        let command = Command::from_name(wire.command.trim())?;
        return Some(CommandEnvelope {
            command,
            file_name: wire.file_name,
            file_size: wire.file_size,
        });
    }
    Command::from_name(header).map(CommandEnvelope::bare)
}

fn contains_token(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
