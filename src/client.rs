//! Capture-side peer of the relay protocol.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{Command, CommandEnvelope};
use crate::connection::Connection;
use crate::error::{RelayError, Result};
use crate::layout::base_name;
use crate::transfer::{receive_file, FileHeader, DEFAULT_CHUNK_SIZE, SEND_FILE_COMMAND};

const ACK_READ_SIZE: usize = 64;
const MAX_HEADER_BYTES: usize = 4096;

/// Acknowledgments observed after a file upload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferAck {
    pub retries: u32,
}

pub struct CaptureClient<S> {
    conn: Connection<S>,
    chunk_size: usize,
}

impl CaptureClient<TcpStream> {
    pub fn connect<A: ToSocketAddrs>(addr: A, read_timeout: Option<Duration>) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(read_timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Close the sending half so the relay sees the end of the stream.
    pub fn finish(self) -> Result<()> {
        self.conn.get_ref().shutdown(Shutdown::Write)?;
        Ok(())
    }
}

impl<S: Read + Write> CaptureClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            conn: Connection::new(stream),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn send_command(&mut self, envelope: &CommandEnvelope) -> Result<()> {
        self.conn.write_all(&envelope.to_line()?)?;
        self.conn.flush()?;
        Ok(())
    }

    pub fn send_source(&mut self, path: &Path) -> Result<TransferAck> {
        self.upload(Command::SendSource, path)
    }

    pub fn send_target(&mut self, path: &Path) -> Result<TransferAck> {
        self.upload(Command::SendTarget, path)
    }

    /// Upload raw bytes under `file_name`.
    pub fn upload_bytes(
        &mut self,
        command: Command,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<TransferAck> {
        let envelope = CommandEnvelope::with_file(command, file_name, bytes.len() as u64);
        self.send_command(&envelope)?;
        for chunk in bytes.chunks(self.chunk_size) {
            self.conn.write_all(chunk)?;
        }
        self.conn.flush()?;
        self.read_ack()
    }

    fn upload(&mut self, command: Command, path: &Path) -> Result<TransferAck> {
        let bytes = std::fs::read(path)?;
        let file_name = base_name(&path.to_string_lossy())?;
        log::info!("uploading {} ({} bytes) as {}", path.display(), bytes.len(), command);
        self.upload_bytes(command, &file_name, &bytes)
    }

    /// Read `RETRY`* `DONE`.
    pub fn read_ack(&mut self) -> Result<TransferAck> {
        let mut text = String::new();
        let mut buf = [0u8; ACK_READ_SIZE];
        loop {
            if let Some(done_at) = text.find("DONE") {
                let retries = text[..done_at].matches("RETRY").count() as u32;
                return Ok(TransferAck { retries });
            }
            let n = self.conn.read(&mut buf)?;
            if n == 0 {
                return Err(RelayError::ConnectionClosed);
            }
            text.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Ask for a processed file and store it under `dest_dir`.
    ///
    /// Relies on the headered response format. A relay that has no such file
    /// answers nothing, so callers should connect with a read timeout.
    pub fn request_file(&mut self, file_name: Option<&str>, dest_dir: &Path) -> Result<PathBuf> {
        let envelope = CommandEnvelope {
            command: Command::RequestFile,
            file_name: file_name.map(str::to_string),
            file_size: None,
        };
        self.send_command(&envelope)?;

        let header = self.read_file_header()?;
        if header.command != SEND_FILE_COMMAND {
            return Err(RelayError::Protocol(format!(
                "unexpected response '{}'",
                header.command
            )));
        }
        let dest = dest_dir.join(base_name(&header.file_name)?);
        receive_file(&mut self.conn, &dest, header.file_size, self.chunk_size)?;
        Ok(dest)
    }

    pub fn start_frames(&mut self) -> Result<()> {
        self.send_command(&CommandEnvelope::bare(Command::StartFrames))
    }

    /// Write one JPEG to an active frame stream.
    pub fn send_frame(&mut self, jpeg: &[u8]) -> Result<()> {
        self.conn.write_all(jpeg)?;
        Ok(())
    }

    pub fn stop_frames(&mut self) -> Result<()> {
        self.send_command(&CommandEnvelope::bare(Command::StopFrames))
    }

    pub fn exit(&mut self) -> Result<()> {
        self.send_command(&CommandEnvelope::bare(Command::Exit))
    }

    /// The header is a bare JSON object followed directly by file bytes.
    fn read_file_header(&mut self) -> Result<FileHeader> {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let parsed = {
                let mut stream =
                    serde_json::Deserializer::from_slice(&data).into_iter::<FileHeader>();
                match stream.next() {
                    Some(Ok(header)) => Some((header, stream.byte_offset())),
                    Some(Err(err)) if !err.is_eof() => return Err(err.into()),
                    _ => None,
                }
            };
            if let Some((header, consumed)) = parsed {
                self.conn.unread(&data[consumed..]);
                return Ok(header);
            }
            if data.len() > MAX_HEADER_BYTES {
                return Err(RelayError::Protocol("file header too large".to_string()));
            }
            let n = match self.conn.read(&mut buf) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if n == 0 {
                return Err(RelayError::ConnectionClosed);
            }
            data.extend_from_slice(&buf[..n]);
        }
    }

    pub fn into_inner(self) -> S {
        self.conn.into_inner()
    }
}
