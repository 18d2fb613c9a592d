//! Per-connection command dispatch.
//!
//! A session starts `AWAITING` with an open gate: neither source nor target
//! has arrived. Each command may fill one half of the pair; once both are
//! present the session is `READY` and control passes to the processor. `EXIT`,
//! an unparseable command, a closed connection, or the end of a frame stream
//! terminate the session before that point.
//!
//! The frame stream blocks the dispatch loop for as long as it runs; no other
//! command is read until it ends or the processor asks to stop.

use std::io::{Read, Write};
use std::path::PathBuf;

use crate::command::{read_command, Command, CommandEnvelope, Decoded, DEFAULT_COMMAND_READ_LIMIT};
use crate::connection::Connection;
use crate::error::{RelayError, Result};
use crate::frame::{DecodedFrame, FrameDecoder, FrameDeframer, JpegDecoder, DEFAULT_MAX_FRAME_BYTES};
use crate::layout::{DirectoryResolution, FileKind, ResponseFormat};
use crate::transfer::{receive_with_retry, send_file, RetryPolicy, DEFAULT_CHUNK_SIZE};

/// Everything a session needs from startup configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionProfile {
    pub layout: DirectoryResolution,
    pub response_format: ResponseFormat,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
    pub command_read_limit: usize,
    pub max_frame_bytes: usize,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            layout: DirectoryResolution::Folders {
                source_dir: PathBuf::from("output/source"),
                target_dir: PathBuf::from("output/target"),
                output_dir: PathBuf::from("output/swapped"),
                output_file: "swapped.jpg".to_string(),
            },
            response_format: ResponseFormat::Headered,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            command_read_limit: DEFAULT_COMMAND_READ_LIMIT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Precondition flags. `ready` always equals `have_source && have_target`
/// after `evaluate`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Gate {
    pub have_source: bool,
    pub have_target: bool,
    pub ready: bool,
    pub streaming: bool,
}

impl Gate {
    /// Recompute `ready`; returns true on the transition to ready.
    pub fn evaluate(&mut self) -> bool {
        let was_ready = self.ready;
        self.ready = self.have_source && self.have_target;
        self.ready && !was_ready
    }
}

/// Files stored during a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceivedFiles {
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Both inputs present; processing may start.
    Ready,
    /// Peer sent `EXIT`.
    Exit,
    /// The live frame stream closed.
    StreamEnded,
    /// Peer closed the connection between commands.
    Disconnected,
    /// Unparseable command or missing metadata.
    ProtocolError(String),
}

/// A receive that used up its retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferFailure {
    pub kind: FileKind,
    pub destination: PathBuf,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub gate: Gate,
    pub files: ReceivedFiles,
    pub commands: u32,
    pub frames_processed: u64,
    pub transfer_failures: Vec<TransferFailure>,
}

/// What the processor wants after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameControl {
    Continue,
    Stop,
}

/// Downstream collaborator: consumes live frames and takes over once ready.
pub trait Processor {
    fn on_frame(&mut self, frame: DecodedFrame) -> FrameControl {
        log::debug!("frame {}x{} dropped", frame.width, frame.height);
        FrameControl::Continue
    }

    fn on_ready(&mut self, files: &ReceivedFiles) {
        log::info!(
            "ready: source={:?} target={:?}",
            files.source,
            files.target
        );
    }
}

/// Processor that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProcessor;

impl Processor for NullProcessor {}

enum Step {
    Continue,
    End(SessionOutcome),
}

pub struct Session<'a, S, P: ?Sized> {
    conn: Connection<S>,
    profile: &'a SessionProfile,
    processor: &'a mut P,
    decoder: Box<dyn FrameDecoder + Send + 'a>,
    gate: Gate,
    files: ReceivedFiles,
    commands: u32,
    frames_processed: u64,
    transfer_failures: Vec<TransferFailure>,
}

impl<'a, S, P> Session<'a, S, P>
where
    S: Read + Write,
    P: Processor + ?Sized,
{
    pub fn new(stream: S, profile: &'a SessionProfile, processor: &'a mut P) -> Self {
        Self {
            conn: Connection::new(stream),
            profile,
            processor,
            decoder: Box::new(JpegDecoder),
            gate: Gate::default(),
            files: ReceivedFiles::default(),
            commands: 0,
            frames_processed: 0,
            transfer_failures: Vec::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: impl FrameDecoder + Send + 'a) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    /// Run the dispatch loop until the session reaches a terminal state.
    ///
    /// I/O failures while writing to the peer or reading a command are
    /// returned as errors; everything else is reported in the outcome.
    pub fn run(mut self) -> Result<SessionReport> {
        let outcome = loop {
            if self.gate.ready {
                break SessionOutcome::Ready;
            }
            let decoded = match read_command(&mut self.conn, self.profile.command_read_limit)? {
                Some(decoded) => decoded,
                None => {
                    log::info!("client disconnected");
                    break SessionOutcome::Disconnected;
                }
            };
            let envelope = match decoded {
                Decoded::Envelope { envelope, rest } => {
                    self.conn.unread(&rest);
                    envelope
                }
                Decoded::Unparseable => {
                    log::warn!("invalid command; closing session");
                    break SessionOutcome::ProtocolError("unparseable command".to_string());
                }
            };
            self.commands += 1;
            log::debug!("command #{}: {:?}", self.commands, envelope);

            if let Step::End(outcome) = self.dispatch(envelope)? {
                break outcome;
            }
            if self.gate.evaluate() {
                log::info!("source and target received; session ready");
            }
        };

        let dropped = self.conn.discard_pending();
        if dropped > 0 {
            log::debug!("{} unread bytes discarded at session end", dropped);
        }
        Ok(SessionReport {
            outcome,
            gate: self.gate,
            files: self.files,
            commands: self.commands,
            frames_processed: self.frames_processed,
            transfer_failures: self.transfer_failures,
        })
    }

    fn dispatch(&mut self, envelope: CommandEnvelope) -> Result<Step> {
        match envelope.command {
            Command::SendSource => self.receive(FileKind::Source, &envelope),
            Command::SendTarget => self.receive(FileKind::Target, &envelope),
            Command::RequestFile => {
                self.send_output(envelope.file_name.as_deref())?;
                Ok(Step::Continue)
            }
            Command::StartFrames => self.stream_frames(),
            Command::StopFrames => {
                self.stop_streaming();
                Ok(Step::Continue)
            }
            Command::Exit => {
                log::info!("client requested exit");
                Ok(Step::End(SessionOutcome::Exit))
            }
        }
    }

    fn receive(&mut self, kind: FileKind, envelope: &CommandEnvelope) -> Result<Step> {
        let (Some(file_name), Some(file_size)) = (&envelope.file_name, envelope.file_size) else {
            let reason = format!("{} without file_name/file_size", envelope.command);
            log::warn!("{}", reason);
            return Ok(Step::End(SessionOutcome::ProtocolError(reason)));
        };
        let destination = match self.profile.layout.receive_path(kind, file_name) {
            Ok(path) => path,
            Err(RelayError::Protocol(reason)) => {
                log::warn!("{}", reason);
                return Ok(Step::End(SessionOutcome::ProtocolError(reason)));
            }
            Err(err) => return Err(err),
        };

        match receive_with_retry(
            &mut self.conn,
            &destination,
            file_size,
            &self.profile.retry,
            self.profile.chunk_size,
        ) {
            Ok(_) => {
                match kind {
                    FileKind::Source => {
                        self.gate.have_source = true;
                        self.files.source = Some(destination);
                    }
                    FileKind::Target => {
                        self.gate.have_target = true;
                        self.files.target = Some(destination);
                    }
                }
                Ok(Step::Continue)
            }
            Err(RelayError::RetriesExhausted { attempts, last }) => {
                log::error!(
                    "giving up on {:?} file {} after {} attempts: {}",
                    kind,
                    destination.display(),
                    attempts,
                    last
                );
                self.transfer_failures.push(TransferFailure {
                    kind,
                    destination,
                    attempts,
                    reason: last.to_string(),
                });
                Ok(Step::Continue)
            }
            Err(err) => Err(err),
        }
    }

    fn send_output(&mut self, requested_name: Option<&str>) -> Result<()> {
        let path = match self.profile.layout.output_path(requested_name) {
            Ok(path) => path,
            Err(err) => {
                log::warn!("cannot serve requested file: {}", err);
                return Ok(());
            }
        };
        match send_file(
            &mut self.conn,
            &path,
            self.profile.response_format,
            self.profile.chunk_size,
        ) {
            Ok(_) | Err(RelayError::FileMissing(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn stream_frames(&mut self) -> Result<Step> {
        // A live capture stands in for a file-based source.
        self.gate.have_source = true;
        self.gate.streaming = true;
        if self.gate.evaluate() {
            log::info!("target already present; skipping frame stream");
        }
        log::info!("frame capture started");

        let mut deframer = FrameDeframer::new(self.profile.chunk_size, self.profile.max_frame_bytes);
        while self.gate.streaming && !self.gate.ready {
            match deframer.next_frame(&mut self.conn, self.decoder.as_mut()) {
                Ok(Some(frame)) => {
                    self.frames_processed += 1;
                    if self.processor.on_frame(frame) == FrameControl::Stop {
                        self.stop_streaming();
                    }
                }
                Ok(None) => {
                    self.gate.streaming = false;
                    log::info!(
                        "frame stream ended after {} frames",
                        deframer.frames_extracted()
                    );
                    return Ok(Step::End(SessionOutcome::StreamEnded));
                }
                Err(err) => {
                    self.gate.streaming = false;
                    log::warn!("frame stream read failed: {}", err);
                    return Ok(Step::End(SessionOutcome::StreamEnded));
                }
            }
        }
        // Commands sent after the last frame may already be buffered.
        let leftover = deframer.take_buffered();
        self.conn.unread(&leftover);
        self.gate.streaming = false;
        Ok(Step::Continue)
    }

    fn stop_streaming(&mut self) {
        self.gate.streaming = false;
        log::info!("frame capture stopped");
    }
}
