//! JPEG frame de-framing.
//!
//! Live capture arrives as back-to-back JPEG images with no length prefix or
//! separator. Frames are recovered using only the start-of-image (`FF D8`) and
//! end-of-image (`FF D9`) markers.
//!
//! The deframer owns a single growing buffer. Bytes that follow a complete
//! frame stay buffered for the next call, so several frames delivered by one
//! socket read are returned one at a time without further reads.

use image::GenericImageView;
use std::io::{ErrorKind, Read};

use crate::error::Result;
use crate::transfer::DEFAULT_CHUNK_SIZE;

pub const SOI_MARKER: [u8; 2] = [0xFF, 0xD8];
pub const EOI_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Largest single frame accepted before partial data is discarded.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

/// A decoded frame (RGB8), handed to the processor and then dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Turns one delimited JPEG into a frame.
pub trait FrameDecoder {
    fn decode(&mut self, jpeg: &[u8]) -> Result<DecodedFrame>;
}

/// Decoder backed by the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct JpegDecoder;

impl FrameDecoder for JpegDecoder {
    fn decode(&mut self, jpeg: &[u8]) -> Result<DecodedFrame> {
        let image = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)?;
        let (width, height) = image.dimensions();
        Ok(DecodedFrame {
            width,
            height,
            pixels: image.into_rgb8().into_raw(),
        })
    }
}

pub struct FrameDeframer {
    buffer: Vec<u8>,
    chunk_size: usize,
    max_frame_bytes: usize,
    frames: u64,
    skipped: u64,
}

impl Default for FrameDeframer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDeframer {
    pub fn new(chunk_size: usize, max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            chunk_size: chunk_size.max(1),
            max_frame_bytes: max_frame_bytes.max(1),
            frames: 0,
            skipped: 0,
        }
    }

    /// Next complete JPEG, or `None` once the stream ends.
    pub fn next_jpeg<R: Read>(&mut self, reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                self.frames += 1;
                return Ok(Some(frame));
            }
            self.trim_oversized();

            let n = match reader.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if n == 0 {
                if !self.buffer.is_empty() {
                    log::debug!(
                        "frame stream ended with {} unframed bytes",
                        self.buffer.len()
                    );
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Bound the buffer when it holds no complete frame.
    ///
    /// Bytes before the latest start marker can never become part of a frame.
    /// If what remains is still too large, only the last byte is kept since it
    /// may be the first half of a marker.
    fn trim_oversized(&mut self) {
        let limit = self.max_frame_bytes.saturating_mul(2);
        if self.buffer.len() <= limit {
            return;
        }
        let keep_from = match rfind_marker(&self.buffer, SOI_MARKER) {
            Some(pos) if self.buffer.len() - pos <= limit => pos,
            _ => self.buffer.len() - 1,
        };
        log::warn!(
            "no complete frame within {} bytes; discarding {} bytes",
            self.buffer.len(),
            keep_from
        );
        self.buffer.drain(..keep_from);
    }

    /// Next decodable frame. Undecodable frames are logged and skipped.
    pub fn next_frame<R: Read, D: FrameDecoder + ?Sized>(
        &mut self,
        reader: &mut R,
        decoder: &mut D,
    ) -> Result<Option<DecodedFrame>> {
        while let Some(jpeg) = self.next_jpeg(reader)? {
            match decoder.decode(&jpeg) {
                Ok(frame) => return Ok(Some(frame)),
                Err(err) => {
                    self.skipped += 1;
                    log::warn!("skipping undecodable frame ({} bytes): {}", jpeg.len(), err);
                }
            }
        }
        Ok(None)
    }

    /// Bytes buffered but not yet part of a returned frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_extracted(&self) -> u64 {
        self.frames
    }

    pub fn frames_skipped(&self) -> u64 {
        self.skipped
    }

    /// Hand back buffered bytes that are not part of any returned frame.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

/// Locate the first start marker and the first end marker after it.
///
/// Returns the half-open range covering both markers.
pub fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == SOI_MARKER)?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == EOI_MARKER)?;
    Some((start, start + 2 + end + 2))
}

fn rfind_marker(buffer: &[u8], marker: [u8; 2]) -> Option<usize> {
    buffer.windows(2).rposition(|w| w == marker)
}
