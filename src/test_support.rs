//! In-memory stream used by unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Serves a fixed script of reads and records everything written.
///
/// Each scripted entry is returned by exactly one `read` call (split if the
/// caller's buffer is smaller). An empty entry produces a zero-length read,
/// as does an exhausted script.
#[derive(Default)]
pub(crate) struct ScriptedStream {
    reads: VecDeque<Vec<u8>>,
    pub(crate) written: Vec<u8>,
    pub(crate) read_calls: usize,
}

impl ScriptedStream {
    pub(crate) fn new<I, B>(reads: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        Self {
            reads: reads.into_iter().map(|r| r.as_ref().to_vec()).collect(),
            written: Vec::new(),
            read_calls: 0,
        }
    }

    /// Split `data` into reads of at most `chunk` bytes.
    pub(crate) fn chunked(data: &[u8], chunk: usize) -> Self {
        Self::new(data.chunks(chunk.max(1)))
    }

    pub(crate) fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls += 1;
        let Some(mut next) = self.reads.pop_front() else {
            return Ok(0);
        };
        if next.len() > buf.len() {
            let tail = next.split_off(buf.len());
            self.reads.push_front(tail);
        }
        buf[..next.len()].copy_from_slice(&next);
        Ok(next.len())
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Minimal well-delimited JPEG-shaped byte run for de-framing tests.
pub(crate) fn fake_jpeg(body: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8];
    out.extend(body.iter().map(|b| if *b == 0xFF { 0xFE } else { *b }));
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

/// A real, decodable JPEG.
pub(crate) fn encoded_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7) as u8, (y * 11) as u8, 128])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .expect("encode jpeg");
    out.into_inner()
}
