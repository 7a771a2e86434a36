//! MJPEG byte-stream segmentation
//!
//! A decoder child process writes a concatenated stream of baseline JPEG
//! images to its stdout. This module splits that stream into individual
//! frames on SOI (0xFF 0xD8) / EOI (0xFF 0xD9) boundaries and extracts the
//! image dimensions from the SOF header without a full decode.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Safety cap: a buffer that grows past this without a complete frame is
/// discarded and the splitter resynchronises at the next SOI.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum JpegError {
    #[error("invalid JPEG: too short")]
    TooShort,

    #[error("missing SOI marker")]
    MissingSoi,

    #[error("no SOF marker found")]
    MissingSof,
}

/// JPEG marker codes
#[allow(dead_code)]
mod markers {
    pub const SOI: u8 = 0xD8; // Start of Image
    pub const EOI: u8 = 0xD9; // End of Image
    pub const SOS: u8 = 0xDA; // Start of Scan
    pub const SOF0: u8 = 0xC0; // Start of Frame (Baseline)
    pub const SOF2: u8 = 0xC2; // Start of Frame (Progressive)
    pub const DHT: u8 = 0xC4; // Define Huffman Table
    pub const RST0: u8 = 0xD0; // Restart markers D0-D7
    pub const RST7: u8 = 0xD7;
    pub const TEM: u8 = 0x01;
}

/// Incremental splitter over a concatenated MJPEG byte stream.
///
/// Feed raw reads with [`MjpegSplitter::push`], then drain complete frames
/// with [`MjpegSplitter::next_frame`] until it returns `None`.
pub struct MjpegSplitter {
    buf: BytesMut,
    /// Count of buffer overflow resets since creation.
    resets: u64,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256 * 1024),
            resets: 0,
        }
    }

    /// Appends raw bytes read from the child process.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete JPEG frame, or `None` if the buffer does
    /// not yet hold one. Leading garbage before the first SOI is dropped.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        // Drop anything before the first SOI so a mid-stream join or a
        // post-overflow reset resynchronises cleanly.
        match find_marker(&self.buf, markers::SOI, 0) {
            Some(start) => {
                if start > 0 {
                    let _ = self.buf.split_to(start);
                }
            }
            None => {
                // Keep a trailing 0xFF in case the SOI spans two reads.
                let keep = if self.buf.last() == Some(&0xFF) { 1 } else { 0 };
                let drop = self.buf.len() - keep;
                let _ = self.buf.split_to(drop);
                return None;
            }
        }

        match find_marker(&self.buf, markers::EOI, 2) {
            Some(end) => {
                let frame = self.buf.split_to(end + 2);
                Some(frame.freeze())
            }
            None => {
                if self.buf.len() > MAX_FRAME_BYTES {
                    // Runaway frame: reset and pick up at the next SOI.
                    self.buf.clear();
                    self.resets += 1;
                }
                None
            }
        }
    }

    /// Number of overflow resets performed.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Bytes currently held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(buf: &[u8], marker: u8, from: usize) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let mut pos = from;
    while pos + 1 < buf.len() {
        if buf[pos] == 0xFF && buf[pos + 1] == marker {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

/// Parses width and height from the SOF segment of a JPEG image.
pub fn jpeg_dimensions(data: &[u8]) -> Result<(u32, u32), JpegError> {
    if data.len() < 4 {
        return Err(JpegError::TooShort);
    }
    if data[0] != 0xFF || data[1] != markers::SOI {
        return Err(JpegError::MissingSoi);
    }

    let mut pos = 2;
    while pos + 3 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        let marker = data[pos + 1];
        pos += 2;

        // Standalone markers carry no length field.
        if marker == markers::TEM
            || (markers::RST0..=markers::RST7).contains(&marker)
            || marker == markers::SOI
        {
            continue;
        }
        if marker == markers::EOI {
            break;
        }

        if pos + 2 > data.len() {
            break;
        }
        let length = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;

        // SOFn layout: length(2) precision(1) height(2) width(2) ...
        if (marker == markers::SOF0 || marker == markers::SOF2) && pos + 7 <= data.len() {
            let height = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as u32;
            let width = u16::from_be_bytes([data[pos + 5], data[pos + 6]]) as u32;
            return Ok((width, height));
        }

        if marker == markers::SOS {
            // Entropy-coded data follows; no SOF was seen before it.
            break;
        }

        pos += length;
    }

    Err(JpegError::MissingSof)
}
