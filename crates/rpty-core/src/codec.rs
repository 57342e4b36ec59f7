//! Streaming JSON framing for the client → session direction.
//!
//! Wire format: consecutive JSON values, optionally separated by whitespace
//! or newlines. A value may arrive split across any number of reads.

use crate::error::{RptyError, RptyResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value as a newline-terminated JSON frame.
pub fn frame_encode<T: Serialize>(value: &T) -> RptyResult<Vec<u8>> {
    let mut frame = serde_json::to_vec(value)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Largest single frame the decoder accepts, in bytes.
pub const MAX_FRAME_SIZE: usize = 4 << 20;

/// Streaming frame decoder: accumulates bytes and yields one value at a time.
///
/// Objects, arrays and strings are delimited by scanning each byte once, so
/// a frame split across many reads is parsed only after its last byte
/// arrives. Invalid UTF-8 inside a frame is replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct JsonFrameDecoder {
    buffer: Vec<u8>,
    scan: Scan,
}

/// Progress through the value at the front of the buffer.
#[derive(Debug, Default)]
struct Scan {
    /// Bytes already scanned; zero means no value has started.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the connection.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete value, if one is buffered.
    ///
    /// Returns `Ok(None)` when the buffer holds nothing or only part of a
    /// value. A malformed or oversized value discards the buffer and returns
    /// a codec error.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> RptyResult<Option<T>> {
        if self.scan.pos == 0 {
            let blank = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buffer.drain(..blank);
        }
        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };

        if !matches!(first, b'{' | b'[' | b'"') {
            return self.next_scalar();
        }
        let Some(end) = self.scan_to_end() else {
            if self.buffer.len() > MAX_FRAME_SIZE {
                return Err(self.reject(oversized(self.buffer.len())));
            }
            return Ok(None);
        };
        if end > MAX_FRAME_SIZE {
            return Err(self.reject(oversized(end)));
        }

        let parsed = serde_json::from_str::<T>(&String::from_utf8_lossy(&self.buffer[..end]));
        match parsed {
            Ok(value) => {
                self.buffer.drain(..end);
                self.scan = Scan::default();
                Ok(Some(value))
            }
            Err(e) => Err(self.reject(e.into())),
        }
    }

    /// Advance the scan over newly buffered bytes. Returns the end offset of
    /// the front value once its closing delimiter is seen.
    fn scan_to_end(&mut self) -> Option<usize> {
        let scan = &mut self.scan;
        for (i, &b) in self.buffer.iter().enumerate().skip(scan.pos) {
            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if b == b'\\' {
                    scan.escaped = true;
                } else if b == b'"' {
                    scan.in_string = false;
                    if scan.depth == 0 {
                        return Some(i + 1);
                    }
                }
                continue;
            }
            match b {
                b'"' => scan.in_string = true,
                b'{' | b'[' => scan.depth += 1,
                b'}' | b']' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    if scan.depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        scan.pos = self.buffer.len();
        None
    }

    /// Top-level numbers and literals have no closing delimiter; let serde
    /// find where they end.
    fn next_scalar<T: DeserializeOwned>(&mut self) -> RptyResult<Option<T>> {
        let (result, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<T>();
            match stream.next() {
                Some(Ok(value)) => (Ok(Some(value)), stream.byte_offset()),
                Some(Err(e)) if e.is_eof() && self.buffer.len() <= MAX_FRAME_SIZE => (Ok(None), 0),
                Some(Err(e)) => (Err(e.into()), self.buffer.len()),
                None => (Ok(None), self.buffer.len()),
            }
        };
        self.buffer.drain(..consumed);
        result
    }

    fn reject(&mut self, err: RptyError) -> RptyError {
        self.buffer.clear();
        self.scan = Scan::default();
        err
    }

    /// Whether an incomplete value is buffered.
    pub fn has_partial(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn oversized(len: usize) -> RptyError {
    RptyError::Codec(format!(
        "frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE} bytes"
    ))
}
