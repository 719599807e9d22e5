//! Line accumulation and response-body collection.
//!
//! [`LineBuffer`] turns a stream of read chunks into complete records:
//! bytes accumulate in a sliding buffer, records split on `\n`, `\r` is
//! stripped, empty records are skipped. Classification of a record (URC,
//! terminator, body) is protocol-specific and lives with each dispatcher.
//!
//! [`ResponseAccumulator`] collects the body records of the in-flight
//! command, bounded at [`MAX_BODY_RECORDS`]; overflow collapses the tail
//! to `"..."` rather than growing without bound.

use bytes::BytesMut;

use crate::error::{BridgeError, Result};

/// Sliding buffer capacity. A buffer this full without a newline means the
/// peer is not speaking a line protocol; that is fatal.
pub const LINE_BUFFER_CAP: usize = 16 * 1024;

/// Response bodies keep at most this many records.
pub const MAX_BODY_RECORDS: usize = 32;

/// Accumulates raw bytes and yields complete, `\r`-stripped records.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(LINE_BUFFER_CAP),
        }
    }

    /// Append a read chunk and drain every completed record from it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = trim_record(&line);
            if !line.is_empty() {
                records.push(String::from_utf8_lossy(line).into_owned());
            }
        }

        if self.buf.len() >= LINE_BUFFER_CAP {
            return Err(BridgeError::BufferOverflow);
        }
        Ok(records)
    }

    /// Bytes of the incomplete trailing record, if any.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn trim_record(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((&last, rest)) = line.split_last() {
        if last == b'\n' || last == b'\r' {
            line = rest;
        } else {
            break;
        }
    }
    while let Some((&first, rest)) = line.split_first() {
        if first == b'\r' {
            line = rest;
        } else {
            break;
        }
    }
    line
}

/// Bounded collection of the in-flight command's body records.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    lines: Vec<String>,
    truncated: bool,
}

impl ResponseAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one body record; past the bound the tail collapses to `...`.
    pub fn push(&mut self, line: String) {
        if self.lines.len() < MAX_BODY_RECORDS {
            self.lines.push(line);
        } else if !self.truncated {
            self.truncated = true;
            if let Some(last) = self.lines.last_mut() {
                *last = "...".into();
            }
        }
    }

    /// True when no body record arrived yet.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Take the collected records, leaving the accumulator empty.
    pub fn take(&mut self) -> Vec<String> {
        self.truncated = false;
        std::mem::take(&mut self.lines)
    }
}
