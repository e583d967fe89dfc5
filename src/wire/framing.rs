//! Transport framing of records.
//!
//! Up to protocol major 3 every record is an ASCII line ending in CR-LF.
//! From major 4 on, both sides switch to a binary frame per record: a
//! marker byte, a big-endian u32 payload length, then the payload. The
//! decoder accepts both at any time (the `ver` exchange itself always
//! travels as a line), keyed on the marker byte, which can never start an
//! escaped text line.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::DecodeError;

/// Marker byte starting a binary frame.
pub(crate) const FRAME_MARK: u8 = 0x02;

/// Upper bound for one record; anything bigger is a corrupt stream.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Wraps a serialized record line into a binary frame.
pub fn frame_record(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 5);
    out.push(FRAME_MARK);
    out.write_u32::<BigEndian>(line.len() as u32).expect("vec write");
    out.extend_from_slice(line);
    out
}

/// Incremental decoder splitting a byte stream into record payloads.
pub struct LineDecoder {
    buf: Vec<u8>,
    read_pos: usize,
}

impl LineDecoder {
    pub fn new() -> LineDecoder {
        LineDecoder { buf: Vec::new(), read_pos: 0 }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extracts the next complete record payload, or `None` when more
    /// bytes are needed.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let avail = &self.buf[self.read_pos..];
        if avail.is_empty() {
            self.compact();
            return Ok(None);
        }

        if avail[0] == FRAME_MARK {
            if avail.len() < 5 {
                return Ok(None);
            }
            let len = BigEndian::read_u32(&avail[1..5]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(DecodeError::FrameTooLong);
            }
            if avail.len() < 5 + len {
                return Ok(None);
            }
            let payload = avail[5..5 + len].to_vec();
            self.read_pos += 5 + len;
            self.compact();
            return Ok(Some(payload));
        }

        match avail.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut payload = avail[..pos].to_vec();
                payload.retain(|&b| b != b'\r');
                self.read_pos += pos + 1;
                self.compact();
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    fn compact(&mut self) {
        if self.read_pos > 0 {
            self.buf.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        LineDecoder::new()
    }
}
