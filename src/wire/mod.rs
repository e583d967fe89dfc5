//! Record-oriented wire codec.
//!
//! A record is a flat ordered map of key/value items. The first unnamed
//! value is the command word. In text form a record is one ASCII line:
//! items separated by a single space, each `key=value` or a bare value for
//! an empty key. Spaces, `=`, `\` and control bytes are escaped inside
//! items, so values may carry arbitrary bytes.
//!
//! Protocol major version 4 upgrades the encoding with three negotiated
//! options: empty values rendered as `~` (null-tilde), elision of a key
//! repeating the previous item's key, and a binary length-prefixed frame
//! around each record (see `framing`).

mod framing;
#[cfg(test)]
mod tests;

pub use framing::{frame_record, LineDecoder};

use std::fmt;

/// Key of the unnamed command item.
pub const REC_NAME: &str = "";

/// Negotiated encoding options, off by default (protocol ≤ 3 peers).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RecOptions {
    /// Encode an empty value as `~`.
    pub null_tilde: bool,
    /// Elide a key equal to the previous item's key, writing `*`.
    pub repeat_len: bool,
    /// Wrap each serialized record in a binary length frame.
    pub frame: bool,
}

impl RecOptions {
    /// The option set for a remote protocol major version.
    pub fn for_version(major: u32) -> RecOptions {
        if major >= 4 {
            RecOptions { null_tilde: true, repeat_len: true, frame: true }
        } else {
            RecOptions::default()
        }
    }
}

/// Decode failures. A malformed record never kills a session; the caller
/// replies with an `err` record and continues.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// A `\NNN` escape does not name a byte.
    BadEscape,
    /// A frame header length does not match the payload.
    FrameLength,
    /// A binary frame exceeds the sanity limit.
    FrameTooLong,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::BadEscape => write!(f, "bad escape sequence"),
            DecodeError::FrameLength => write!(f, "frame length mismatch"),
            DecodeError::FrameTooLong => write!(f, "frame too long"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// An ordered key/value record. Duplicate keys are allowed and keep their
/// order; enumerated keys (`item1`..`itemN`) have dedicated helpers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordMap {
    items: Vec<(Vec<u8>, Vec<u8>)>,
}

impl RecordMap {
    pub fn new() -> RecordMap {
        RecordMap::default()
    }

    /// Starts a record with its command word.
    pub fn command(cmd: &str) -> RecordMap {
        let mut map = RecordMap::new();
        map.add(REC_NAME, cmd.as_bytes());
        map
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn add(&mut self, key: &str, value: &[u8]) -> &mut Self {
        self.items.push((key.as_bytes().to_vec(), value.to_vec()));
        self
    }

    pub fn add_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.add(key, value.as_bytes())
    }

    pub fn add_num(&mut self, key: &str, value: i64) -> &mut Self {
        self.add(key, value.to_string().as_bytes())
    }

    /// Adds an enumerated item, e.g. `item3`.
    pub fn add_enum(&mut self, key: &str, index: usize, value: &str) -> &mut Self {
        self.add(&format!("{}{}", key, index), value.as_bytes())
    }

    /// Adds a list of bare (empty-key) values.
    pub fn add_values<I: IntoIterator<Item = S>, S: AsRef<str>>(&mut self, values: I) -> &mut Self {
        for v in values {
            self.add(REC_NAME, v.as_ref().as_bytes());
        }
        self
    }

    /// Appends all items of another record.
    pub fn add_map(&mut self, other: &RecordMap) -> &mut Self {
        self.items.extend(other.items.iter().cloned());
        self
    }

    /// First value with the given key.
    pub fn value(&self, key: &str) -> Option<&[u8]> {
        let key = key.as_bytes();
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_slice())
    }

    pub fn value_or<'a>(&'a self, key: &str, default: &'a [u8]) -> &'a [u8] {
        self.value(key).unwrap_or(default)
    }

    pub fn value_string(&self, key: &str) -> String {
        String::from_utf8_lossy(self.value(key).unwrap_or_default()).into_owned()
    }

    pub fn value_num(&self, key: &str, default: i64) -> i64 {
        self.value(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default)
    }

    /// The command word (first item with an empty key).
    pub fn command_word(&self) -> &[u8] {
        self.value(REC_NAME).unwrap_or_default()
    }

    /// All bare (empty-key) values except the command word.
    pub fn values(&self) -> Vec<Vec<u8>> {
        self.items.iter().filter(|(k, _)| k.is_empty()).skip(1).map(|(_, v)| v.clone()).collect()
    }

    /// Value of an enumerated item, e.g. (`item`, 3) -> `item3`.
    pub fn value_enum(&self, key: &str, index: usize) -> Option<&[u8]> {
        self.value(&format!("{}{}", key, index))
    }

    /// Highest index N such that `keyN` exists.
    pub fn max_enum_of(&self, key: &str) -> usize {
        let key = key.as_bytes();
        let mut max = 0;
        for (k, _) in &self.items {
            if let Some(rest) = k.strip_prefix(key) {
                if !rest.is_empty() && rest.iter().all(u8::is_ascii_digit) {
                    if let Ok(n) = std::str::from_utf8(rest).unwrap_or("0").parse::<usize>() {
                        max = max.max(n);
                    }
                }
            }
        }
        max
    }

    // ---- text form ----------------------------------------------------

    /// Serializes to the line form (no terminator, no binary frame).
    pub fn to_line(&self, opts: RecOptions) -> Vec<u8> {
        let mut out = Vec::new();
        let mut prev_key: Option<&[u8]> = None;
        for (key, value) in &self.items {
            if !out.is_empty() {
                out.push(b' ');
            }
            let repeat = opts.repeat_len && !key.is_empty() && prev_key == Some(key.as_slice());
            if repeat {
                out.push(b'*');
                out.push(b'=');
            } else if !key.is_empty() {
                escape_into(key, &mut out);
                out.push(b'=');
            }
            if opts.null_tilde && value.is_empty() && !key.is_empty() {
                out.push(b'~');
            } else {
                let start = out.len();
                escape_into(value, &mut out);
                // A leading literal tilde must not read back as null.
                if opts.null_tilde && out.get(start) == Some(&b'~') {
                    out.splice(start..start + 1, *b"\\126");
                }
            }
            prev_key = Some(key.as_slice());
        }
        out
    }

    /// Serializes a whole outbound record: framed when the options say so,
    /// always terminated for the line transport.
    pub fn to_wire(&self, opts: RecOptions) -> Vec<u8> {
        let line = self.to_line(opts);
        if opts.frame {
            frame_record(&line)
        } else {
            let mut out = line;
            out.extend_from_slice(b"\r\n");
            out
        }
    }

    /// Parses the line form. `opts` only governs the null-tilde and
    /// repeat-key expansions; plain input always parses.
    pub fn from_line(line: &[u8], opts: RecOptions) -> Result<RecordMap, DecodeError> {
        let mut map = RecordMap::new();
        let mut prev_key: Vec<u8> = Vec::new();
        for item in line.split(|&b| b == b' ') {
            if item.is_empty() {
                continue;
            }
            let (raw_key, raw_value) = split_item(item);
            let key = if opts.repeat_len && raw_key == b"*" {
                prev_key.clone()
            } else {
                unescape(raw_key)?
            };
            let value = if opts.null_tilde && raw_value == b"~" && !key.is_empty() {
                Vec::new()
            } else {
                unescape(raw_value)?
            };
            prev_key = key.clone();
            map.items.push((key, value));
        }
        Ok(map)
    }
}

/// Splits one item at its key/value separator, skipping escaped `\=`.
fn split_item(item: &[u8]) -> (&[u8], &[u8]) {
    let mut esc = false;
    for (i, &b) in item.iter().enumerate() {
        if esc {
            esc = false;
        } else if b == b'\\' {
            esc = true;
        } else if b == b'=' {
            return (&item[..i], &item[i + 1..]);
        }
    }
    (&item[..0], item)
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' => out.extend_from_slice(b"\\_"),
            b'=' => out.extend_from_slice(b"\\="),
            b if b < 0x20 => {
                out.push(b'\\');
                out.extend_from_slice(format!("{:03}", b).as_bytes());
            }
            b => out.push(b),
        }
    }
}

fn unescape(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'\\' {
            out.push(data[i]);
            i += 1;
            continue;
        }
        let Some(&next) = data.get(i + 1) else {
            return Err(DecodeError::BadEscape);
        };
        match next {
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            b'_' => {
                out.push(b' ');
                i += 2;
            }
            b'=' => {
                out.push(b'=');
                i += 2;
            }
            d if d.is_ascii_digit() => {
                if i + 3 >= data.len()
                    || !data[i + 2].is_ascii_digit()
                    || !data[i + 3].is_ascii_digit()
                {
                    return Err(DecodeError::BadEscape);
                }
                let n = (data[i + 1] - b'0') as u16 * 100
                    + (data[i + 2] - b'0') as u16 * 10
                    + (data[i + 3] - b'0') as u16;
                if n > 255 {
                    return Err(DecodeError::BadEscape);
                }
                out.push(n as u8);
                i += 4;
            }
            _ => return Err(DecodeError::BadEscape),
        }
    }
    Ok(out)
}
