use std::ops::Range;

use thiserror::Error;

use super::{Dict, Value};

/// Containers nested deeper than this are rejected, a torrent file needs 4.
pub const MAX_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("container starting at byte {0} is not terminated")]
    Unterminated(usize),

    #[error("invalid byte string length at byte {0}")]
    InvalidLength(usize),

    #[error("malformed integer at byte {0}")]
    InvalidInteger(usize),

    #[error("dictionary key at byte {0} is not a byte string")]
    NonStringKey(usize),

    #[error("unexpected byte {byte:#04x} at byte {pos}")]
    UnexpectedByte { byte: u8, pos: usize },

    #[error("trailing data after the value at byte {0}")]
    TrailingData(usize),

    #[error("nesting deeper than 64 levels")]
    TooDeep,
}

/// Decode a buffer that must contain exactly one value.
pub fn decode(buf: &[u8]) -> Result<Value, DecodeError> {
    let mut decoder = Decoder::new(buf);
    let value = decoder.parse(0)?;
    if decoder.pos != buf.len() {
        return Err(DecodeError::TrailingData(decoder.pos));
    }
    Ok(value)
}

/// Decode the first value of the buffer, returning it with the number of
/// bytes it used. Whatever comes after is left to the caller.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut decoder = Decoder::new(buf);
    let value = decoder.parse(0)?;
    Ok((value, decoder.pos))
}

/// Incremental decoder over a byte slice, yields one value at a time and
/// can report the raw span of the values it walks over.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Byte offset of the next value.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Decode the next value, `None` when the input is exhausted.
    pub fn next_value(&mut self) -> Result<Option<Value>, DecodeError> {
        if self.is_empty() {
            return Ok(None);
        }
        self.parse(0).map(Some)
    }

    /// Walk over the next value without keeping it, return its raw span.
    pub fn skip_value(&mut self) -> Result<Range<usize>, DecodeError> {
        let start = self.pos;
        self.parse(0)?;
        Ok(start..self.pos)
    }

    /// Raw bytes of the value of `key` in the top-level dictionary of `buf`,
    /// exactly as they appear in the source.
    pub fn raw_dict_value<'k>(
        buf: &'a [u8],
        key: &'k [u8],
    ) -> Result<Option<&'a [u8]>, DecodeError> {
        let mut decoder = Decoder::new(buf);
        match decoder.peek() {
            Some(b'd') => decoder.pos += 1,
            Some(byte) => {
                return Err(DecodeError::UnexpectedByte { byte, pos: 0 })
            }
            None => return Err(DecodeError::UnexpectedEof(0)),
        }

        loop {
            match decoder.peek() {
                None => return Err(DecodeError::Unterminated(0)),
                Some(b'e') => return Ok(None),
                Some(b'0'..=b'9') => {}
                Some(_) => return Err(DecodeError::NonStringKey(decoder.pos)),
            }
            let k = decoder.parse_bytes()?;
            let span = decoder.skip_value()?;
            if k == key {
                return Ok(Some(&buf[span]));
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn parse(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        match self.peek() {
            None => Err(DecodeError::UnexpectedEof(self.pos)),
            Some(b'i') => self.parse_int().map(Value::Int),
            Some(b'0'..=b'9') => self.parse_bytes().map(Value::Bytes),
            Some(b'l') => {
                let start = self.pos;
                self.pos += 1;
                let mut list = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(DecodeError::Unterminated(start)),
                        Some(b'e') => {
                            self.pos += 1;
                            return Ok(Value::List(list));
                        }
                        Some(_) => list.push(self.parse(depth + 1)?),
                    }
                }
            }
            Some(b'd') => {
                let start = self.pos;
                self.pos += 1;
                let mut dict = Dict::new();
                loop {
                    match self.peek() {
                        None => return Err(DecodeError::Unterminated(start)),
                        Some(b'e') => {
                            self.pos += 1;
                            return Ok(Value::Dict(dict));
                        }
                        Some(b'0'..=b'9') => {
                            let key = self.parse_bytes()?;
                            if self.is_empty() {
                                return Err(DecodeError::Unterminated(start));
                            }
                            let value = self.parse(depth + 1)?;
                            dict.push_unchecked(key, value);
                        }
                        Some(_) => {
                            return Err(DecodeError::NonStringKey(self.pos))
                        }
                    }
                }
            }
            Some(byte) => {
                Err(DecodeError::UnexpectedByte { byte, pos: self.pos })
            }
        }
    }

    /// `i<digits>e`
    fn parse_int(&mut self) -> Result<i64, DecodeError> {
        let start = self.pos;
        // skip the `i`
        let digits_start = start + 1;
        let Some(len) =
            self.buf[digits_start..].iter().position(|&b| b == b'e')
        else {
            return Err(DecodeError::UnexpectedEof(self.buf.len()));
        };
        let digits = &self.buf[digits_start..digits_start + len];

        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        let negative = unsigned.len() != digits.len();

        let well_formed = !unsigned.is_empty()
            && unsigned.iter().all(u8::is_ascii_digit)
            && !(unsigned.len() > 1 && unsigned[0] == b'0')
            && !(negative && unsigned == b"0");

        if !well_formed {
            return Err(DecodeError::InvalidInteger(start));
        }

        let n = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(DecodeError::InvalidInteger(start))?;

        self.pos = digits_start + len + 1;
        Ok(n)
    }

    /// `<len>:<bytes>`
    fn parse_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            match self.peek() {
                None => return Err(DecodeError::UnexpectedEof(self.pos)),
                Some(b':') => break,
                Some(d @ b'0'..=b'9') => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((d - b'0') as usize))
                        .ok_or(DecodeError::InvalidLength(start))?;
                    self.pos += 1;
                }
                Some(_) => return Err(DecodeError::InvalidLength(start)),
            }
        }
        if self.pos == start {
            return Err(DecodeError::InvalidLength(start));
        }

        // skip the `:`
        self.pos += 1;

        let end = self
            .pos
            .checked_add(len)
            .ok_or(DecodeError::InvalidLength(start))?;
        if end > self.buf.len() {
            return Err(DecodeError::UnexpectedEof(self.buf.len()));
        }

        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}
