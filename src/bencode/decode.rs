use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a single bencode value from a byte slice.
///
/// The input must contain exactly one complete value with no trailing
/// data; use [`decode_prefix`] to parse a value embedded in a larger
/// buffer.
///
/// # Examples
///
/// ```
/// use torpak::bencode::decode;
///
/// assert_eq!(decode(b"i42e").unwrap().as_integer(), Some(42));
/// assert_eq!(decode(b"5:hello").unwrap().as_str(), Some("hello"));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one bencode value from the front of a byte slice.
///
/// Returns the value and the number of bytes it occupied, leaving any
/// trailing data for the caller.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) -> Result<u8, BencodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BencodeError> {
        let data = self.data;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= data.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Advances to the next `stop` byte and returns the skipped slice.
    fn until(&mut self, stop: u8) -> Result<&'a [u8], BencodeError> {
        let data = self.data;
        let start = self.pos;
        while self.peek()? != stop {
            self.pos += 1;
        }
        let slice = &data[start..self.pos];
        self.pos += 1;
        Ok(slice)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.bump()?;
        let digits = self.until(b'e')?;
        let text = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;

        if text.is_empty() || text == "-" {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }
        // Negative values are legal; "-0" and leading zeros are not.
        if text.len() > 1 && (text.starts_with('0') || text.starts_with("-0")) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))?;
        Ok(Value::Integer(value))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let digits = self.until(b':')?;
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        let bytes = self.take(len)?;
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.peek()? {
                b'0'..=b'9' => self.byte_string()?,
                c => return Err(BencodeError::UnexpectedChar(c as char)),
            };
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}
