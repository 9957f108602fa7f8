//! Bencode decoding.
//!
//! Bencode has four data types: integers (`i42e`), length-prefixed byte
//! strings (`4:spam`), lists (`l...e`) and dictionaries (`d...e`). The
//! peer-wire extension handshake is a bencoded dictionary; this module
//! decodes it and renders values single-line for transcript output.
//!
//! The decoder is a byte cursor in the same family as the header readers
//! in `net`: it walks the input once, never recurses past a fixed depth,
//! and leaves the cursor on the first byte it could not consume.
//!
//! Reference: BEP-3 (bencoding).

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Containers nested deeper than this are rejected rather than recursed
/// into; real extension handshakes are two levels deep.
const NESTING_LIMIT: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// The input ran out mid-value.
    #[error("truncated value")]
    Truncated,

    /// An integer token is empty, has leading zeros, is `-0`, or does not
    /// fit in 64 bits.
    #[error("bad integer")]
    BadInteger,

    /// A byte-string length prefix is missing or does not fit in memory.
    #[error("bad string length")]
    BadLength,

    /// A byte that starts no bencode token.
    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    /// A dictionary key that is not a byte string.
    #[error("dictionary key is not a string")]
    NonStringKey,

    /// Bytes left over after the value ended.
    #[error("trailing bytes after value")]
    Trailing,

    /// Containers nested beyond [`NESTING_LIMIT`].
    #[error("nested too deeply")]
    TooDeep,
}

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    /// A byte string; not necessarily valid UTF-8.
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` when not a dict or the key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Dictionary lookup that only yields nested dictionaries.
    pub fn get_dict(&self, key: &[u8]) -> Option<&Value> {
        let v = self.get(key)?;
        v.as_dict().map(|_| v)
    }
}

// Single-line rendering for transcripts: strings quoted with non-printable
// bytes dotted, containers braced.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Bytes(b) => {
                write!(f, "'")?;
                for &c in b.iter() {
                    let c = if (b' '..0x7f).contains(&c) { c as char } else { '.' };
                    write!(f, "{}", c)?;
                }
                write!(f, "'")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (key, val)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", Value::Bytes(key.clone()), val)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Decodes a single bencode value; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Decoder::new(data);
    let value = cursor.value(0)?;
    if !cursor.done() {
        return Err(BencodeError::Trailing);
    }
    Ok(value)
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos == self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    /// Consume `want` or fail without moving the cursor.
    fn expect(&mut self, want: u8) -> Result<(), BencodeError> {
        match self.peek() {
            Some(b) if b == want => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(BencodeError::UnexpectedByte(b)),
            None => Err(BencodeError::Truncated),
        }
    }

    /// Consume exactly `n` raw bytes.
    fn take(&mut self, n: usize) -> Result<&'a [u8], BencodeError> {
        let input: &'a [u8] = self.input;
        let rest = &input[self.pos..];
        if n > rest.len() {
            return Err(BencodeError::Truncated);
        }
        self.pos += n;
        Ok(&rest[..n])
    }

    /// Consume a non-empty run of ASCII digits as an unsigned number.
    fn digits(&mut self) -> Result<u64, BencodeError> {
        let mut n: u64 = 0;
        let mut any = false;
        while let Some(d) = self.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add(u64::from(d - b'0')))
                .ok_or(BencodeError::BadInteger)?;
            self.pos += 1;
            any = true;
        }
        if !any {
            return Err(BencodeError::BadInteger);
        }
        Ok(n)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > NESTING_LIMIT {
            return Err(BencodeError::TooDeep);
        }
        match self.peek() {
            None => Err(BencodeError::Truncated),
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(d) if d.is_ascii_digit() => Ok(Value::Bytes(self.byte_string()?)),
            Some(b) => Err(BencodeError::UnexpectedByte(b)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // 'i'
        let negative = self.peek() == Some(b'-');
        if negative {
            self.pos += 1;
        }
        let first = self.pos;
        let magnitude = self.digits()?;
        // "042" and "-0" are not canonical bencode.
        if self.input[first] == b'0' && (self.pos - first > 1 || negative) {
            return Err(BencodeError::BadInteger);
        }
        self.expect(b'e')
            .map_err(|_| BencodeError::BadInteger)?;

        let value = if negative {
            0i64.checked_sub_unsigned(magnitude)
                .ok_or(BencodeError::BadInteger)?
        } else {
            i64::try_from(magnitude).map_err(|_| BencodeError::BadInteger)?
        };
        Ok(Value::Integer(value))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let len = self.digits().map_err(|_| BencodeError::BadLength)?;
        let len = usize::try_from(len).map_err(|_| BencodeError::BadLength)?;
        self.expect(b':').map_err(|_| BencodeError::BadLength)?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(BencodeError::Truncated),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.value(depth + 1)?),
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1; // 'd'
        let mut entries = BTreeMap::new();
        loop {
            match self.peek() {
                None => return Err(BencodeError::Truncated),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::Dict(entries));
                }
                Some(d) if d.is_ascii_digit() => {
                    let key = self.byte_string()?;
                    let val = self.value(depth + 1)?;
                    entries.insert(key, val);
                }
                Some(_) => return Err(BencodeError::NonStringKey),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(
            decode(b"5:hello").unwrap(),
            Value::Bytes(Bytes::from_static(b"hello"))
        );
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    }

    #[test]
    fn decodes_64_bit_extremes() {
        assert_eq!(
            decode(b"i9223372036854775807e").unwrap(),
            Value::Integer(i64::MAX)
        );
        assert_eq!(
            decode(b"i-9223372036854775808e").unwrap(),
            Value::Integer(i64::MIN)
        );
        assert_eq!(decode(b"i9223372036854775808e"), Err(BencodeError::BadInteger));
    }

    #[test]
    fn decodes_containers() {
        let list = decode(b"li1ei2ei3ee").unwrap();
        assert_eq!(
            list,
            Value::List(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])
        );

        let dict = decode(b"d4:name5:Alice3:agei30ee").unwrap();
        assert_eq!(dict.get(b"age").and_then(Value::as_integer), Some(30));
        assert_eq!(
            dict.get(b"name"),
            Some(&Value::Bytes(Bytes::from_static(b"Alice")))
        );
    }

    #[test]
    fn extension_handshake_shape() {
        let v = decode(b"d1:md11:ut_metadatai3e6:ut_pexi1eee").unwrap();
        let m = v.get_dict(b"m").unwrap();
        assert_eq!(m.get(b"ut_metadata").and_then(Value::as_integer), Some(3));
        assert_eq!(m.get(b"ut_pex").and_then(Value::as_integer), Some(1));
        assert!(v.get_dict(b"v").is_none());
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(decode(b""), Err(BencodeError::Truncated));
        assert_eq!(decode(b"i42"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"ie"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"i007e"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"i-0e"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"9:abc"), Err(BencodeError::Truncated));
        assert_eq!(decode(b"l"), Err(BencodeError::Truncated));
        assert_eq!(decode(b"x"), Err(BencodeError::UnexpectedByte(b'x')));
        assert_eq!(decode(b"i42eextra"), Err(BencodeError::Trailing));
        assert_eq!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey));
    }

    #[test]
    fn depth_limit_holds() {
        let mut deep = Vec::new();
        deep.extend(std::iter::repeat(b'l').take(80));
        deep.extend(std::iter::repeat(b'e').take(80));
        assert_eq!(decode(&deep), Err(BencodeError::TooDeep));
    }

    #[test]
    fn renders_single_line() {
        let v = decode(b"d1:md11:ut_metadatai3ee1:v4:Teste").unwrap();
        assert_eq!(v.to_string(), "{'m': {'ut_metadata': 3}, 'v': 'Test'}");

        let v = decode(b"d1:k2:\x01\xffe").unwrap();
        assert_eq!(v.to_string(), "{'k': '..'}");

        let v = decode(b"li1e1:ae").unwrap();
        assert_eq!(v.to_string(), "[1, 'a']");
    }
}
