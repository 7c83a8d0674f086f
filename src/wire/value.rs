//! The self-describing octet encoding that frames every parcel.
//!
//! Four primitive kinds: integers (`i<decimal>e`), timestamps (`t<decimal>e`),
//! octet strings (`<length>:<bytes>`), lists (`l…e`) and dictionaries (`d…e`,
//! keys strictly ascending in byte-lexicographic order). The encoding is
//! canonical: for any value produced by [decode], re-encoding yields the
//! original bytes. No whitespace is permitted anywhere on the wire.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::util::clock::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("unexpected byte 0x{byte:02x} at offset {at}")]
    UnexpectedByte { byte: u8, at: usize },
    #[error("non-canonical integer")]
    NonCanonicalInteger,
    #[error("integer out of range")]
    IntegerOutOfRange,
    #[error("dictionary keys not in strictly ascending order")]
    KeysOutOfOrder,
    #[error("dictionary key is not an octet string")]
    NonOctetsKey,
    #[error("trailing bytes after the top-level value")]
    TrailingBytes,
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// A node in the parse tree. `Int`, `Time` and `Octets` are always leaves,
/// while `List` and `Dict` may contain other values.
///
/// Dictionaries are kept in a [BTreeMap] so that encoding is canonical by
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Time(Timestamp),
    Octets(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn into_int(self) -> Option<i64> {
        match self { Value::Int(v) => Some(v), _ => None }
    }

    pub fn into_time(self) -> Option<Timestamp> {
        match self { Value::Time(t) => Some(t), _ => None }
    }

    pub fn into_octets(self) -> Option<Vec<u8>> {
        match self { Value::Octets(v) => Some(v), _ => None }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self { Value::List(v) => Some(v), _ => None }
    }

    pub fn into_dict(self) -> Option<BTreeMap<Vec<u8>, Value>> {
        match self { Value::Dict(v) => Some(v), _ => None }
    }

    /// Serializes `self` into the given buffer, in canonical form.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Int(v) => {
                buf.put_u8(b'i');
                buf.put_slice(v.to_string().as_bytes());
                buf.put_u8(b'e');
            }
            Value::Time(t) => {
                buf.put_u8(b't');
                buf.put_slice(t.as_millis().to_string().as_bytes());
                buf.put_u8(b'e');
            }
            Value::Octets(v) => {
                buf.put_slice(v.len().to_string().as_bytes());
                buf.put_u8(b':');
                buf.put_slice(v);
            }
            Value::List(v) => {
                buf.put_u8(b'l');
                for child in v {
                    child.encode(buf);
                }
                buf.put_u8(b'e');
            }
            Value::Dict(v) => {
                buf.put_u8(b'd');
                for (k, child) in v {
                    buf.put_slice(k.len().to_string().as_bytes());
                    buf.put_u8(b':');
                    buf.put_slice(k);
                    child.encode(buf);
                }
                buf.put_u8(b'e');
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Value {
        Value::Time(t)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Octets(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Value {
        Value::Octets(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}

impl From<BTreeMap<Vec<u8>, Value>> for Value {
    fn from(v: BTreeMap<Vec<u8>, Value>) -> Value {
        Value::Dict(v)
    }
}

/// Decodes a complete top-level value, rejecting trailing bytes.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let mut parser = Parser::new(buf);
    let value = parser.next()?;
    if parser.empty() {
        Ok(value)
    }
    else {
        Err(DecodeError::TrailingBytes)
    }
}

/// A streaming parser over a byte slice. [decode] is the usual entry point;
/// the parser itself is exposed for callers that frame several values.
pub struct Parser<'a> {
    buf: &'a [u8],
    i: usize,
}

impl<'a> Parser<'a> {
    pub fn new(buf: &[u8]) -> Parser {
        Parser { buf, i: 0 }
    }

    pub fn empty(&self) -> bool {
        self.i >= self.buf.len()
    }

    fn peek(&self) -> Result<u8> {
        self.buf.get(self.i).copied().ok_or(DecodeError::Truncated)
    }

    fn getch(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.i += 1;
        Ok(b)
    }

    fn unexpected(&self, byte: u8) -> DecodeError {
        DecodeError::UnexpectedByte { byte, at: self.i }
    }

    /// Reads a canonical unsigned decimal up to `delim`: at least one digit,
    ///  no leading zero unless the number is exactly `0`.
    fn read_decimal(&mut self, delim: u8) -> Result<u64> {
        let mut v: u64 = 0;
        let mut digits = 0;
        let mut leading_zero = false;

        loop {
            match self.getch()? {
                d @ b'0'..=b'9' => {
                    if leading_zero {
                        return Err(DecodeError::NonCanonicalInteger);
                    }
                    if digits == 0 && d == b'0' {
                        leading_zero = true;
                    }
                    v = v
                        .checked_mul(10)
                        .and_then(|v| v.checked_add((d - b'0') as u64))
                        .ok_or(DecodeError::IntegerOutOfRange)?;
                    digits += 1;
                }
                x if x == delim => {
                    if digits == 0 {
                        return Err(DecodeError::NonCanonicalInteger);
                    }
                    return Ok(v);
                }
                x => return Err(self.unexpected(x)),
            }
        }
    }

    fn read_int(&mut self) -> Result<i64> {
        let neg = match self.peek()? {
            b'-' => {
                self.getch()?;
                true
            }
            _ => false,
        };

        let magnitude = self.read_decimal(b'e')?;
        if neg {
            if magnitude == 0 {
                // "-0" has a canonical spelling, namely "0"
                return Err(DecodeError::NonCanonicalInteger);
            }
            if magnitude > (i64::MAX as u64) + 1 {
                return Err(DecodeError::IntegerOutOfRange);
            }
            Ok((magnitude as i64).wrapping_neg())
        }
        else {
            i64::try_from(magnitude).map_err(|_| DecodeError::IntegerOutOfRange)
        }
    }

    fn read_octets(&mut self) -> Result<Vec<u8>> {
        let len = self.read_decimal(b':')? as usize;

        let start = self.i;
        let end = start.checked_add(len).ok_or(DecodeError::IntegerOutOfRange)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        self.i = end;
        Ok(self.buf[start..end].to_vec())
    }

    /// Fetches the next value in the input, or an error if there was a
    ///  problem with the data.
    pub fn next(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => {
                self.getch()?;
                Ok(Value::Int(self.read_int()?))
            }

            b't' => {
                self.getch()?;
                Ok(Value::Time(Timestamp::from_millis(self.read_decimal(b'e')?)))
            }

            b'0'..=b'9' => Ok(Value::Octets(self.read_octets()?)),

            b'l' => {
                self.getch()?;
                let mut v = Vec::new();
                loop {
                    if self.peek()? == b'e' {
                        self.getch()?;
                        return Ok(Value::List(v));
                    }
                    v.push(self.next()?);
                }
            }

            b'd' => {
                self.getch()?;
                let mut v = BTreeMap::new();
                let mut prev_key: Option<Vec<u8>> = None;
                loop {
                    match self.peek()? {
                        b'e' => {
                            self.getch()?;
                            return Ok(Value::Dict(v));
                        }
                        b'0'..=b'9' => {
                            let k = self.read_octets()?;
                            if let Some(prev) = &prev_key {
                                if *prev >= k {
                                    return Err(DecodeError::KeysOutOfOrder);
                                }
                            }
                            let child = self.next()?;
                            prev_key = Some(k.clone());
                            v.insert(k, child);
                        }
                        _ => return Err(DecodeError::NonOctetsKey),
                    }
                }
            }

            b => Err(self.unexpected(b)),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn dec(s: &str) -> Result<Value> {
        decode(s.as_bytes())
    }

    #[rstest]
    #[case("i0e", 0)]
    #[case("i6e", 6)]
    #[case("i10e", 10)]
    #[case("i37e", 37)]
    #[case("i-6e", -6)]
    #[case("i-37e", -37)]
    #[case("i9223372036854775807e", i64::MAX)]
    #[case("i-9223372036854775808e", i64::MIN)]
    fn test_integers(#[case] s: &str, #[case] expected: i64) {
        assert_eq!(dec(s), Ok(Value::Int(expected)));
    }

    #[rstest]
    #[case::garbage("i?e")]
    #[case::empty("ie")]
    #[case::bare_sign("i-e")]
    #[case::leading_zero("i03e")]
    #[case::zero_zero("i00e")]
    #[case::negative_zero("i-0e")]
    #[case::overflow("i9223372036854775808e")]
    #[case::whitespace("i 3e")]
    fn test_bad_integers(#[case] s: &str) {
        assert!(dec(s).is_err(), "{} should not decode", s);
    }

    #[test]
    fn test_times() {
        assert_eq!(dec("t0e"), Ok(Value::Time(Timestamp::from_millis(0))));
        assert_eq!(dec("t1500e"), Ok(Value::Time(Timestamp::from_millis(1_500))));
        assert!(dec("t-5e").is_err());
        assert!(dec("t05e").is_err());
    }

    #[test]
    fn test_strings() {
        assert_eq!(dec("3:123"), Ok(Value::Octets(b"123".to_vec())));
        assert_eq!(dec("0:"), Ok(Value::Octets(Vec::new())));
        assert_eq!(dec("3:12"), Err(DecodeError::Truncated));
        assert_eq!(dec("3:123junk"), Err(DecodeError::TrailingBytes));
        assert!(dec("03:123").is_err());
    }

    #[test]
    fn test_simple_list() {
        assert_eq!(
            dec("li3e3:123i-10ee"),
            Ok(Value::List(vec![
                Value::Int(3),
                Value::Octets(b"123".to_vec()),
                Value::Int(-10),
            ]))
        );

        assert_eq!(dec("li3e"), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_nested_list() {
        assert_eq!(
            dec("li3elli4eei5ei6eei7ee"),
            Ok(Value::List(vec![
                Value::Int(3),
                Value::List(vec![
                    Value::List(vec![Value::Int(4)]),
                    Value::Int(5),
                    Value::Int(6),
                ]),
                Value::Int(7),
            ]))
        );
    }

    #[test]
    fn test_parser_leaves_position_after_value() {
        let mut p = Parser::new(b"lei0e");
        assert_eq!(p.next(), Ok(Value::List(Vec::new())));
        assert_eq!(p.next(), Ok(Value::Int(0)));
        assert!(p.empty());
    }

    #[test]
    fn test_simple_dict() {
        let mut d = BTreeMap::new();
        d.insert(b"abc".to_vec(), Value::Int(3));
        d.insert(b"def".to_vec(), Value::Octets(b"123".to_vec()));

        assert_eq!(dec("d3:abci3e3:def3:123e"), Ok(Value::Dict(d)));

        assert_eq!(dec("de"), Ok(Value::Dict(BTreeMap::new())));
        assert!(dec("d3:abce").is_err()); // missing value
        assert!(dec("d3:abci0e").is_err()); // end of input
        assert_eq!(dec("di0ei0ee"), Err(DecodeError::NonOctetsKey));
    }

    #[rstest]
    #[case::swapped("d3:defi0e3:abci0ee")]
    #[case::duplicate("d3:abci0e3:abci1ee")]
    #[case::prefix_after("d3:abci0e2:abi0ee")]
    fn test_dict_key_order(#[case] s: &str) {
        assert_eq!(dec(s), Err(DecodeError::KeysOutOfOrder));
    }

    #[rstest]
    #[case("i6e")]
    #[case("i-37e")]
    #[case("t5010e")]
    #[case("3:abc")]
    #[case("0:")]
    #[case("le")]
    #[case("li6e3:abce")]
    #[case("li6el3:abcee")]
    #[case("de")]
    #[case("d3:abc3:defe")]
    #[case("d3:abcd3:defi6eee")]
    #[case("d1:ai1e1:bt7e1:cle")]
    fn test_roundtrip(#[case] s: &str) {
        // decode(encode(v)) = v and encode(decode(b)) = b
        let v = dec(s).unwrap();
        assert_eq!(v.to_bytes(), s.as_bytes());
        assert_eq!(decode(&v.to_bytes()), Ok(v));
    }

    #[test]
    fn test_encode_sorts_dict_keys() {
        let mut d = BTreeMap::new();
        d.insert(b"zz".to_vec(), Value::Int(1));
        d.insert(b"aa".to_vec(), Value::Int(2));
        assert_eq!(Value::Dict(d).to_bytes(), b"d2:aai2e2:zzi1ee".to_vec());
    }
}
