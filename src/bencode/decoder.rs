//! A recursive-descent bencode decoder operating directly on byte slices.
//!
//! Unlike a `serde`-based decoder that reconstructs a typed value and then
//! re-encodes it canonically, this one is position-tracking: every parse
//! step knows exactly which byte range of the input it consumed. That lets
//! [`span_of_dict_value`] hand back the *original* byte range of a nested
//! value (e.g. the torrent metainfo's `info` dict) without going through a
//! re-encode step, which is what makes `info_hash` computation correct even
//! for torrents produced by non-canonical bencode writers.

use std::collections::BTreeMap;
use std::ops::Range;

use super::Value;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("expected one of 'i', 'l', 'd', or a digit at byte {0}")]
    UnexpectedByte(usize),
    #[error("integer is not valid ASCII decimal at byte {0}")]
    InvalidInteger(usize),
    #[error("byte string length is not valid ASCII decimal at byte {0}")]
    InvalidStringLength(usize),
    #[error("dictionary key at byte {0} is not a byte string")]
    NonStringKey(usize),
    #[error("trailing data after top-level value, starting at byte {0}")]
    TrailingData(usize),
}

/// Decodes exactly one top-level bencode value, failing if any bytes of
/// `data` remain unconsumed afterwards.
pub fn decode(data: &[u8]) -> Result<Value, DecodeError> {
    let (value, pos) = parse_value(data, 0)?;
    if pos != data.len() {
        return Err(DecodeError::TrailingData(pos));
    }
    Ok(value)
}

/// Decodes exactly one top-level bencode value and also returns the byte
/// range of the input it consumed (always `0..data.len()` when the whole
/// input was a single value, but kept general for composability).
pub fn decode_with_span(
    data: &[u8],
) -> Result<(Value, Range<usize>), DecodeError> {
    let (value, pos) = parse_value(data, 0)?;
    Ok((value, 0..pos))
}

/// Scans a top-level bencode dictionary for `key` and returns the raw byte
/// range of its value within `data`, without decoding the value itself.
///
/// This is the primitive the metainfo parser uses to SHA-1 the `info`
/// sub-dictionary verbatim, rather than a canonical re-encoding of it.
pub fn span_of_dict_value(
    data: &[u8],
    key: &[u8],
) -> Result<Option<Range<usize>>, DecodeError> {
    let mut pos = expect_byte(data, 0, b'd')?;
    loop {
        if peek(data, pos)? == b'e' {
            return Ok(None);
        }
        let (k, key_end) = parse_value(data, pos)?;
        let k = match k {
            Value::Bytes(b) => b,
            _ => return Err(DecodeError::NonStringKey(pos)),
        };
        let value_start = key_end;
        let (_, value_end) = parse_value(data, value_start)?;
        if k == key {
            return Ok(Some(value_start..value_end));
        }
        pos = value_end;
    }
}

fn peek(data: &[u8], pos: usize) -> Result<u8, DecodeError> {
    data.get(pos).copied().ok_or(DecodeError::UnexpectedEof)
}

fn expect_byte(
    data: &[u8],
    pos: usize,
    expected: u8,
) -> Result<usize, DecodeError> {
    if peek(data, pos)? != expected {
        return Err(DecodeError::UnexpectedByte(pos));
    }
    Ok(pos + 1)
}

fn parse_value(
    data: &[u8],
    pos: usize,
) -> Result<(Value, usize), DecodeError> {
    match peek(data, pos)? {
        b'i' => parse_int(data, pos),
        b'l' => parse_list(data, pos),
        b'd' => parse_dict(data, pos),
        b'0'..=b'9' => parse_bytes(data, pos),
        _ => Err(DecodeError::UnexpectedByte(pos)),
    }
}

fn parse_int(data: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let start = pos + 1;
    let end = find(data, start, b'e')?;
    let text = std::str::from_utf8(&data[start..end])
        .map_err(|_| DecodeError::InvalidInteger(start))?;
    let n: i64 = text
        .parse()
        .map_err(|_| DecodeError::InvalidInteger(start))?;
    Ok((Value::Int(n), end + 1))
}

fn parse_bytes(
    data: &[u8],
    pos: usize,
) -> Result<(Value, usize), DecodeError> {
    let colon = find(data, pos, b':')?;
    let len_text = std::str::from_utf8(&data[pos..colon])
        .map_err(|_| DecodeError::InvalidStringLength(pos))?;
    let len: usize = len_text
        .parse()
        .map_err(|_| DecodeError::InvalidStringLength(pos))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(DecodeError::InvalidStringLength(pos))?;
    if end > data.len() {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok((Value::Bytes(data[start..end].to_vec()), end))
}

fn parse_list(data: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let mut pos = pos + 1;
    let mut items = Vec::new();
    loop {
        if peek(data, pos)? == b'e' {
            return Ok((Value::List(items), pos + 1));
        }
        let (value, next) = parse_value(data, pos)?;
        items.push(value);
        pos = next;
    }
}

fn parse_dict(data: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let mut pos = pos + 1;
    let mut map = BTreeMap::new();
    loop {
        if peek(data, pos)? == b'e' {
            return Ok((Value::Dict(map), pos + 1));
        }
        let (key, key_end) = parse_value(data, pos)?;
        let key = match key {
            Value::Bytes(b) => b,
            _ => return Err(DecodeError::NonStringKey(pos)),
        };
        let (value, value_end) = parse_value(data, key_end)?;
        map.insert(key, value);
        pos = value_end;
    }
}

fn find(data: &[u8], start: usize, needle: u8) -> Result<usize, DecodeError> {
    data[start..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| start + i)
        .ok_or(DecodeError::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            Value::Bytes(b"spam".to_vec())
        );
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Int(42)
            ])
        );
        assert_eq!(decode(b"le").unwrap(), Value::List(Vec::new()));
    }

    #[test]
    fn test_parse_dict() {
        let d = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let mut expected = BTreeMap::new();
        expected.insert(b"cow".to_vec(), Value::Bytes(b"moo".to_vec()));
        expected.insert(b"spam".to_vec(), Value::Bytes(b"eggs".to_vec()));
        assert_eq!(d, Value::Dict(expected));
    }

    #[test]
    fn test_trailing_data_is_rejected() {
        assert_eq!(decode(b"i1ei2e"), Err(DecodeError::TrailingData(4)));
    }

    #[test]
    fn test_unterminated_list_is_rejected() {
        assert_eq!(decode(b"l1:a"), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_dict_key_must_be_bytes() {
        assert_eq!(decode(b"di1ei2ee"), Err(DecodeError::NonStringKey(1)));
    }

    #[test]
    fn test_span_of_dict_value() {
        let data = b"d4:infod6:lengthi10eee";
        let span = span_of_dict_value(data, b"info").unwrap().unwrap();
        assert_eq!(&data[span], &b"d6:lengthi10ee"[..]);
    }

    #[test]
    fn test_span_of_missing_key() {
        let data = b"d3:foo3:bare";
        assert_eq!(span_of_dict_value(data, b"info").unwrap(), None);
    }

    // S2: compact peers: 4 bytes IPv4 + 2 bytes port, repeated.
    #[test]
    fn test_compact_peers_bytes_roundtrip_through_bencode_string() {
        let peers: &[u8] =
            b"\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x00\x02\x1a\xe9";
        let encoded = format!("{}:", peers.len());
        let mut bytes = encoded.into_bytes();
        bytes.extend_from_slice(peers);
        assert_eq!(decode(&bytes).unwrap(), Value::Bytes(peers.to_vec()));
    }
}
