//! RLP - Recursive Length Prefix encoding into caller-supplied buffers.
//!
//! Encoders write into pool blocks and return the number of bytes written.
//! Nothing is written when the output is too small. The decoder returns a
//! view into its input without copying.

use crate::error::RlpError;

const STRING_OFFSET: u8 = 0x80;
const LONG_STRING_OFFSET: u8 = 0xb7;
const LIST_OFFSET: u8 = 0xc0;
const LONG_LIST_OFFSET: u8 = 0xf7;

/// Payloads shorter than this use a one-byte prefix
const SHORT_LIMIT: usize = 56;

/// A decoded string borrowed from the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub data: &'a [u8],
    /// Bytes of input taken by the prefix and payload
    pub consumed: usize,
}

/// Bytes needed to write `len` as a big-endian integer.
#[inline]
fn be_len(len: usize) -> usize {
    (usize::BITS as usize - len.leading_zeros() as usize + 7) / 8
}

#[inline]
fn header_len(payload_len: usize) -> usize {
    if payload_len < SHORT_LIMIT {
        1
    } else {
        1 + be_len(payload_len)
    }
}

/// Total encoded size of a byte string of `data_len` bytes.
///
/// A single byte below 0x80 encodes as itself; this returns the prefixed
/// size (2) for a one-byte string since the value is unknown.
#[inline]
pub fn encoded_len(data_len: usize) -> usize {
    header_len(data_len) + data_len
}

fn check_room(needed: usize, out: &[u8]) -> Result<(), RlpError> {
    if out.len() < needed {
        return Err(RlpError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }
    Ok(())
}

/// Write a prefix + payload. `out` must already be checked for room.
fn write_with_header(short_offset: u8, long_offset: u8, payload: &[u8], out: &mut [u8]) -> usize {
    let len = payload.len();
    let header = if len < SHORT_LIMIT {
        out[0] = short_offset + len as u8;
        1
    } else {
        let n = be_len(len);
        out[0] = long_offset + n as u8;
        out[1..=n].copy_from_slice(&len.to_be_bytes()[std::mem::size_of::<usize>() - n..]);
        1 + n
    };
    out[header..header + len].copy_from_slice(payload);
    header + len
}

/// Encode a byte string.
pub fn encode_string(input: &[u8], out: &mut [u8]) -> Result<usize, RlpError> {
    if let [byte] = input {
        if *byte < STRING_OFFSET {
            check_room(1, out)?;
            out[0] = *byte;
            return Ok(1);
        }
    }
    check_room(encoded_len(input.len()), out)?;
    Ok(write_with_header(STRING_OFFSET, LONG_STRING_OFFSET, input, out))
}

/// Wrap an already-encoded payload as a list.
pub fn encode_list(payload: &[u8], out: &mut [u8]) -> Result<usize, RlpError> {
    check_room(header_len(payload.len()) + payload.len(), out)?;
    Ok(write_with_header(LIST_OFFSET, LONG_LIST_OFFSET, payload, out))
}

/// Encode a 32-byte big-endian integer with leading zeros stripped.
///
/// Zero encodes as the empty string `0x80`.
pub fn encode_uint256(value: &[u8; 32], out: &mut [u8]) -> Result<usize, RlpError> {
    let start = value.iter().position(|&b| b != 0).unwrap_or(32);
    encode_string(&value[start..], out)
}

/// Encode a 20-byte address (`0x94` followed by the address).
pub fn encode_address(address: &[u8; 20], out: &mut [u8]) -> Result<usize, RlpError> {
    check_room(21, out)?;
    out[0] = STRING_OFFSET + 20;
    out[1..21].copy_from_slice(address);
    Ok(21)
}

/// Decode one string item from the front of `input`.
pub fn decode_string(input: &[u8]) -> Result<Decoded<'_>, RlpError> {
    let &prefix = input.first().ok_or(RlpError::Empty)?;

    let (header, len) = match prefix {
        0x00..=0x7f => {
            return Ok(Decoded {
                data: &input[..1],
                consumed: 1,
            })
        }
        0x80..=0xb7 => (1, (prefix - STRING_OFFSET) as usize),
        0xb8..=0xbf => {
            let n = (prefix - LONG_STRING_OFFSET) as usize;
            if n > std::mem::size_of::<usize>() {
                return Err(RlpError::LengthOverflow(n));
            }
            let bytes = input.get(1..1 + n).ok_or(RlpError::Truncated {
                needed: 1 + n,
                available: input.len(),
            })?;
            let len = bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
            (1 + n, len)
        }
        _ => return Err(RlpError::UnexpectedList(prefix)),
    };

    let end = header
        .checked_add(len)
        .ok_or(RlpError::LengthOverflow(len))?;
    let data = input.get(header..end).ok_or(RlpError::Truncated {
        needed: end,
        available: input.len(),
    })?;
    Ok(Decoded {
        data,
        consumed: end,
    })
}

/// Re-expand a decoded integer to 32 big-endian bytes.
///
/// Returns `None` if `data` is longer than 32 bytes.
pub fn to_uint256(data: &[u8]) -> Option<[u8; 32]> {
    if data.len() > 32 {
        return None;
    }
    let mut value = [0u8; 32];
    value[32 - data.len()..].copy_from_slice(data);
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte() {
        let mut out = [0u8; 4];
        assert_eq!(encode_string(&[0x42], &mut out), Ok(1));
        assert_eq!(out[0], 0x42);

        assert_eq!(encode_string(&[0x80], &mut out), Ok(2));
        assert_eq!(&out[..2], &[0x81, 0x80]);
    }

    #[test]
    fn test_short_string() {
        let mut out = [0u8; 8];
        assert_eq!(encode_string(b"dog", &mut out), Ok(4));
        assert_eq!(&out[..4], &[0x83, b'd', b'o', b'g']);

        let decoded = decode_string(&out[..4]).unwrap();
        assert_eq!(decoded.data, b"dog");
        assert_eq!(decoded.consumed, 4);
    }

    #[test]
    fn test_empty_string() {
        let mut out = [0u8; 1];
        assert_eq!(encode_string(&[], &mut out), Ok(1));
        assert_eq!(out[0], 0x80);
    }

    #[test]
    fn test_long_string() {
        let input = [0xabu8; 60];
        let mut out = [0u8; 64];
        assert_eq!(encode_string(&input, &mut out), Ok(62));
        assert_eq!(&out[..2], &[0xb8, 60]);

        let decoded = decode_string(&out).unwrap();
        assert_eq!(decoded.data, &input[..]);
        assert_eq!(decoded.consumed, 62);
    }

    #[test]
    fn test_list() {
        let mut out = [0u8; 16];
        // ["cat", "dog"]
        let payload = [0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g'];
        assert_eq!(encode_list(&payload, &mut out), Ok(9));
        assert_eq!(out[0], 0xc8);
        assert_eq!(decode_string(&out), Err(RlpError::UnexpectedList(0xc8)));
    }

    #[test]
    fn test_uint256_zero_and_one() {
        let mut out = [0u8; 33];

        let zero = [0u8; 32];
        assert_eq!(encode_uint256(&zero, &mut out), Ok(1));
        assert_eq!(out[0], 0x80);
        let decoded = decode_string(&out[..1]).unwrap();
        assert!(decoded.data.is_empty());
        assert_eq!(to_uint256(decoded.data), Some(zero));

        let mut one = [0u8; 32];
        one[31] = 1;
        assert_eq!(encode_uint256(&one, &mut out), Ok(1));
        assert_eq!(out[0], 0x01);
        let decoded = decode_string(&out[..1]).unwrap();
        assert_eq!(decoded.data, &[1]);
        assert_eq!(to_uint256(decoded.data), Some(one));
    }

    #[test]
    fn test_uint256_full_width() {
        let value = [0xffu8; 32];
        let mut out = [0u8; 33];
        assert_eq!(encode_uint256(&value, &mut out), Ok(33));
        assert_eq!(out[0], 0xa0);
    }

    #[test]
    fn test_address() {
        let addr = [0x11u8; 20];
        let mut out = [0u8; 21];
        assert_eq!(encode_address(&addr, &mut out), Ok(21));
        assert_eq!(out[0], 0x94);
        assert_eq!(decode_string(&out).unwrap().data, &addr);
    }

    #[test]
    fn test_buffer_too_small_writes_nothing() {
        let mut out = [0xeeu8; 3];
        assert_eq!(
            encode_string(b"dog", &mut out),
            Err(RlpError::BufferTooSmall { needed: 4, available: 3 })
        );
        assert_eq!(out, [0xee; 3]);
        assert!(encode_address(&[0u8; 20], &mut out).is_err());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode_string(&[]), Err(RlpError::Empty));
        assert_eq!(
            decode_string(&[0x83, b'd']),
            Err(RlpError::Truncated { needed: 4, available: 2 })
        );
        assert_eq!(
            decode_string(&[0xb9, 0x01]),
            Err(RlpError::Truncated { needed: 3, available: 2 })
        );
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(3), 4);
        assert_eq!(encoded_len(55), 56);
        assert_eq!(encoded_len(56), 58);
        assert_eq!(encoded_len(1024), 1027);
    }
}
