//! Unsigned LEB128 varints as used by multiformats length prefixes

use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest varint multiformats allows (63 bits of payload)
pub const MAX_VARINT_LEN: usize = 9;

/// Outcome of reading a varint from a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintRead {
    /// Stream ended before the first byte
    Eof,
    /// Stream ended after `read` bytes, inside the varint
    Truncated {
        /// Bytes consumed before the stream ended
        read: usize,
    },
    /// More than [`MAX_VARINT_LEN`] bytes without a terminating byte
    Overflow,
    /// A complete value
    Value(u64),
}

/// Decode a varint from the front of `data`, returning the value and bytes consumed
pub fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, b) in data.iter().copied().enumerate() {
        if i >= MAX_VARINT_LEN {
            return None;
        }
        if b < 0x80 {
            return Some((x | ((b as u64) << s), i + 1));
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
    }
    None
}

/// Append the varint encoding of `x` to `out`
pub fn encode_uvarint(mut x: u64, out: &mut Vec<u8>) {
    while x >= 0x80 {
        out.push(((x as u8) & 0x7F) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
}

/// Read one varint from `reader` a byte at a time
///
/// Distinguishes a clean end of stream before the first byte from one in the
/// middle of the value, which callers treat as corruption.
pub async fn read_uvarint<R>(reader: &mut R) -> std::io::Result<VarintRead>
where
    R: AsyncRead + Unpin,
{
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    let mut buf = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        if reader.read(&mut buf).await? == 0 {
            return Ok(if i == 0 {
                VarintRead::Eof
            } else {
                VarintRead::Truncated { read: i }
            });
        }
        let b = buf[0];
        if b < 0x80 {
            return Ok(VarintRead::Value(x | ((b as u64) << s)));
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
    }
    Ok(VarintRead::Overflow)
}
