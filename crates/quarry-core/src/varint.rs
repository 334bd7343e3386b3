//! Variable-length unsigned integers.
//!
//! Little-endian base-128: seven payload bits per byte, the high bit set on
//! every byte except the last. Used by the compact UTXO record format, the
//! undo records and the snapshot file, where most values (heights, output
//! indices, script lengths) are small.

/// Longest possible encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the encoding of `value` to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes [`write_varint`] emits for `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Decode a varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` if the input
/// is truncated or the encoding does not fit in a `u64`.
pub fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate().take(MAX_VARINT_LEN) {
        let payload = u64::from(byte & 0x7f);
        let shift = 7 * i as u32;
        if shift == 63 && payload > 1 {
            return None;
        }
        value |= payload << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Sequential reader over a byte slice, used by the record decoders.
#[derive(Debug)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn varint(&mut self) -> Option<u64> {
        let (value, used) = read_varint(&self.data[self.pos..])?;
        self.pos += used;
        Some(value)
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Some(out)
    }

    pub fn u64_le(&mut self) -> Option<u64> {
        self.array::<8>().map(u64::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    #[test]
    fn small_values_take_one_byte() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(0x7f), vec![0x7f]);
    }

    #[test]
    fn continuation_bit_set_on_leading_bytes() {
        assert_eq!(encode(0x80), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
    }

    #[test]
    fn max_value_uses_ten_bytes() {
        let buf = encode(u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(read_varint(&buf), Some((u64::MAX, MAX_VARINT_LEN)));
    }

    #[test]
    fn varint_len_matches_encoding() {
        for value in [0, 1, 127, 128, 16_383, 16_384, 1 << 35, u64::MAX] {
            assert_eq!(varint_len(value), encode(value).len(), "value {value}");
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert_eq!(read_varint(&[]), None);
        assert_eq!(read_varint(&[0x80]), None);
        assert_eq!(read_varint(&[0xff, 0xff]), None);
    }

    #[test]
    fn overlong_input_is_rejected() {
        let mut buf = vec![0xff; 9];
        buf.push(0x02);
        assert_eq!(read_varint(&buf), None);
    }

    #[test]
    fn cursor_reads_sequentially() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 5);
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&7u64.to_le_bytes());
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.varint(), Some(5));
        assert_eq!(cur.bytes(3), Some(&b"abc"[..]));
        assert_eq!(cur.u64_le(), Some(7));
        assert!(cur.is_empty());
        assert_eq!(cur.bytes(1), None);
    }
}
