use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io;

use crate::value::{TAG_DOUBLE, TAG_INT, TAG_LONG, TAG_NULL, TAG_STRING};
use crate::{IntervalError, Value, MAX_STRING_LEN};

/// Timestamps are signed 64-bit values, as found in traces.
pub type Timestamp = i64;

/// Size of one data entry: 2 x i64 (start, end) + u32 (attribute) + u8 (type
/// tag) + i32 (inline value or extra offset).
pub const DATA_ENTRY_SIZE: usize = 8 + 8 + 4 + 1 + 4;

/// An immutable `(start, end, attribute, value)` record.
///
/// Nodes keep their intervals sorted by [`end`](Interval::end) only; two
/// intervals with the same end time compare equal for that purpose even when
/// everything else differs.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    start: Timestamp,
    end: Timestamp,
    attribute: u32,
    value: Value,
}

impl Interval {
    /// Builds an interval, checking `start <= end` and that string payloads
    /// fit an extra entry.
    pub fn new(
        start: Timestamp,
        end: Timestamp,
        attribute: u32,
        value: Value,
    ) -> Result<Self, IntervalError> {
        if start > end {
            return Err(IntervalError::InvalidRange { start, end });
        }
        if let Value::String(s) = &value {
            if s.len() > MAX_STRING_LEN {
                return Err(IntervalError::StringTooLong(s.len()));
            }
        }
        Ok(Self {
            start,
            end,
            attribute,
            value,
        })
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn attribute(&self) -> u32 {
        self.attribute
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Returns `true` if `t` lies within `[start, end]`.
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// Bytes this interval takes in the extra area.
    pub fn extra_size(&self) -> usize {
        self.value.extra_size()
    }

    /// Exact number of bytes this interval occupies in a node block.
    pub fn serialized_size(&self) -> usize {
        DATA_ENTRY_SIZE + self.extra_size()
    }

    /// Writes the data entry at `entry_pos` and its extra entry (if any) so
    /// that it ends at `extra_end`.
    ///
    /// Returns the number of extra bytes written; the caller moves its
    /// extra-area cursor back by that amount. The caller guarantees the data
    /// entry and the extra entry do not overlap.
    pub fn write_to(
        &self,
        block: &mut [u8],
        entry_pos: usize,
        extra_end: usize,
    ) -> Result<usize, IntervalError> {
        let extra_size = self.extra_size();
        let extra_pos = extra_end - extra_size;
        debug_assert!(entry_pos + DATA_ENTRY_SIZE <= extra_pos);

        let inline = match &self.value {
            Value::Null => 0,
            Value::Int(v) => *v,
            Value::Long(_) | Value::Double(_) | Value::String(_) => extra_pos as i32,
        };

        let mut entry: &mut [u8] = &mut block[entry_pos..entry_pos + DATA_ENTRY_SIZE];
        entry.write_i64::<LittleEndian>(self.start)?;
        entry.write_i64::<LittleEndian>(self.end)?;
        entry.write_u32::<LittleEndian>(self.attribute)?;
        entry.write_u8(self.value.type_tag())?;
        entry.write_i32::<LittleEndian>(inline)?;

        let extra = &mut block[extra_pos..extra_end];
        match &self.value {
            Value::Null | Value::Int(_) => {}
            Value::Long(v) => LittleEndian::write_i64(extra, *v),
            Value::Double(v) => LittleEndian::write_f64(extra, *v),
            Value::String(s) => {
                let bytes = s.as_bytes();
                extra[0] = bytes.len() as u8;
                extra[1..=bytes.len()].copy_from_slice(bytes);
                extra[bytes.len() + 1] = 0;
            }
        }

        Ok(extra_size)
    }

    /// Reads the interval whose data entry starts at `entry_pos`.
    ///
    /// Fails with [`IntervalError::UnknownTypeTag`] on a tag outside the known
    /// set, and with [`IntervalError::CorruptExtra`] if the extra entry points
    /// outside the block or is malformed.
    pub fn read_from(block: &[u8], entry_pos: usize) -> Result<Self, IntervalError> {
        let mut entry = block
            .get(entry_pos..entry_pos + DATA_ENTRY_SIZE)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "data entry past end of block")
            })?;

        let start = entry.read_i64::<LittleEndian>()?;
        let end = entry.read_i64::<LittleEndian>()?;
        let attribute = entry.read_u32::<LittleEndian>()?;
        let tag = entry.read_u8()?;
        let inline = entry.read_i32::<LittleEndian>()?;

        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_INT => Value::Int(inline),
            TAG_LONG => Value::Long(LittleEndian::read_i64(extra_slice(block, inline, 8)?)),
            TAG_DOUBLE => Value::Double(LittleEndian::read_f64(extra_slice(block, inline, 8)?)),
            TAG_STRING => Value::String(read_string(block, inline)?),
            other => return Err(IntervalError::UnknownTypeTag(other)),
        };

        Interval::new(start, end, attribute, value)
    }
}

fn extra_slice(block: &[u8], offset: i32, len: usize) -> Result<&[u8], IntervalError> {
    let pos = usize::try_from(offset).map_err(|_| IntervalError::CorruptExtra(offset))?;
    block
        .get(pos..pos + len)
        .ok_or(IntervalError::CorruptExtra(offset))
}

fn read_string(block: &[u8], offset: i32) -> Result<String, IntervalError> {
    let size = extra_slice(block, offset, 1)?[0] as usize;
    // size byte + payload + terminator
    let raw = extra_slice(block, offset, size + 2)?;
    if raw[size + 1] != 0 {
        return Err(IntervalError::CorruptExtra(offset));
    }
    String::from_utf8(raw[1..=size].to_vec()).map_err(|_| IntervalError::CorruptExtra(offset))
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}], attribute = {}, value = {}",
            self.start, self.end, self.attribute, self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 256;

    fn iv(start: i64, end: i64, attribute: u32, value: Value) -> Interval {
        Interval::new(start, end, attribute, value).unwrap()
    }

    // -------------------- Construction --------------------

    #[test]
    fn rejects_inverted_range() {
        let err = Interval::new(10, 9, 0, Value::Null).unwrap_err();
        assert!(matches!(err, IntervalError::InvalidRange { start: 10, end: 9 }));
    }

    #[test]
    fn accepts_single_point_range() {
        let i = iv(7, 7, 3, Value::Int(1));
        assert!(i.contains(7));
        assert!(!i.contains(6));
        assert!(!i.contains(8));
    }

    #[test]
    fn rejects_oversized_string() {
        let long = "x".repeat(MAX_STRING_LEN + 1);
        let err = Interval::new(0, 1, 0, Value::String(long)).unwrap_err();
        assert!(matches!(err, IntervalError::StringTooLong(256)));
    }

    #[test]
    fn serialized_size_counts_extra_area() {
        assert_eq!(iv(0, 1, 0, Value::Null).serialized_size(), 25);
        assert_eq!(iv(0, 1, 0, Value::Int(4)).serialized_size(), 25);
        assert_eq!(iv(0, 1, 0, Value::Long(4)).serialized_size(), 33);
        assert_eq!(iv(0, 1, 0, Value::Double(4.0)).serialized_size(), 33);
        assert_eq!(iv(0, 1, 0, Value::from("hello")).serialized_size(), 32);
    }

    // -------------------- Block encoding --------------------

    #[test]
    fn mixed_block_reads_back() -> Result<(), IntervalError> {
        let intervals = vec![
            iv(0, 10, 1, Value::Null),
            iv(2, 12, 2, Value::Int(-42)),
            iv(3, 13, 3, Value::Long(i64::MIN + 1)),
            iv(4, 14, 4, Value::Double(2.5)),
            iv(5, 15, 5, Value::from("running")),
        ];

        let mut block = vec![0u8; BLOCK];
        let mut extra_end = BLOCK;
        for (i, interval) in intervals.iter().enumerate() {
            extra_end -= interval.write_to(&mut block, i * DATA_ENTRY_SIZE, extra_end)?;
        }
        assert_eq!(BLOCK - extra_end, 8 + 8 + 9);

        for (i, expected) in intervals.iter().enumerate() {
            let read = Interval::read_from(&block, i * DATA_ENTRY_SIZE)?;
            assert_eq!(&read, expected);
        }
        Ok(())
    }

    #[test]
    fn string_extra_layout() -> Result<(), IntervalError> {
        let mut block = vec![0u8; 64];
        let written = iv(0, 1, 9, Value::from("ab")).write_to(&mut block, 0, 64)?;
        assert_eq!(written, 4);
        assert_eq!(&block[60..64], &[2, b'a', b'b', 0]);
        // inline part holds the extra offset
        assert_eq!(LittleEndian::read_i32(&block[21..25]), 60);
        Ok(())
    }

    #[test]
    fn unknown_tag_is_rejected() -> Result<(), IntervalError> {
        let mut block = vec![0u8; 64];
        iv(0, 1, 0, Value::Int(1)).write_to(&mut block, 0, 64)?;
        block[20] = 0x7E;
        let err = Interval::read_from(&block, 0).unwrap_err();
        assert!(matches!(err, IntervalError::UnknownTypeTag(0x7E)));
        Ok(())
    }

    #[test]
    fn missing_string_terminator_is_rejected() -> Result<(), IntervalError> {
        let mut block = vec![0u8; 64];
        iv(0, 1, 0, Value::from("abc")).write_to(&mut block, 0, 64)?;
        block[63] = b'!';
        let err = Interval::read_from(&block, 0).unwrap_err();
        assert!(matches!(err, IntervalError::CorruptExtra(59)));
        Ok(())
    }

    #[test]
    fn extra_offset_outside_block_is_rejected() -> Result<(), IntervalError> {
        let mut block = vec![0u8; 64];
        iv(0, 1, 0, Value::Long(5)).write_to(&mut block, 0, 64)?;
        LittleEndian::write_i32(&mut block[21..25], 60);
        let err = Interval::read_from(&block, 0).unwrap_err();
        assert!(matches!(err, IntervalError::CorruptExtra(60)));
        Ok(())
    }
}
