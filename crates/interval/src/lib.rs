//! # Interval — state intervals of the History Tree
//!
//! An [`Interval`] records that attribute `attribute` held `value` for every
//! timestamp in `[start, end]`. Intervals are immutable once built and are
//! ordered by their **end** time inside a node.
//!
//! ## Entry layout
//!
//! Each interval occupies one fixed-size data entry in the forward-growing
//! data section of a node block, plus an optional variable-size "extra" entry
//! in the backward-growing extra area at the end of the block:
//!
//! ```text
//! DATA ENTRY (25 bytes, written in node order)
//! start (i64) | end (i64) | attribute (u32) | type tag (u8) | value or offset (i32)
//!
//! EXTRA ENTRY (only for Long / Double / String values)
//! Long, Double : 8 raw bytes
//! String       : size (u8) | bytes | 0x00
//! ```
//!
//! Null and Int values are stored inline in the data entry; the other
//! variants store the in-block offset of their extra entry instead. All
//! integers are little-endian.

mod interval;
mod value;

use std::io;

use thiserror::Error;

pub use interval::{Interval, Timestamp, DATA_ENTRY_SIZE};
pub use value::{Value, MAX_STRING_LEN};

#[derive(Debug, Error)]
pub enum IntervalError {
    #[error("invalid time range: start {start} is after end {end}")]
    InvalidRange { start: Timestamp, end: Timestamp },
    #[error("string value of {0} bytes exceeds the {MAX_STRING_LEN}-byte limit")]
    StringTooLong(usize),
    #[error("unrecognized value type tag {0:#04x}")]
    UnknownTypeTag(u8),
    #[error("corrupt extra entry at offset {0}")]
    CorruptExtra(i32),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
