//! Tree header format and read/write helpers.
//!
//! The header always occupies the first [`TREE_HEADER_SIZE`] bytes of a
//! history file, zero-padded after its fields:
//!
//! ```text
//! [magic: u32][format version: u32][provider version: u32][block size: u32]
//! [max children: u32][node count: u32][root seq: u32][tree start: i64]
//! [tree end: i64]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use interval::Timestamp;
use std::io::{self, Read, Write};

use crate::HistoryError;

/// Size of the tree header block. Node blocks start right after it.
pub const TREE_HEADER_SIZE: usize = 4096;

/// Magic number identifying history tree files.
pub const HISTORY_FILE_MAGIC: u32 = 0x05FF_A900;

/// File format version. Incremented on each incompatible change.
pub const FILE_VERSION: u32 = 3;

/// Which state provider version a reopened history must have been built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedProvider {
    Exactly(u32),
    /// Accept whatever version the file was built with.
    Ignore,
}

/// Fields of the tree header, in on-disk order after magic and format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    pub provider_version: u32,
    pub block_size: u32,
    pub max_children: u32,
    pub node_count: u32,
    pub root_seq: u32,
    pub tree_start: Timestamp,
    /// End time requested when the tree was closed. Nodes of the last
    /// branch may end later.
    pub tree_end: Timestamp,
}

impl TreeHeader {
    /// Writes the full, zero-padded header block to `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut block = Vec::with_capacity(TREE_HEADER_SIZE);
        block.write_u32::<LittleEndian>(HISTORY_FILE_MAGIC)?;
        block.write_u32::<LittleEndian>(FILE_VERSION)?;
        block.write_u32::<LittleEndian>(self.provider_version)?;
        block.write_u32::<LittleEndian>(self.block_size)?;
        block.write_u32::<LittleEndian>(self.max_children)?;
        block.write_u32::<LittleEndian>(self.node_count)?;
        block.write_u32::<LittleEndian>(self.root_seq)?;
        block.write_i64::<LittleEndian>(self.tree_start)?;
        block.write_i64::<LittleEndian>(self.tree_end)?;
        block.resize(TREE_HEADER_SIZE, 0);
        w.write_all(&block)
    }

    /// Reads and validates a header block from `r`.
    ///
    /// Checks run in order: magic number, format version, provider version.
    /// The error names the first check that failed.
    pub fn read_from<R: Read>(r: &mut R, expected: ExpectedProvider) -> Result<Self, HistoryError> {
        let mut block = vec![0u8; TREE_HEADER_SIZE];
        r.read_exact(&mut block).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                HistoryError::CorruptHeader("file is shorter than the tree header".into())
            }
            _ => HistoryError::Io(e),
        })?;
        let mut buf = &block[..];

        let magic = buf.read_u32::<LittleEndian>()?;
        if magic != HISTORY_FILE_MAGIC {
            return Err(HistoryError::BadMagicNumber(magic));
        }

        let version = buf.read_u32::<LittleEndian>()?;
        if version != FILE_VERSION {
            return Err(HistoryError::FormatVersionMismatch {
                expected: FILE_VERSION,
                found: version,
            });
        }

        let provider_version = buf.read_u32::<LittleEndian>()?;
        if let ExpectedProvider::Exactly(want) = expected {
            if want != provider_version {
                return Err(HistoryError::ProviderVersionMismatch {
                    expected: want,
                    found: provider_version,
                });
            }
        }

        let header = Self {
            provider_version,
            block_size: buf.read_u32::<LittleEndian>()?,
            max_children: buf.read_u32::<LittleEndian>()?,
            node_count: buf.read_u32::<LittleEndian>()?,
            root_seq: buf.read_u32::<LittleEndian>()?,
            tree_start: buf.read_i64::<LittleEndian>()?,
            tree_end: buf.read_i64::<LittleEndian>()?,
        };
        if header.tree_end < header.tree_start {
            return Err(HistoryError::CorruptHeader(format!(
                "end time {} before start time {}",
                header.tree_end, header.tree_start
            )));
        }
        if header.root_seq >= header.node_count {
            return Err(HistoryError::CorruptHeader(format!(
                "root node {} out of {} nodes",
                header.root_seq, header.node_count
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> TreeHeader {
        TreeHeader {
            provider_version: 4,
            block_size: 4096,
            max_children: 10,
            node_count: 33,
            root_seq: 31,
            tree_start: -5,
            tree_end: 1_000,
        }
    }

    #[test]
    fn header_block_is_fixed_size() -> anyhow::Result<()> {
        let mut out = Vec::new();
        sample().write_to(&mut out)?;
        assert_eq!(out.len(), TREE_HEADER_SIZE);
        assert_eq!(&out[0..4], &HISTORY_FILE_MAGIC.to_le_bytes());
        assert!(out[44..].iter().all(|b| *b == 0));

        let back = TreeHeader::read_from(&mut Cursor::new(out), ExpectedProvider::Exactly(4))?;
        assert_eq!(back, sample());
        Ok(())
    }

    #[test]
    fn bad_magic() -> anyhow::Result<()> {
        let mut out = Vec::new();
        sample().write_to(&mut out)?;
        out[0] ^= 0xFF;
        let err = TreeHeader::read_from(&mut Cursor::new(out), ExpectedProvider::Ignore).unwrap_err();
        assert!(matches!(err, HistoryError::BadMagicNumber(_)));
        Ok(())
    }

    #[test]
    fn format_version_mismatch() -> anyhow::Result<()> {
        let mut out = Vec::new();
        sample().write_to(&mut out)?;
        out[4] = 2;
        let err = TreeHeader::read_from(&mut Cursor::new(out), ExpectedProvider::Ignore).unwrap_err();
        assert!(matches!(
            err,
            HistoryError::FormatVersionMismatch {
                expected: FILE_VERSION,
                found: 2
            }
        ));
        Ok(())
    }

    #[test]
    fn provider_version_checked_unless_ignored() -> anyhow::Result<()> {
        let mut out = Vec::new();
        sample().write_to(&mut out)?;

        let err = TreeHeader::read_from(&mut Cursor::new(out.clone()), ExpectedProvider::Exactly(5))
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::ProviderVersionMismatch {
                expected: 5,
                found: 4
            }
        ));

        let header = TreeHeader::read_from(&mut Cursor::new(out), ExpectedProvider::Ignore)?;
        assert_eq!(header.provider_version, 4);
        Ok(())
    }

    #[test]
    fn end_before_start_is_corrupt() -> anyhow::Result<()> {
        let mut out = Vec::new();
        TreeHeader {
            tree_end: -6,
            ..sample()
        }
        .write_to(&mut out)?;
        let err = TreeHeader::read_from(&mut Cursor::new(out), ExpectedProvider::Ignore).unwrap_err();
        assert!(matches!(err, HistoryError::CorruptHeader(_)));
        Ok(())
    }

    #[test]
    fn truncated_header() {
        let err = TreeHeader::read_from(&mut Cursor::new(vec![0u8; 100]), ExpectedProvider::Ignore)
            .unwrap_err();
        assert!(matches!(err, HistoryError::CorruptHeader(_)));
    }
}
