use interval::{IntervalError, Timestamp};
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Interval(#[from] IntervalError),
    #[error("time {time} is outside of range [{start}, {end}]")]
    OutOfRange {
        time: Timestamp,
        start: Timestamp,
        end: Timestamp,
    },
    #[error("interval of {size} bytes can never fit a node holding at most {capacity} bytes")]
    IntervalTooLarge { size: usize, capacity: usize },
    #[error("node {seq} has {free} free bytes, {needed} needed")]
    NodeFull { seq: u32, free: usize, needed: usize },
    #[error("node {seq} is closed")]
    NodeClosed { seq: u32 },
    #[error("node {seq} is still open and cannot be written")]
    NodeOpen { seq: u32 },
    #[error("node {seq} already has the maximum of {max} children")]
    TooManyChildren { seq: u32, max: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("history file {0} does not exist")]
    FileNotFound(PathBuf),
    #[error("history file {0} is empty")]
    EmptyFile(PathBuf),
    #[error("wrong magic number {0:#010x}")]
    BadMagicNumber(u32),
    #[error("mismatching history file format versions: expected {expected}, found {found}")]
    FormatVersionMismatch { expected: u32, found: u32 },
    #[error("mismatching state provider versions: expected {expected}, found {found}")]
    ProviderVersionMismatch { expected: u32, found: u32 },
    #[error("corrupt tree header: {0}")]
    CorruptHeader(String),
    #[error("corrupt history file: {0}")]
    CorruptFormat(String),
    #[error("history file channel is closed")]
    ChannelClosed,
    #[error("no interval for attribute {attribute} at time {time}")]
    AttributeNotFound { attribute: u32, time: Timestamp },
    #[error("the history is already finished building")]
    AlreadyFinished,
    #[error("the tree mutation thread is gone")]
    WorkerGone,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl HistoryError {
    /// Returns `true` for incompatible or corrupt history files, which have no
    /// recovery path other than rebuilding the history.
    pub fn is_rebuild_needed(&self) -> bool {
        matches!(
            self,
            HistoryError::EmptyFile(_)
                | HistoryError::BadMagicNumber(_)
                | HistoryError::FormatVersionMismatch { .. }
                | HistoryError::ProviderVersionMismatch { .. }
                | HistoryError::CorruptHeader(_)
                | HistoryError::CorruptFormat(_)
        )
    }

    /// Returns `true` when a read raced with the backend shutting down. The
    /// caller should stop querying rather than report corruption.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, HistoryError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(HistoryError::BadMagicNumber(0).is_rebuild_needed());
        assert!(HistoryError::ProviderVersionMismatch {
            expected: 1,
            found: 2
        }
        .is_rebuild_needed());
        assert!(!HistoryError::ChannelClosed.is_rebuild_needed());
        assert!(HistoryError::ChannelClosed.is_channel_closed());
        assert!(!HistoryError::AlreadyFinished.is_channel_closed());
    }

    #[test]
    fn messages_name_the_failed_check() {
        let magic = HistoryError::BadMagicNumber(0xDEAD).to_string();
        assert!(magic.contains("magic"));
        let version = HistoryError::FormatVersionMismatch {
            expected: 3,
            found: 2,
        }
        .to_string();
        assert!(version.contains("format versions"));
        let provider = HistoryError::ProviderVersionMismatch {
            expected: 3,
            found: 2,
        }
        .to_string();
        assert!(provider.contains("provider"));
    }
}
