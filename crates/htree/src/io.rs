use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::format::{TreeHeader, TREE_HEADER_SIZE};
use crate::node::Node;
use crate::{HistoryError, HtConfig};

/// Number of slots in the node cache.
pub const CACHE_SIZE: usize = 256;

/// Reads and writes node blocks of one history file.
///
/// Recently used nodes are kept in a direct-mapped cache: node `seq` lives in
/// slot `seq % CACHE_SIZE`, and a colliding node simply evicts it. Every
/// written node is cached. All file and cache accesses go through one mutex,
/// since the mutation thread and query threads share this object.
#[derive(Debug)]
pub struct HtIo {
    config: Arc<HtConfig>,
    inner: Mutex<IoInner>,
}

#[derive(Debug)]
struct IoInner {
    /// `None` once closed.
    file: Option<File>,
    cache: Vec<Option<Arc<Node>>>,
}

impl HtIo {
    /// Creates (or truncates) the history file for a new tree.
    pub fn create(config: Arc<HtConfig>) -> Result<Self, HistoryError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(config.path())?;
        Ok(Self::with_file(config, file))
    }

    /// Opens an existing history file for reading.
    pub fn open(config: Arc<HtConfig>) -> Result<Self, HistoryError> {
        let file = File::open(config.path())?;
        Ok(Self::with_file(config, file))
    }

    fn with_file(config: Arc<HtConfig>, file: File) -> Self {
        Self {
            config,
            inner: Mutex::new(IoInner {
                file: Some(file),
                cache: vec![None; CACHE_SIZE],
            }),
        }
    }

    fn node_offset(&self, seq: u32) -> u64 {
        TREE_HEADER_SIZE as u64 + seq as u64 * self.config.block_size() as u64
    }

    /// Returns node `seq`, from the cache if possible.
    ///
    /// # Errors
    ///
    /// [`HistoryError::ChannelClosed`] if the file was closed, typically by a
    /// concurrent dispose. Other I/O or decoding failures are fatal.
    pub fn read_node(&self, seq: u32) -> Result<Arc<Node>, HistoryError> {
        let slot = seq as usize % CACHE_SIZE;
        let mut inner = self.inner.lock();

        if let Some(node) = &inner.cache[slot] {
            if node.seq() == seq {
                return Ok(Arc::clone(node));
            }
        }

        let offset = self.node_offset(seq);
        let file = inner.file.as_mut().ok_or(HistoryError::ChannelClosed)?;
        let mut block = vec![0u8; self.config.block_size() as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut block).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => HistoryError::CorruptFormat(format!(
                "node {seq} at offset {offset} lies past the end of the file"
            )),
            _ => HistoryError::Io(e),
        })?;

        let node = Node::read_from(&block, &self.config)?;
        if node.seq() != seq {
            return Err(HistoryError::CorruptFormat(format!(
                "block at offset {offset} holds node {} instead of {seq}",
                node.seq()
            )));
        }
        trace!(seq, "node read from disk");

        let node = Arc::new(node);
        inner.cache[slot] = Some(Arc::clone(&node));
        Ok(node)
    }

    /// Writes a closed node to its block and caches it.
    pub fn write_node(&self, node: &Arc<Node>) -> Result<(), HistoryError> {
        let mut block = vec![0u8; self.config.block_size() as usize];
        node.write_to(&mut block)?;

        let seq = node.seq();
        let offset = self.node_offset(seq);
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(HistoryError::ChannelClosed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&block)?;
        inner.cache[seq as usize % CACHE_SIZE] = Some(Arc::clone(node));
        debug!(seq, offset, "node written");
        Ok(())
    }

    /// Writes the tree header at offset 0 and syncs the file.
    pub fn write_header(&self, header: &TreeHeader) -> Result<(), HistoryError> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(HistoryError::ChannelClosed)?;
        file.seek(SeekFrom::Start(0))?;
        header.write_to(file)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Current size of the history file, 0 if it cannot be read.
    pub fn file_size(&self) -> u64 {
        fs::metadata(self.config.path()).map_or(0, |m| m.len())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().file.is_none()
    }

    /// Closes the file. Later reads fail with [`HistoryError::ChannelClosed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.file = None;
        inner.cache.iter_mut().for_each(|slot| *slot = None);
    }

    /// Closes and removes the history file.
    pub fn delete(&self) -> Result<(), HistoryError> {
        self.close();
        match fs::remove_file(self.config.path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CoreNode;
    use interval::{Interval, Value};
    use tempfile::tempdir;

    fn closed_node(config: &HtConfig, seq: u32, value: i32) -> anyhow::Result<Arc<Node>> {
        let node = Node::Core(CoreNode::new(config, seq, None, 0));
        node.add_interval(Interval::new(0, 10, 1, Value::Int(value))?)?;
        node.close(10)?;
        Ok(Arc::new(node))
    }

    #[test]
    fn write_is_cached_and_readable_after_eviction() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = Arc::new(HtConfig::with_params(dir.path().join("io.ht"), 256, 2, 0, 0)?);
        let io = HtIo::create(Arc::clone(&config))?;

        let first = closed_node(&config, 3, 30)?;
        io.write_node(&first)?;
        // same Arc served from the cache
        assert!(Arc::ptr_eq(&io.read_node(3)?, &first));

        // collides with slot 3 and evicts it
        let colliding = closed_node(&config, 3 + CACHE_SIZE as u32, 99)?;
        io.write_node(&colliding)?;

        let reread = io.read_node(3)?;
        assert!(!Arc::ptr_eq(&reread, &first));
        assert_eq!(reread.intervals(), first.intervals());
        assert_eq!(
            io.file_size(),
            (TREE_HEADER_SIZE + (4 + CACHE_SIZE) * 256) as u64
        );
        Ok(())
    }

    #[test]
    fn read_after_close_is_channel_closed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = Arc::new(HtConfig::with_params(dir.path().join("io.ht"), 256, 2, 0, 0)?);
        let io = HtIo::create(Arc::clone(&config))?;
        io.write_node(&closed_node(&config, 0, 1)?)?;
        io.close();

        assert!(io.is_closed());
        let err = io.read_node(0).unwrap_err();
        assert!(err.is_channel_closed());
        Ok(())
    }

    #[test]
    fn node_past_end_of_file_is_corrupt() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = Arc::new(HtConfig::with_params(dir.path().join("io.ht"), 256, 2, 0, 0)?);
        let io = HtIo::create(Arc::clone(&config))?;
        io.write_node(&closed_node(&config, 0, 1)?)?;

        let err = io.read_node(5).unwrap_err();
        assert!(matches!(err, HistoryError::CorruptFormat(_)));
        assert!(err.is_rebuild_needed());
        Ok(())
    }

    #[test]
    fn delete_removes_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gone.ht");
        let config = Arc::new(HtConfig::with_params(&path, 256, 2, 0, 0)?);
        let io = HtIo::create(config)?;
        assert!(path.exists());
        io.delete()?;
        assert!(!path.exists());
        // deleting twice is harmless
        io.delete()?;
        Ok(())
    }
}
