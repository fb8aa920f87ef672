use interval::{Timestamp, DATA_ENTRY_SIZE};
use std::path::{Path, PathBuf};

use crate::node::CoreNode;
use crate::HistoryError;

/// Default node block size: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Default maximum number of children per Core node.
pub const DEFAULT_MAX_CHILDREN: u32 = 50;

/// Immutable description of one History Tree instance.
///
/// Built once when a tree is created or reopened and shared by the tree and
/// its IO layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtConfig {
    path: PathBuf,
    block_size: u32,
    max_children: u32,
    provider_version: u32,
    tree_start: Timestamp,
}

impl HtConfig {
    /// Configuration with the default block size and branching factor.
    pub fn new<P: AsRef<Path>>(path: P, provider_version: u32, tree_start: Timestamp) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_children: DEFAULT_MAX_CHILDREN,
            provider_version,
            tree_start,
        }
    }

    /// Configuration with explicit tuning parameters.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidConfig`] if `max_children` is zero or if
    /// a block cannot hold the Core-node header plus one data entry.
    pub fn with_params<P: AsRef<Path>>(
        path: P,
        block_size: u32,
        max_children: u32,
        provider_version: u32,
        tree_start: Timestamp,
    ) -> Result<Self, HistoryError> {
        if max_children == 0 {
            return Err(HistoryError::InvalidConfig(
                "a node must accept at least one child".into(),
            ));
        }
        if block_size > i32::MAX as u32 {
            return Err(HistoryError::InvalidConfig(format!(
                "block size {block_size} does not fit in-block offsets"
            )));
        }
        let needed = CoreNode::header_size(max_children as usize) + DATA_ENTRY_SIZE;
        if (block_size as usize) < needed {
            return Err(HistoryError::InvalidConfig(format!(
                "block size {block_size} is smaller than the {needed} bytes a node needs \
                 for {max_children} children and one interval"
            )));
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            block_size,
            max_children,
            provider_version,
            tree_start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn max_children(&self) -> u32 {
        self.max_children
    }

    pub fn provider_version(&self) -> u32 {
        self.provider_version
    }

    pub fn tree_start(&self) -> Timestamp {
        self.tree_start
    }

    /// Bytes of a block usable for intervals once the Core-node header is
    /// accounted for.
    pub fn node_capacity(&self) -> usize {
        self.block_size as usize - CoreNode::header_size(self.max_children as usize)
    }
}
