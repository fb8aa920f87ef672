//! # HTree — disk-resident History Tree
//!
//! A History Tree stores state intervals in fixed-size node blocks of a single
//! file. Only the latest branch (root to latest leaf) is open and held in
//! memory; every other node is closed, immutable and read back on demand
//! through a small node cache.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ TREE HEADER (4096 bytes)     │
//! ├──────────────────────────────┤ 4096
//! │ node 0                       │
//! ├──────────────────────────────┤ 4096 + block_size
//! │ node 1                       │
//! ├──────────────────────────────┤
//! │ ...                          │
//! └──────────────────────────────┘ 4096 + node_count * block_size
//! ```
//!
//! Node `seq` always lives at `4096 + seq * block_size`. The header is only
//! written when the tree is closed, so a file without a valid header was
//! never finished.

mod config;
mod error;
pub mod format;
pub mod io;
pub mod node;
mod tree;

pub use config::{HtConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CHILDREN};
pub use error::HistoryError;
pub use format::{ExpectedProvider, TreeHeader};
pub use node::{ChildRef, CoreNode, Node, NodeType};
pub use tree::{HistoryTree, IntegrityViolation};
