use interval::{Interval, Timestamp};
use parking_lot::RwLock;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::format::{ExpectedProvider, TreeHeader};
use crate::io::HtIo;
use crate::node::{CoreNode, Node};
use crate::{HistoryError, HtConfig};

/// A structural inconsistency found by [`HistoryTree::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("start time of node #{node} ({node_start}) does not match start time of first child #{child} ({child_start})")]
    StartMismatch {
        node: u32,
        node_start: Timestamp,
        child: u32,
        child_start: Timestamp,
    },
    #[error("end time of node #{node} ({node_end}) does not match end time of last child #{child} ({child_end:?})")]
    EndMismatch {
        node: u32,
        node_end: Timestamp,
        child: u32,
        child_end: Option<Timestamp>,
    },
    #[error("node #{node} records start {recorded} for child #{child}, which actually starts at {actual}")]
    ChildStartMismatch {
        node: u32,
        child: u32,
        recorded: Timestamp,
        actual: Timestamp,
    },
    #[error("children of node #{node} are not in ascending start order")]
    UnorderedChildren { node: u32 },
}

/// The History Tree.
///
/// Only the latest branch, the root-to-leaf path of open nodes, is ever
/// mutated; every other node is closed and lives on disk behind [`HtIo`].
///
/// Insertion assumes a single writer. Readers may run concurrently with it:
/// branch nodes guard their own contents, and the branch vector itself is
/// only write-locked while a split replaces its entries.
#[derive(Debug)]
pub struct HistoryTree {
    config: Arc<HtConfig>,
    io: HtIo,
    /// Root first. `latest_branch[i]` is the parent of `latest_branch[i + 1]`.
    latest_branch: RwLock<Vec<Arc<Node>>>,
    /// Latest timestamp known to the tree.
    tree_end: AtomicI64,
    /// Largest interval end inserted so far. Unlike `tree_end` it is never
    /// pushed forward by node creation.
    data_end: AtomicI64,
    node_count: AtomicU32,
}

impl HistoryTree {
    /// Creates a new, empty tree and its history file.
    pub fn create(config: HtConfig) -> Result<Self, HistoryError> {
        let config = Arc::new(config);
        let io = HtIo::create(Arc::clone(&config))?;
        let tree = Self {
            tree_end: AtomicI64::new(config.tree_start()),
            data_end: AtomicI64::new(config.tree_start()),
            node_count: AtomicU32::new(0),
            latest_branch: RwLock::new(Vec::new()),
            io,
            config,
        };
        let root = tree.new_core_node(None, tree.config.tree_start());
        tree.latest_branch.write().push(root);
        info!(
            path = %tree.config.path().display(),
            block_size = tree.config.block_size(),
            max_children = tree.config.max_children(),
            "history tree created"
        );
        Ok(tree)
    }

    /// Opens a finished tree from an existing history file.
    ///
    /// # Errors
    ///
    /// Each failed check has its own error: [`HistoryError::FileNotFound`],
    /// [`HistoryError::EmptyFile`], [`HistoryError::BadMagicNumber`],
    /// [`HistoryError::FormatVersionMismatch`],
    /// [`HistoryError::ProviderVersionMismatch`] and
    /// [`HistoryError::CorruptHeader`] when the header start time disagrees
    /// with the root node.
    pub fn open<P: AsRef<Path>>(path: P, expected: ExpectedProvider) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HistoryError::FileNotFound(path.to_path_buf()));
        }
        if path.metadata()?.len() == 0 {
            return Err(HistoryError::EmptyFile(path.to_path_buf()));
        }

        let header = TreeHeader::read_from(&mut File::open(path)?, expected).map_err(|e| {
            if let HistoryError::ProviderVersionMismatch { expected, found } = e {
                warn!(path = %path.display(), expected, found, "history built by another provider version");
            }
            e
        })?;
        let config = HtConfig::with_params(
            path,
            header.block_size,
            header.max_children,
            header.provider_version,
            header.tree_start,
        )
        .map_err(|e| HistoryError::CorruptHeader(e.to_string()))?;
        let config = Arc::new(config);
        let io = HtIo::open(Arc::clone(&config))?;

        let branch = Self::rebuild_latest_branch(&io, header.root_seq, header.node_count)?;
        let root = &branch[0];
        if root.start() != header.tree_start {
            return Err(HistoryError::CorruptHeader(format!(
                "start time {} inconsistent with root node start {}",
                header.tree_start,
                root.start()
            )));
        }
        info!(path = %path.display(), nodes = header.node_count, "history tree opened");
        Ok(Self {
            config,
            io,
            latest_branch: RwLock::new(branch),
            tree_end: AtomicI64::new(header.tree_end),
            data_end: AtomicI64::new(header.tree_end),
            node_count: AtomicU32::new(header.node_count),
        })
    }

    /// Reads the branch from the root down, always following the latest
    /// child. A branch can never be longer than the tree has nodes.
    fn rebuild_latest_branch(
        io: &HtIo,
        root_seq: u32,
        node_count: u32,
    ) -> Result<Vec<Arc<Node>>, HistoryError> {
        let mut branch = vec![io.read_node(root_seq)?];
        while let Some(next) = branch
            .last()
            .and_then(|n| n.as_core())
            .and_then(CoreNode::latest_child)
        {
            if branch.len() >= node_count as usize {
                return Err(HistoryError::CorruptFormat(format!(
                    "latest branch from root {root_seq} is longer than the {node_count} nodes of the tree"
                )));
            }
            branch.push(io.read_node(next)?);
        }
        Ok(branch)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &HtConfig {
        &self.config
    }

    pub fn tree_start(&self) -> Timestamp {
        self.config.tree_start()
    }

    pub fn tree_end(&self) -> Timestamp {
        self.tree_end.load(Ordering::Acquire)
    }

    pub fn node_count(&self) -> u32 {
        self.node_count.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> usize {
        self.latest_branch.read().len()
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.latest_branch.read()[0])
    }

    /// Snapshot of the latest branch, root first.
    pub fn latest_branch(&self) -> Vec<Arc<Node>> {
        self.latest_branch.read().clone()
    }

    pub fn file_size(&self) -> u64 {
        self.io.file_size()
    }

    fn branch_node(&self, index: usize) -> Arc<Node> {
        Arc::clone(&self.latest_branch.read()[index])
    }

    fn branch_len(&self) -> usize {
        self.latest_branch.read().len()
    }

    // ------------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------------

    /// Inserts an interval into the latest branch, splitting nodes as needed.
    ///
    /// The interval goes to the deepest branch node that has room and whose
    /// start is not after the interval's start. Intervals starting before the
    /// latest leaf therefore land in one of its ancestors.
    ///
    /// # Errors
    ///
    /// [`HistoryError::OutOfRange`] if the interval starts before the tree,
    /// [`HistoryError::IntervalTooLarge`] if it could not fit even an empty
    /// node. I/O errors while persisting split nodes are fatal for the tree.
    pub fn insert_interval(&self, interval: Interval) -> Result<(), HistoryError> {
        self.check_insertable(&interval)?;

        let mut index = self.branch_len() - 1;
        loop {
            let node = self.branch_node(index);

            if interval.serialized_size() > node.free_space() {
                // not enough room, continue in a new sibling
                self.add_sibling(index)?;
                index = self.branch_len() - 1;
                continue;
            }

            if interval.start() < node.start() {
                // the root starts at the tree start, so this never climbs past it
                assert!(index > 0, "interval starting at {} climbed above the root", interval.start());
                index -= 1;
                continue;
            }

            let end = interval.end();
            node.add_interval(interval)?;
            self.tree_end.fetch_max(end, Ordering::AcqRel);
            self.data_end.fetch_max(end, Ordering::AcqRel);
            return Ok(());
        }
    }

    /// Checks what can be known about `interval` without touching the tree:
    /// it must not start before the tree and must fit an empty node.
    pub fn check_insertable(&self, interval: &Interval) -> Result<(), HistoryError> {
        if interval.start() < self.tree_start() {
            return Err(HistoryError::OutOfRange {
                time: interval.start(),
                start: self.tree_start(),
                end: self.tree_end(),
            });
        }
        let capacity = self.config.node_capacity();
        if interval.serialized_size() > capacity {
            return Err(HistoryError::IntervalTooLarge {
                size: interval.serialized_size(),
                capacity,
            });
        }
        Ok(())
    }

    /// Checks that the tree can be closed at `end_time`: no interval may end
    /// after it.
    pub fn check_closable(&self, end_time: Timestamp) -> Result<(), HistoryError> {
        let data_end = self.data_end.load(Ordering::Acquire);
        if data_end > end_time {
            return Err(HistoryError::OutOfRange {
                time: end_time,
                start: self.tree_start(),
                end: data_end,
            });
        }
        Ok(())
    }

    /// Allocates the next sequence number for a new open node.
    fn new_core_node(&self, parent: Option<u32>, start: Timestamp) -> Arc<Node> {
        let seq = self.node_count.fetch_add(1, Ordering::AcqRel);
        // Keep tree_end strictly after every open node's start, so a later
        // split never closes a node before it begins.
        self.tree_end.fetch_max(start + 1, Ordering::AcqRel);
        Arc::new(Node::Core(CoreNode::new(&self.config, seq, parent, start)))
    }

    /// Closes the branch from `index` down and replaces it with fresh nodes.
    ///
    /// When the parent at `index - 1` is already full the split moves up one
    /// level, up to promoting a new root.
    fn add_sibling(&self, index: usize) -> Result<(), HistoryError> {
        let mut branch = self.latest_branch.write();
        let split_time = self.tree_end();

        let max_children = self.config.max_children() as usize;
        let mut index = index;
        while index > 0 && branch[index - 1].child_count() >= max_children {
            index -= 1;
        }
        if index == 0 {
            return self.add_new_root(&mut branch, split_time);
        }

        debug!(level = index, split_time, "splitting latest branch");
        // deepest first: a reader that finds a node closed reads its children
        // from disk
        for node in branch[index..].iter().rev() {
            node.close(split_time)?;
            self.io.write_node(node)?;
        }
        for i in index..branch.len() {
            let parent = Arc::clone(&branch[i - 1]);
            let node = self.new_core_node(Some(parent.seq()), split_time + 1);
            link(&parent, &node)?;
            branch[i] = node;
        }
        Ok(())
    }

    /// Pushes the whole branch one level down under a brand-new root.
    fn add_new_root(&self, branch: &mut Vec<Arc<Node>>, split_time: Timestamp) -> Result<(), HistoryError> {
        let old_root = Arc::clone(&branch[0]);
        let new_root = self.new_core_node(None, self.tree_start());
        old_root.set_parent(Some(new_root.seq()));

        for node in branch.iter().rev() {
            node.close(split_time)?;
            self.io.write_node(node)?;
        }

        link(&new_root, &old_root)?;

        let depth = branch.len();
        let mut new_branch = Vec::with_capacity(depth + 1);
        new_branch.push(new_root);
        for i in 1..=depth {
            let parent = Arc::clone(&new_branch[i - 1]);
            let node = self.new_core_node(Some(parent.seq()), split_time + 1);
            link(&parent, &node)?;
            new_branch.push(node);
        }

        debug!(
            root = new_branch[0].seq(),
            depth = new_branch.len(),
            split_time,
            "promoted new root"
        );
        *branch = new_branch;
        Ok(())
    }

    /// Closes the tree at `end_time`, persists the latest branch and writes
    /// the tree header. This is the single commit point of a tree file.
    ///
    /// The tree end becomes `end_time` exactly. Branch nodes opened by a split
    /// after the last real data may start past it; they are closed at the
    /// latest leaf's start instead, so each node still ends no earlier than it
    /// starts and parents still end with their last child. Queries never
    /// reach them since they lie past the tree end.
    ///
    /// # Errors
    ///
    /// [`HistoryError::OutOfRange`] if an inserted interval ends after
    /// `end_time`; nothing is modified in that case.
    pub fn close_tree(&self, end_time: Timestamp) -> Result<(), HistoryError> {
        let branch = self.latest_branch.read();
        self.check_closable(end_time)?;

        let close_at = end_time.max(branch[branch.len() - 1].start());
        self.tree_end.store(end_time, Ordering::Release);

        for node in branch.iter().rev() {
            node.close(close_at)?;
            self.io.write_node(node)?;
        }

        let root = &branch[0];
        let header = TreeHeader {
            provider_version: self.config.provider_version(),
            block_size: self.config.block_size(),
            max_children: self.config.max_children(),
            node_count: self.node_count(),
            root_seq: root.seq(),
            tree_start: root.start(),
            tree_end: end_time,
        };
        self.io.write_header(&header)?;

        info!(
            end_time,
            nodes = header.node_count,
            depth = branch.len(),
            "history tree closed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Returns node `seq`, from the latest branch if it is still there,
    /// otherwise through the IO cache.
    pub fn read_node(&self, seq: u32) -> Result<Arc<Node>, HistoryError> {
        let in_branch = self
            .latest_branch
            .read()
            .iter()
            .find(|n| n.seq() == seq)
            .cloned();
        match in_branch {
            Some(node) => Ok(node),
            None => self.io.read_node(seq),
        }
    }

    /// The child of `node` whose time range holds `t`: the one with the
    /// greatest start time `<= t`.
    pub fn select_next_child(&self, node: &Node, t: Timestamp) -> Result<Arc<Node>, HistoryError> {
        let seq = node
            .as_core()
            .and_then(|core| core.child_containing(t))
            .ok_or_else(|| {
                HistoryError::CorruptFormat(format!("no child of node {} holds time {t}", node.seq()))
            })?;
        // children of a closed node are closed too, skip the branch lookup
        if node.is_closed() {
            self.io.read_node(seq)
        } else {
            self.read_node(seq)
        }
    }

    /// Closes the history file; later disk reads fail with
    /// [`HistoryError::ChannelClosed`].
    pub fn close_file(&self) {
        self.io.close();
    }

    /// Closes and removes the history file.
    pub fn delete_file(&self) -> Result<(), HistoryError> {
        self.io.delete()
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Checks every Core node against its children: start equals the first
    /// child's start, a closed node's end equals the last child's end, and
    /// recorded child starts match the children themselves.
    pub fn check_integrity(&self) -> Result<Vec<IntegrityViolation>, HistoryError> {
        let mut violations = Vec::new();
        for seq in 0..self.node_count() {
            let node = self.read_node(seq)?;
            self.check_node(&node, &mut violations)?;
        }
        Ok(violations)
    }

    fn check_node(&self, node: &Node, violations: &mut Vec<IntegrityViolation>) -> Result<(), HistoryError> {
        let Some(core) = node.as_core() else {
            return Ok(());
        };
        let children = core.children();
        let (Some(first), Some(last)) = (children.first(), children.last()) else {
            return Ok(());
        };

        let first_node = self.read_node(first.seq)?;
        if first_node.start() != node.start() {
            violations.push(IntegrityViolation::StartMismatch {
                node: node.seq(),
                node_start: node.start(),
                child: first.seq,
                child_start: first_node.start(),
            });
        }

        if let Some(node_end) = node.end() {
            let last_node = self.read_node(last.seq)?;
            if last_node.end() != Some(node_end) {
                violations.push(IntegrityViolation::EndMismatch {
                    node: node.seq(),
                    node_end,
                    child: last.seq,
                    child_end: last_node.end(),
                });
            }
        }

        for child in &children {
            let actual = self.read_node(child.seq)?.start();
            if actual != child.start {
                violations.push(IntegrityViolation::ChildStartMismatch {
                    node: node.seq(),
                    child: child.seq,
                    recorded: child.start,
                    actual,
                });
            }
        }

        if children.windows(2).any(|w| w[0].start >= w[1].start) {
            violations.push(IntegrityViolation::UnorderedChildren { node: node.seq() });
        }
        Ok(())
    }

    /// Prints the whole tree in pre-order, optionally followed by the
    /// intervals of every node.
    pub fn debug_print<W: Write>(&self, w: &mut W, print_intervals: bool) -> Result<(), HistoryError> {
        let root = self.root();
        self.pre_order_print(w, &root, 0, false)?;
        if print_intervals {
            writeln!(w, "\nDetails of intervals:")?;
            self.pre_order_print(w, &root, 0, true)?;
        }
        writeln!(w)?;
        Ok(())
    }

    fn pre_order_print<W: Write>(
        &self,
        w: &mut W,
        node: &Node,
        depth: usize,
        print_intervals: bool,
    ) -> Result<(), HistoryError> {
        writeln!(w, "{node}")?;
        if print_intervals {
            node.debug_print(w)?;
        }
        let children = node.as_core().map(CoreNode::children).unwrap_or_default();
        for child in children {
            let child = self.read_node(child.seq)?;
            write!(w, "{}+-", "  ".repeat(depth))?;
            self.pre_order_print(w, &child, depth + 1, print_intervals)?;
        }
        Ok(())
    }
}

fn link(parent: &Node, child: &Node) -> Result<(), HistoryError> {
    match parent.as_core() {
        Some(core) => core.link_child(child.seq(), child.start()),
        None => Err(HistoryError::CorruptFormat(format!(
            "node {} cannot hold children",
            parent.seq()
        ))),
    }
}

impl fmt::Display for HistoryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let branch = self.latest_branch();
        writeln!(f, "Information on the current tree:\n")?;
        writeln!(f, "Blocksize: {}", self.config.block_size())?;
        writeln!(f, "Max nb. of children per node: {}", self.config.max_children())?;
        writeln!(f, "Number of nodes: {}", self.node_count())?;
        writeln!(f, "Depth of the tree: {}", branch.len())?;
        writeln!(f, "Size of the treefile: {}", self.file_size())?;
        writeln!(f, "Root node has sequence number: {}", branch[0].seq())?;
        write!(
            f,
            "'Latest leaf' has sequence number: {}",
            branch[branch.len() - 1].seq()
        )
    }
}
