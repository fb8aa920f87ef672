use htree::{ExpectedProvider, HistoryError, HistoryTree, HtConfig, Node};
use interval::{Interval, Timestamp, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Query facade over a [`HistoryTree`].
///
/// # Lifecycle
///
/// 1. **Building**: [`insert_past_state`](Self::insert_past_state) feeds
///    intervals into the latest branch. Queries already work and see
///    everything inserted so far.
/// 2. **Finished**: [`finished_building`](Self::finished_building) closes the
///    latest branch and writes the tree header. Inserts are refused from then
///    on.
/// 3. **Disposed**: [`dispose`](Self::dispose) releases the file, deleting it
///    if building never finished.
#[derive(Debug)]
pub struct HistoryTreeBackend {
    tree: HistoryTree,
    finished: AtomicBool,
}

impl HistoryTreeBackend {
    /// Creates a backend writing a brand-new history file.
    pub fn new(config: HtConfig) -> Result<Self, HistoryError> {
        let tree = HistoryTree::create(config)?;
        Ok(Self {
            tree,
            finished: AtomicBool::new(false),
        })
    }

    /// Opens a finished history file for querying only.
    pub fn open_existing<P: AsRef<Path>>(
        path: P,
        expected: ExpectedProvider,
    ) -> Result<Self, HistoryError> {
        let tree = HistoryTree::open(path, expected)?;
        Ok(Self {
            tree,
            finished: AtomicBool::new(true),
        })
    }

    pub fn tree(&self) -> &HistoryTree {
        &self.tree
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn start_time(&self) -> Timestamp {
        self.tree.tree_start()
    }

    pub fn end_time(&self) -> Timestamp {
        self.tree.tree_end()
    }

    pub fn file_size(&self) -> u64 {
        self.tree.file_size()
    }

    /// Records that `attribute` held `value` over `[start, end]`.
    ///
    /// Intervals should arrive in non-decreasing `start` order. An interval
    /// starting before the latest leaf is stored in an ancestor node, where
    /// queries still find it. Keeping the intervals of one attribute
    /// non-overlapping is up to the caller; overlapping intervals make
    /// queries return whichever one the traversal meets last.
    ///
    /// # Errors
    ///
    /// [`HistoryError::AlreadyFinished`] after
    /// [`finished_building`](Self::finished_building), interval validation
    /// errors, and the insertion errors of [`HistoryTree::insert_interval`].
    pub fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        attribute: u32,
        value: Value,
    ) -> Result<(), HistoryError> {
        let interval = Interval::new(start, end, attribute, value)?;
        self.insert_interval(interval)
    }

    pub(crate) fn insert_interval(&self, interval: Interval) -> Result<(), HistoryError> {
        if self.is_finished() {
            return Err(HistoryError::AlreadyFinished);
        }
        self.tree.insert_interval(interval)
    }

    /// Closes the tree at `end_time`. Irreversible.
    pub fn finished_building(&self, end_time: Timestamp) -> Result<(), HistoryError> {
        if self.is_finished() {
            return Err(HistoryError::AlreadyFinished);
        }
        self.tree.close_tree(end_time)?;
        self.finished.store(true, Ordering::Release);
        info!(
            start = self.start_time(),
            end = self.end_time(),
            size = self.file_size(),
            "history finished building"
        );
        Ok(())
    }

    fn check_range(&self, t: Timestamp) -> Result<(), HistoryError> {
        let (start, end) = (self.start_time(), self.end_time());
        if t < start || t > end {
            return Err(HistoryError::OutOfRange { time: t, start, end });
        }
        Ok(())
    }

    /// Full state at `t`: every interval live at `t`, keyed by attribute.
    ///
    /// Walks the root-to-leaf path whose nodes cover `t`. A deeper node's
    /// interval replaces whatever a shallower node produced for the same
    /// attribute.
    pub fn do_query(&self, t: Timestamp) -> Result<BTreeMap<u32, Interval>, HistoryError> {
        self.check_range(t)?;

        let mut state = BTreeMap::new();
        let mut node = self.tree.root();
        loop {
            node.query_at_time(t, &mut state);
            if node.child_count() == 0 {
                return Ok(state);
            }
            node = self.tree.select_next_child(&node, t)?;
        }
    }

    /// The interval of `attribute` live at `t`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::OutOfRange`] for a `t` outside the tree, and
    /// [`HistoryError::AttributeNotFound`] if no node on the path holds the
    /// attribute at `t`.
    pub fn do_singular_query(&self, t: Timestamp, attribute: u32) -> Result<Interval, HistoryError> {
        self.check_range(t)?;

        let mut node = self.tree.root();
        loop {
            if let Some(interval) = node.query_attribute_at_time(attribute, t) {
                return Ok(interval);
            }
            if node.child_count() == 0 {
                return Err(HistoryError::AttributeNotFound { attribute, time: t });
            }
            node = self.tree.select_next_child(&node, t)?;
        }
    }

    /// Mean usage percentage over every node of the tree.
    pub fn average_node_usage(&self) -> Result<f64, HistoryError> {
        let count = self.tree.node_count();
        let mut total = 0.0;
        for seq in 0..count {
            let node: Arc<Node> = self.tree.read_node(seq)?;
            total += node.usage_percent();
        }
        Ok(total / f64::from(count))
    }

    /// Releases the history file. A file whose building never finished is
    /// incomplete and gets deleted.
    pub fn dispose(&self) -> Result<(), HistoryError> {
        if self.is_finished() {
            self.tree.close_file();
            Ok(())
        } else {
            warn!(
                path = %self.tree.config().path().display(),
                "history disposed while building, deleting partial file"
            );
            self.tree.delete_file()
        }
    }
}
