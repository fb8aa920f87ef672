//! History Tree nodes.
//!
//! A node is one disk block:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ COMMON HEADER (34 bytes)                     │
//! │ type (u8) | start (i64) | end (i64)          │
//! │ seq (u32) | parent seq (i32, -1 = root)      │
//! │ interval count (u32) | extra offset (u32)    │
//! │ closed flag (u8)                             │
//! ├──────────────────────────────────────────────┤
//! │ TYPE-SPECIFIC HEADER                         │
//! ├──────────────────────────────────────────────┤
//! │ DATA SECTION → (one entry per interval)      │
//! │                                              │
//! │                free space                    │
//! │                                              │
//! │ ← EXTRA AREA (grows back from block end)     │
//! └──────────────────────────────────────────────┘
//! ```

mod core_node;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use interval::{Interval, Timestamp, DATA_ENTRY_SIZE};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};

use crate::{HistoryError, HtConfig};

pub use self::core_node::{ChildRef, CoreNode};

/// 1 (type) + 2 x 8 (start, end) + 4 x 4 (seq, parent, count, extra offset)
/// + 1 (closed flag).
pub const COMMON_HEADER_SIZE: usize = 34;

const NO_PARENT: i32 = -1;

/// Discriminant stored in the first byte of every node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Core = 1,
}

impl NodeType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(NodeType::Core),
            _ => None,
        }
    }
}

/// A node of the History Tree.
///
/// Nodes are shared (`Arc<Node>`) between the latest branch, the IO cache and
/// query threads; their mutable parts sit behind a per-node read/write lock.
#[derive(Debug)]
pub enum Node {
    Core(CoreNode),
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Core(_) => NodeType::Core,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            Node::Core(n) => n.seq(),
        }
    }

    pub fn start(&self) -> Timestamp {
        match self {
            Node::Core(n) => n.start(),
        }
    }

    pub fn as_core(&self) -> Option<&CoreNode> {
        match self {
            Node::Core(n) => Some(n),
        }
    }

    fn header_size(&self) -> usize {
        match self {
            Node::Core(n) => CoreNode::header_size(n.max_children()),
        }
    }

    fn block_size(&self) -> usize {
        match self {
            Node::Core(n) => n.block_size(),
        }
    }

    fn with_body<R>(&self, f: impl FnOnce(&NodeBody) -> R) -> R {
        match self {
            Node::Core(n) => f(&n.state.read().body),
        }
    }

    fn with_body_mut<R>(&self, f: impl FnOnce(&mut NodeBody) -> R) -> R {
        match self {
            Node::Core(n) => f(&mut n.state.write().body),
        }
    }

    /// End time, only known once the node is closed.
    pub fn end(&self) -> Option<Timestamp> {
        self.with_body(|b| b.end)
    }

    pub fn is_closed(&self) -> bool {
        self.end().is_some()
    }

    pub fn parent(&self) -> Option<u32> {
        self.with_body(|b| b.parent)
    }

    /// Re-parents this node; used when a new root is promoted above it.
    pub fn set_parent(&self, parent: Option<u32>) {
        self.with_body_mut(|b| b.parent = parent)
    }

    pub fn interval_count(&self) -> usize {
        self.with_body(|b| b.intervals.len())
    }

    pub fn intervals(&self) -> Vec<Interval> {
        self.with_body(|b| b.intervals.clone())
    }

    /// Greatest end time among the intervals held by this node.
    pub fn max_interval_end(&self) -> Option<Timestamp> {
        self.with_body(|b| b.intervals.iter().map(Interval::end).max())
    }

    pub fn free_space(&self) -> usize {
        let header_size = self.header_size();
        self.with_body(|b| b.free_space(header_size))
    }

    /// Share of the usable space (block minus header) taken by intervals.
    pub fn usage_percent(&self) -> f64 {
        let usable = (self.block_size() - self.header_size()) as f64;
        let free = self.free_space() as f64;
        100.0 - free / usable * 100.0
    }

    pub fn child_count(&self) -> usize {
        self.as_core().map_or(0, CoreNode::child_count)
    }

    /// Appends `interval`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::NodeClosed`] once the node is closed and
    /// [`HistoryError::NodeFull`] if the interval does not fit; callers check
    /// [`free_space`](Node::free_space) first.
    pub fn add_interval(&self, interval: Interval) -> Result<(), HistoryError> {
        let seq = self.seq();
        let header_size = self.header_size();
        self.with_body_mut(|b| b.add_interval(seq, header_size, interval))
    }

    /// Fixes the end time and sorts intervals by end time. Irreversible.
    pub fn close(&self, end: Timestamp) -> Result<(), HistoryError> {
        let (seq, start) = (self.seq(), self.start());
        self.with_body_mut(|b| b.close(seq, start, end))
    }

    /// Stores every interval of this node live at `t` into `out`, replacing
    /// whatever was there for the same attribute.
    pub fn query_at_time(&self, t: Timestamp, out: &mut BTreeMap<u32, Interval>) {
        self.with_body(|b| b.query_at_time(t, out))
    }

    /// The interval of `attribute` live at `t`, if this node holds it.
    pub fn query_attribute_at_time(&self, attribute: u32, t: Timestamp) -> Option<Interval> {
        self.with_body(|b| b.query_attribute_at_time(attribute, t))
    }

    /// Serializes this closed node into `block`, which must be exactly one
    /// block long and zeroed.
    pub fn write_to(&self, block: &mut [u8]) -> Result<(), HistoryError> {
        match self {
            Node::Core(n) => n.write_to(block),
        }
    }

    /// Deserializes a node block.
    pub fn read_from(block: &[u8], config: &HtConfig) -> Result<Node, HistoryError> {
        if block.len() != config.block_size() as usize {
            return Err(HistoryError::CorruptFormat(format!(
                "node block of {} bytes, expected {}",
                block.len(),
                config.block_size()
            )));
        }
        let mut buf = block;
        let common = CommonHeader::read(&mut buf)?;
        match NodeType::from_tag(common.tag) {
            Some(NodeType::Core) => Ok(Node::Core(CoreNode::read_from(config, &common, &mut buf, block)?)),
            None => Err(HistoryError::CorruptFormat(format!(
                "node {} has unknown type {}",
                common.seq, common.tag
            ))),
        }
    }

    /// Writes the node summary, its children and all its intervals.
    pub fn debug_print<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "Node #{}:", self.seq())?;
        if let Some(core) = self.as_core() {
            let children: Vec<String> = core.children().iter().map(|c| c.seq.to_string()).collect();
            if children.is_empty() {
                writeln!(w, "  0 children")?;
            } else {
                writeln!(w, "  {} children: [ {} ]", children.len(), children.join(", "))?;
            }
        }
        writeln!(w, "  Intervals contained:")?;
        for interval in self.intervals() {
            writeln!(w, "{interval}")?;
        }
        writeln!(w)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node #{}, ", self.seq())?;
        if let Some(core) = self.as_core() {
            write!(f, "{} children, ", core.child_count())?;
        }
        write!(
            f,
            "{} intervals ({:.0}% used), [{} - ",
            self.interval_count(),
            self.usage_percent(),
            self.start()
        )?;
        match self.end() {
            Some(end) => write!(f, "{end}]"),
            None => f.write_str("...]"),
        }
    }
}

/// Fields of the common header as read from disk.
pub(crate) struct CommonHeader {
    pub(crate) tag: u8,
    pub(crate) start: Timestamp,
    pub(crate) end: Timestamp,
    pub(crate) seq: u32,
    pub(crate) parent: i32,
    pub(crate) interval_count: u32,
    pub(crate) extra_offset: u32,
    pub(crate) closed: bool,
}

impl CommonHeader {
    fn read(buf: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            tag: buf.read_u8()?,
            start: buf.read_i64::<LittleEndian>()?,
            end: buf.read_i64::<LittleEndian>()?,
            seq: buf.read_u32::<LittleEndian>()?,
            parent: buf.read_i32::<LittleEndian>()?,
            interval_count: buf.read_u32::<LittleEndian>()?,
            extra_offset: buf.read_u32::<LittleEndian>()?,
            closed: buf.read_u8()? == 1,
        })
    }
}

/// Interval storage and time range shared by every node kind.
#[derive(Debug)]
pub(crate) struct NodeBody {
    pub(crate) parent: Option<u32>,
    pub(crate) end: Option<Timestamp>,
    /// Insertion order while open, sorted by end time once closed.
    pub(crate) intervals: Vec<Interval>,
    /// Offset where the extra area begins; moves towards the header as
    /// intervals with extra payloads are added.
    pub(crate) extra_offset: usize,
}

impl NodeBody {
    pub(crate) fn new(parent: Option<u32>, block_size: usize) -> Self {
        Self {
            parent,
            end: None,
            intervals: Vec::new(),
            extra_offset: block_size,
        }
    }

    /// Rebuilds a closed body from a block whose common header was parsed
    /// into `common`.
    pub(crate) fn read(
        common: &CommonHeader,
        block: &[u8],
        header_size: usize,
    ) -> Result<Self, HistoryError> {
        let corrupt = |what: String| HistoryError::CorruptFormat(format!("node {}: {what}", common.seq));

        if !common.closed {
            return Err(corrupt("node was written while still open".into()));
        }
        if common.end < common.start {
            return Err(corrupt(format!("end {} before start {}", common.end, common.start)));
        }
        let count = common.interval_count as usize;
        let extra_offset = common.extra_offset as usize;
        let data_end = header_size + count * DATA_ENTRY_SIZE;
        if data_end > extra_offset || extra_offset > block.len() {
            return Err(corrupt(format!(
                "{count} intervals and extra offset {extra_offset} overflow the block"
            )));
        }

        let mut intervals = Vec::with_capacity(count);
        for i in 0..count {
            let interval = Interval::read_from(block, header_size + i * DATA_ENTRY_SIZE)
                .map_err(|e| corrupt(format!("interval {i}: {e}")))?;
            intervals.push(interval);
        }

        Ok(Self {
            parent: u32::try_from(common.parent).ok(),
            end: Some(common.end),
            intervals,
            extra_offset,
        })
    }

    pub(crate) fn free_space(&self, header_size: usize) -> usize {
        let data_end = header_size + self.intervals.len() * DATA_ENTRY_SIZE;
        self.extra_offset.saturating_sub(data_end)
    }

    fn add_interval(
        &mut self,
        seq: u32,
        header_size: usize,
        interval: Interval,
    ) -> Result<(), HistoryError> {
        if self.end.is_some() {
            return Err(HistoryError::NodeClosed { seq });
        }
        let free = self.free_space(header_size);
        let needed = interval.serialized_size();
        if needed > free {
            return Err(HistoryError::NodeFull { seq, free, needed });
        }
        self.extra_offset -= interval.extra_size();
        self.intervals.push(interval);
        Ok(())
    }

    fn close(&mut self, seq: u32, start: Timestamp, end: Timestamp) -> Result<(), HistoryError> {
        if self.end.is_some() {
            return Err(HistoryError::NodeClosed { seq });
        }
        debug_assert!(end >= start, "node {seq} closed at {end} before its start {start}");
        // stable: equal end times keep their insertion order
        self.intervals.sort_by_key(Interval::end);
        debug_assert!(self.intervals.last().map_or(true, |i| i.end() <= end));
        self.end = Some(end);
        Ok(())
    }

    /// Index of the first interval whose end is `>= t`.
    ///
    /// With intervals sorted by end time this is the first element of any run
    /// of equal end times, so every duplicate is scanned.
    fn start_index_for(&self, t: Timestamp) -> usize {
        self.intervals.partition_point(|i| i.end() < t)
    }

    fn query_at_time(&self, t: Timestamp, out: &mut BTreeMap<u32, Interval>) {
        if self.end.is_some() {
            let from = self.start_index_for(t);
            // end >= t holds for everything from here on
            for interval in &self.intervals[from..] {
                if interval.start() <= t {
                    out.insert(interval.attribute(), interval.clone());
                }
            }
        } else {
            for interval in self.intervals.iter().filter(|i| i.contains(t)) {
                out.insert(interval.attribute(), interval.clone());
            }
        }
    }

    fn query_attribute_at_time(&self, attribute: u32, t: Timestamp) -> Option<Interval> {
        let from = if self.end.is_some() {
            self.start_index_for(t)
        } else {
            0
        };
        self.intervals[from..]
            .iter()
            .find(|i| i.attribute() == attribute && i.contains(t))
            .cloned()
    }

    pub(crate) fn write_common_header<W: Write>(
        &self,
        w: &mut W,
        node_type: NodeType,
        seq: u32,
        start: Timestamp,
    ) -> Result<(), HistoryError> {
        let end = self.end.ok_or(HistoryError::NodeOpen { seq })?;
        w.write_u8(node_type as u8)?;
        w.write_i64::<LittleEndian>(start)?;
        w.write_i64::<LittleEndian>(end)?;
        w.write_u32::<LittleEndian>(seq)?;
        w.write_i32::<LittleEndian>(self.parent.map_or(NO_PARENT, |p| p as i32))?;
        w.write_u32::<LittleEndian>(self.intervals.len() as u32)?;
        w.write_u32::<LittleEndian>(self.extra_offset as u32)?;
        w.write_u8(1)?;
        Ok(())
    }

    /// Writes the data section and extra area after a header of
    /// `header_size` bytes.
    pub(crate) fn write_intervals(&self, block: &mut [u8], header_size: usize) -> Result<(), HistoryError> {
        let mut extra_end = block.len();
        for (i, interval) in self.intervals.iter().enumerate() {
            extra_end -= interval.write_to(block, header_size + i * DATA_ENTRY_SIZE, extra_end)?;
        }
        debug_assert_eq!(extra_end, self.extra_offset);
        Ok(())
    }
}
