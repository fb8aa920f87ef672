use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use interval::Timestamp;
use parking_lot::RwLock;

use super::{CommonHeader, NodeBody, NodeType, COMMON_HEADER_SIZE};
use crate::{HistoryError, HtConfig};

/// Pointer from a Core node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub seq: u32,
    pub start: Timestamp,
}

/// The node kind holding both intervals and child pointers.
///
/// The child arrays are reserved at full `max_children` size in the header
/// whatever the current child count, so the header size is fixed per tree.
#[derive(Debug)]
pub struct CoreNode {
    seq: u32,
    start: Timestamp,
    block_size: usize,
    max_children: usize,
    pub(super) state: RwLock<CoreState>,
}

#[derive(Debug)]
pub(super) struct CoreState {
    pub(super) body: NodeBody,
    /// Ascending by start time.
    pub(super) children: Vec<ChildRef>,
}

impl CoreNode {
    pub fn new(config: &HtConfig, seq: u32, parent: Option<u32>, start: Timestamp) -> Self {
        let block_size = config.block_size() as usize;
        Self {
            seq,
            start,
            block_size,
            max_children: config.max_children() as usize,
            state: RwLock::new(CoreState {
                body: NodeBody::new(parent, block_size),
                children: Vec::new(),
            }),
        }
    }

    /// Common header + child count (u32) + `max_children` child sequence
    /// numbers (u32) + `max_children` child start times (i64).
    pub fn header_size(max_children: usize) -> usize {
        COMMON_HEADER_SIZE + 4 + max_children * (4 + 8)
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn max_children(&self) -> usize {
        self.max_children
    }

    pub(super) fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn child_count(&self) -> usize {
        self.state.read().children.len()
    }

    pub fn children(&self) -> Vec<ChildRef> {
        self.state.read().children.clone()
    }

    pub fn child(&self, index: usize) -> Option<ChildRef> {
        self.state.read().children.get(index).copied()
    }

    /// Sequence number of the most recently linked child.
    pub fn latest_child(&self) -> Option<u32> {
        self.state.read().children.last().map(|c| c.seq)
    }

    /// Appends a child pointer.
    ///
    /// # Errors
    ///
    /// [`HistoryError::TooManyChildren`] when already at `max_children`, and
    /// [`HistoryError::NodeClosed`] once this node is closed.
    pub fn link_child(&self, seq: u32, start: Timestamp) -> Result<(), HistoryError> {
        let mut state = self.state.write();
        if state.body.end.is_some() {
            return Err(HistoryError::NodeClosed { seq: self.seq });
        }
        if state.children.len() >= self.max_children {
            return Err(HistoryError::TooManyChildren {
                seq: self.seq,
                max: self.max_children,
            });
        }
        debug_assert!(state.children.last().map_or(true, |c| c.start < start));
        state.children.push(ChildRef { seq, start });
        Ok(())
    }

    /// The last child whose start is `<= t`, i.e. the child whose time range
    /// holds `t`.
    pub fn child_containing(&self, t: Timestamp) -> Option<u32> {
        let state = self.state.read();
        let mut found = None;
        for child in &state.children {
            if child.start > t {
                break;
            }
            found = Some(child.seq);
        }
        found
    }

    pub(super) fn write_to(&self, block: &mut [u8]) -> Result<(), HistoryError> {
        let header_size = Self::header_size(self.max_children);
        let state = self.state.read();

        let mut header: &mut [u8] = &mut block[..header_size];
        state
            .body
            .write_common_header(&mut header, NodeType::Core, self.seq, self.start)?;

        header.write_u32::<LittleEndian>(state.children.len() as u32)?;
        for i in 0..self.max_children {
            let seq = state.children.get(i).map_or(0, |c| c.seq);
            header.write_u32::<LittleEndian>(seq)?;
        }
        for i in 0..self.max_children {
            let start = state.children.get(i).map_or(0, |c| c.start);
            header.write_i64::<LittleEndian>(start)?;
        }

        state.body.write_intervals(block, header_size)
    }

    /// Reads the Core-specific header from `buf` (positioned right after the
    /// common header) and the intervals from `block`.
    pub(super) fn read_from(
        config: &HtConfig,
        common: &CommonHeader,
        buf: &mut &[u8],
        block: &[u8],
    ) -> Result<Self, HistoryError> {
        let max_children = config.max_children() as usize;
        let child_count = buf.read_u32::<LittleEndian>()? as usize;
        if child_count > max_children {
            return Err(HistoryError::CorruptFormat(format!(
                "node {} claims {child_count} children, at most {max_children} allowed",
                common.seq
            )));
        }

        let mut seqs = Vec::with_capacity(max_children);
        for _ in 0..max_children {
            seqs.push(buf.read_u32::<LittleEndian>()?);
        }
        let mut starts = Vec::with_capacity(max_children);
        for _ in 0..max_children {
            starts.push(buf.read_i64::<LittleEndian>()?);
        }
        let children = seqs
            .into_iter()
            .zip(starts)
            .take(child_count)
            .map(|(seq, start)| ChildRef { seq, start })
            .collect();

        let body = NodeBody::read(common, block, Self::header_size(max_children))?;

        Ok(Self {
            seq: common.seq,
            start: common.start,
            block_size: block.len(),
            max_children,
            state: RwLock::new(CoreState { body, children }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use interval::{Interval, Value};
    use std::collections::BTreeMap;

    fn config(block_size: u32, max_children: u32) -> HtConfig {
        HtConfig::with_params("/tmp/unused.ht", block_size, max_children, 0, 0).unwrap()
    }

    fn iv(start: i64, end: i64, attribute: u32, value: Value) -> Interval {
        Interval::new(start, end, attribute, value).unwrap()
    }

    fn core(config: &HtConfig, seq: u32, start: i64) -> Node {
        Node::Core(CoreNode::new(config, seq, None, start))
    }

    // -------------------- Free space --------------------

    #[test]
    fn empty_node_free_space() {
        let c = config(256, 2);
        let node = core(&c, 0, 0);
        assert_eq!(node.free_space(), 256 - 62);
        assert_eq!(node.free_space(), c.node_capacity());
    }

    #[test]
    fn exact_fit_then_full() -> anyhow::Result<()> {
        let c = config(256, 2);
        let node = core(&c, 0, 0);
        node.add_interval(iv(0, 5, 1, Value::Int(1)))?;
        let free = node.free_space();
        assert_eq!(free, 194 - 25);

        // size byte + payload + terminator + data entry == free
        let exact = iv(0, 6, 2, Value::String("s".repeat(free - 27)));
        assert_eq!(exact.serialized_size(), free);
        node.add_interval(exact)?;
        assert_eq!(node.free_space(), 0);

        let err = node.add_interval(iv(0, 7, 3, Value::Null)).unwrap_err();
        assert!(matches!(err, HistoryError::NodeFull { free: 0, needed: 25, .. }));
        Ok(())
    }

    // -------------------- Children --------------------

    #[test]
    fn link_child_respects_max_children() -> anyhow::Result<()> {
        let c = config(256, 2);
        let node = CoreNode::new(&c, 0, None, 0);
        node.link_child(1, 0)?;
        node.link_child(2, 50)?;
        let err = node.link_child(3, 80).unwrap_err();
        assert!(matches!(err, HistoryError::TooManyChildren { seq: 0, max: 2 }));
        assert_eq!(node.latest_child(), Some(2));
        Ok(())
    }

    #[test]
    fn child_containing_picks_last_start_at_or_before() -> anyhow::Result<()> {
        let c = config(1024, 4);
        let node = CoreNode::new(&c, 0, None, 0);
        node.link_child(1, 0)?;
        node.link_child(2, 101)?;
        node.link_child(3, 201)?;
        assert_eq!(node.child_containing(0), Some(1));
        assert_eq!(node.child_containing(100), Some(1));
        assert_eq!(node.child_containing(101), Some(2));
        assert_eq!(node.child_containing(5000), Some(3));
        assert_eq!(node.child_containing(-1), None);
        Ok(())
    }

    // -------------------- Close / query --------------------

    #[test]
    fn close_is_irreversible() -> anyhow::Result<()> {
        let c = config(256, 2);
        let node = core(&c, 4, 0);
        assert_eq!(node.end(), None);
        node.close(10)?;
        assert_eq!(node.end(), Some(10));
        assert!(matches!(node.close(11), Err(HistoryError::NodeClosed { seq: 4 })));
        assert!(matches!(
            node.add_interval(iv(0, 1, 0, Value::Null)),
            Err(HistoryError::NodeClosed { seq: 4 })
        ));
        Ok(())
    }

    #[test]
    fn duplicate_end_times_are_all_found() -> anyhow::Result<()> {
        let c = config(1024, 2);
        let node = core(&c, 0, 0);
        node.add_interval(iv(0, 5, 10, Value::Int(0)))?;
        node.add_interval(iv(1, 20, 1, Value::Int(1)))?;
        node.add_interval(iv(6, 20, 2, Value::Int(2)))?;
        node.add_interval(iv(0, 8, 11, Value::Int(0)))?;
        node.add_interval(iv(15, 20, 3, Value::Int(3)))?;
        node.add_interval(iv(9, 30, 12, Value::Int(0)))?;
        node.close(30)?;

        let mut found = BTreeMap::new();
        node.query_at_time(20, &mut found);
        let attrs: Vec<u32> = found.keys().copied().collect();
        assert_eq!(attrs, vec![1, 2, 3, 12]);

        for attr in [1, 2, 3] {
            let hit = node.query_attribute_at_time(attr, 20).unwrap();
            assert_eq!(hit.end(), 20);
        }
        Ok(())
    }

    #[test]
    fn open_node_answers_queries() -> anyhow::Result<()> {
        let c = config(1024, 2);
        let node = core(&c, 0, 0);
        node.add_interval(iv(0, 50, 1, Value::Int(1)))?;
        node.add_interval(iv(0, 10, 2, Value::Int(2)))?;

        let mut found = BTreeMap::new();
        node.query_at_time(30, &mut found);
        assert_eq!(found.len(), 1);
        assert!(node.query_attribute_at_time(2, 10).is_some());
        assert!(node.query_attribute_at_time(2, 11).is_none());
        Ok(())
    }

    // -------------------- Block encoding --------------------

    #[test]
    fn closed_node_reads_back() -> anyhow::Result<()> {
        let c = config(512, 3);
        let node = CoreNode::new(&c, 7, Some(2), 100);
        node.link_child(8, 100)?;
        node.link_child(9, 151)?;
        let node = Node::Core(node);
        node.add_interval(iv(120, 190, 1, Value::from("idle")))?;
        node.add_interval(iv(100, 150, 2, Value::Long(1 << 40)))?;
        node.add_interval(iv(140, 160, 3, Value::Double(-0.25)))?;
        node.close(200)?;

        let mut block = vec![0u8; 512];
        node.write_to(&mut block)?;
        let back = Node::read_from(&block, &c)?;

        assert_eq!(back.seq(), 7);
        assert_eq!(back.start(), 100);
        assert_eq!(back.end(), Some(200));
        assert_eq!(back.parent(), Some(2));
        assert_eq!(back.free_space(), node.free_space());
        assert_eq!(back.intervals(), node.intervals());
        let core = back.as_core().unwrap();
        assert_eq!(
            core.children(),
            vec![ChildRef { seq: 8, start: 100 }, ChildRef { seq: 9, start: 151 }]
        );
        Ok(())
    }

    #[test]
    fn open_node_cannot_be_written() {
        let c = config(256, 2);
        let node = core(&c, 3, 0);
        let mut block = vec![0u8; 256];
        assert!(matches!(node.write_to(&mut block), Err(HistoryError::NodeOpen { seq: 3 })));
    }

    #[test]
    fn unknown_node_type_is_corrupt() -> anyhow::Result<()> {
        let c = config(256, 2);
        let node = core(&c, 0, 0);
        node.close(1)?;
        let mut block = vec![0u8; 256];
        node.write_to(&mut block)?;
        block[0] = 9;
        assert!(matches!(Node::read_from(&block, &c), Err(HistoryError::CorruptFormat(_))));
        Ok(())
    }

    #[test]
    fn unknown_value_tag_is_corrupt() -> anyhow::Result<()> {
        let c = config(256, 2);
        let node = core(&c, 0, 0);
        node.add_interval(iv(0, 1, 0, Value::Int(3)))?;
        node.close(1)?;
        let mut block = vec![0u8; 256];
        node.write_to(&mut block)?;
        // type tag of the first data entry
        block[62 + 20] = 0x42;
        let err = Node::read_from(&block, &c).unwrap_err();
        assert!(err.is_rebuild_needed());
        Ok(())
    }

    #[test]
    fn display_summary() -> anyhow::Result<()> {
        let c = config(256, 2);
        let node = core(&c, 5, 10);
        assert_eq!(node.to_string(), "Node #5, 0 children, 0 intervals (0% used), [10 - ...]");
        node.close(20)?;
        assert!(node.to_string().ends_with("[10 - 20]"));
        Ok(())
    }
}
