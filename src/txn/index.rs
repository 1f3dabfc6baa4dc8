//! The per-database overlay of pending operations: one `TxnNode` per
//! modified key, each chaining its `TxnOp`s newest-to-oldest, plus the
//! ordered index over the nodes.
//!
//! Nodes and ops live in arenas and reference each other by index; the
//! doubly-linked chains (per node and per transaction) and the per-op
//! cursor lists are positions, not ownership.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::TransactionState;
use crate::cursor::CursorId;
use crate::flags::{FindFlags, InsertFlags};
use crate::key::{ApproxMatch, IndexKey, KeyType};

pub type NodeId = usize;
pub type OpId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Nop,
    Insert,
    InsertOverwrite,
    InsertDuplicate,
    Erase,
}

impl OpKind {
    pub fn is_insert(&self) -> bool {
        matches!(
            self,
            OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate
        )
    }
}

pub struct TxnOp {
    pub txn_id: u64,
    pub node: NodeId,
    pub kind: OpKind,
    /// the flags of the originating insert/erase call
    pub orig_flags: InsertFlags,
    pub lsn: u64,
    /// 1-based duplicate index this op refers to; 0 = the key as a whole
    pub referenced_dup: u32,
    pub record: Bytes,
    pub flushed: bool,

    pub node_next: Option<OpId>,
    pub node_prev: Option<OpId>,
    pub txn_next: Option<OpId>,
    pub txn_prev: Option<OpId>,

    /// cursors coupled to this op
    pub cursor_list: Vec<CursorId>,
}

pub struct TxnNode {
    pub db_id: u16,
    pub key: Bytes,
    pub oldest_op: Option<OpId>,
    pub newest_op: Option<OpId>,
}

/// Arena for nodes and ops of every database in the environment. A
/// transaction's op chain may span databases, so the arena is shared.
pub struct TxnStore {
    nodes: Vec<Option<TxnNode>>,
    node_free: Vec<NodeId>,
    ops: Vec<Option<TxnOp>>,
    op_free: Vec<OpId>,
}

impl TxnStore {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_free: Vec::new(),
            ops: Vec::new(),
            op_free: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &TxnNode {
        self.nodes[id].as_ref().expect("dangling txn node id")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TxnNode {
        self.nodes[id].as_mut().expect("dangling txn node id")
    }

    pub fn op(&self, id: OpId) -> &TxnOp {
        self.ops[id].as_ref().expect("dangling txn op id")
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut TxnOp {
        self.ops[id].as_mut().expect("dangling txn op id")
    }

    pub fn new_node(&mut self, db_id: u16, key: Bytes) -> NodeId {
        let node = TxnNode {
            db_id,
            key,
            oldest_op: None,
            newest_op: None,
        };
        match self.node_free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    pub fn free_node(&mut self, id: NodeId) {
        debug_assert!(self.node(id).oldest_op.is_none());
        self.nodes[id] = None;
        self.node_free.push(id);
    }

    /// Append an operation to a node's chain and to the transaction's
    /// chain; both chains stay ordered by lsn.
    pub fn append_op(
        &mut self,
        node_id: NodeId,
        txn: &mut TransactionState,
        kind: OpKind,
        orig_flags: InsertFlags,
        lsn: u64,
        record: Bytes,
    ) -> OpId {
        let record_size = record.len();
        let op = TxnOp {
            txn_id: txn.id,
            node: node_id,
            kind,
            orig_flags,
            lsn,
            referenced_dup: 0,
            record,
            flushed: false,
            node_next: None,
            node_prev: self.node(node_id).newest_op,
            txn_next: None,
            txn_prev: txn.newest_op,
            cursor_list: Vec::new(),
        };
        let op_id = match self.op_free.pop() {
            Some(id) => {
                self.ops[id] = Some(op);
                id
            }
            None => {
                self.ops.push(Some(op));
                self.ops.len() - 1
            }
        };

        // node chain
        if let Some(prev) = self.node(node_id).newest_op {
            self.op_mut(prev).node_next = Some(op_id);
        } else {
            self.node_mut(node_id).oldest_op = Some(op_id);
        }
        self.node_mut(node_id).newest_op = Some(op_id);

        // transaction chain
        if let Some(prev) = txn.newest_op {
            self.op_mut(prev).txn_next = Some(op_id);
        } else {
            txn.oldest_op = Some(op_id);
        }
        txn.newest_op = Some(op_id);
        txn.op_counter += 1;
        txn.accum_data_size += record_size + self.node(node_id).key.len();

        op_id
    }

    /// Unlink an op from both chains and release it. Returns the node id
    /// when the node lost its last op; the caller then removes the node
    /// from the index and frees it.
    pub fn destroy_op(&mut self, op_id: OpId, txn: &mut TransactionState) -> Option<NodeId> {
        debug_assert!(self.op(op_id).cursor_list.is_empty());

        let (node_id, node_prev, node_next, txn_prev, txn_next) = {
            let op = self.op(op_id);
            (op.node, op.node_prev, op.node_next, op.txn_prev, op.txn_next)
        };

        match node_prev {
            Some(prev) => self.op_mut(prev).node_next = node_next,
            None => self.node_mut(node_id).oldest_op = node_next,
        }
        match node_next {
            Some(next) => self.op_mut(next).node_prev = node_prev,
            None => self.node_mut(node_id).newest_op = node_prev,
        }

        match txn_prev {
            Some(prev) => self.op_mut(prev).txn_next = txn_next,
            None => txn.oldest_op = txn_next,
        }
        match txn_next {
            Some(next) => self.op_mut(next).txn_prev = txn_prev,
            None => txn.newest_op = txn_prev,
        }

        self.ops[op_id] = None;
        self.op_free.push(op_id);

        if self.node(node_id).oldest_op.is_none() {
            Some(node_id)
        } else {
            None
        }
    }
}

/// The ordered dictionary over a database's pending keys.
pub struct TxnIndex {
    key_type: KeyType,
    map: BTreeMap<IndexKey, NodeId>,
}

impl TxnIndex {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            map: BTreeMap::new(),
        }
    }

    fn wrap(&self, key: &[u8]) -> IndexKey {
        IndexKey::new(self.key_type, Bytes::copy_from_slice(key))
    }

    pub fn store(&mut self, key: &[u8], node: NodeId) {
        self.map.insert(self.wrap(key), node);
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.map.remove(&self.wrap(key));
    }

    /// Lookup with the full match-flag range. The returned tag reports
    /// whether the hit was exact or a neighbour in the requested
    /// direction.
    pub fn get(&self, key: &[u8], flags: FindFlags) -> Option<(NodeId, ApproxMatch)> {
        let wrapped = self.wrap(key);
        if flags.contains(FindFlags::EXACT) || flags.is_empty() {
            if let Some(&node) = self.map.get(&wrapped) {
                return Some((node, ApproxMatch::Exact));
            }
        }
        if flags.contains(FindFlags::LT) {
            if let Some((_, &node)) = self.map.range(..wrapped.clone()).next_back() {
                return Some((node, ApproxMatch::Lt));
            }
        }
        if flags.contains(FindFlags::GT) {
            use std::ops::Bound;
            if let Some((_, &node)) = self
                .map
                .range((Bound::Excluded(wrapped), Bound::Unbounded))
                .next()
            {
                return Some((node, ApproxMatch::Gt));
            }
        }
        None
    }

    pub fn first(&self) -> Option<NodeId> {
        self.map.values().next().copied()
    }

    pub fn last(&self) -> Option<NodeId> {
        self.map.values().next_back().copied()
    }

    pub fn next_sibling(&self, key: &[u8]) -> Option<NodeId> {
        use std::ops::Bound;
        self.map
            .range((Bound::Excluded(self.wrap(key)), Bound::Unbounded))
            .next()
            .map(|(_, &n)| n)
    }

    pub fn previous_sibling(&self, key: &[u8]) -> Option<NodeId> {
        self.map.range(..self.wrap(key)).next_back().map(|(_, &n)| n)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.map.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::TxnFlags;
    use crate::txn::TxnStatus;

    fn txn(id: u64) -> TransactionState {
        TransactionState {
            id,
            name: None,
            flags: TxnFlags::empty(),
            status: TxnStatus::Active,
            oldest_op: None,
            newest_op: None,
            cursor_refcount: 0,
            op_counter: 0,
            accum_data_size: 0,
        }
    }

    #[test]
    fn test_append_links_both_chains() {
        let mut store = TxnStore::new();
        let mut t = txn(1);
        let node_a = store.new_node(0, Bytes::from_static(b"a"));
        let node_b = store.new_node(0, Bytes::from_static(b"b"));

        let op1 = store.append_op(node_a, &mut t, OpKind::Insert, InsertFlags::empty(), 10, Bytes::new());
        let op2 = store.append_op(node_b, &mut t, OpKind::Insert, InsertFlags::empty(), 11, Bytes::new());
        let op3 = store.append_op(node_a, &mut t, OpKind::Erase, InsertFlags::empty(), 12, Bytes::new());

        assert_eq!(store.node(node_a).oldest_op, Some(op1));
        assert_eq!(store.node(node_a).newest_op, Some(op3));
        assert_eq!(store.op(op1).node_next, Some(op3));
        assert_eq!(store.op(op3).node_prev, Some(op1));

        assert_eq!(t.oldest_op, Some(op1));
        assert_eq!(t.newest_op, Some(op3));
        assert_eq!(store.op(op1).txn_next, Some(op2));
        assert_eq!(store.op(op2).txn_next, Some(op3));
        assert_eq!(t.op_counter, 3);
    }

    #[test]
    fn test_destroy_op_reports_empty_node() {
        let mut store = TxnStore::new();
        let mut t = txn(1);
        let node = store.new_node(0, Bytes::from_static(b"k"));
        let op1 = store.append_op(node, &mut t, OpKind::Insert, InsertFlags::empty(), 1, Bytes::new());
        let op2 = store.append_op(node, &mut t, OpKind::Erase, InsertFlags::empty(), 2, Bytes::new());

        assert_eq!(store.destroy_op(op1, &mut t), None);
        assert_eq!(store.node(node).oldest_op, Some(op2));
        assert_eq!(store.destroy_op(op2, &mut t), Some(node));
        assert_eq!(t.oldest_op, None);
        assert_eq!(t.newest_op, None);
    }

    #[test]
    fn test_index_match_flags() {
        let mut store = TxnStore::new();
        let mut index = TxnIndex::new(KeyType::Binary);
        let mut t = txn(1);
        for key in [&b"b"[..], &b"d"[..], &b"f"[..]] {
            let node = store.new_node(0, Bytes::copy_from_slice(key));
            store.append_op(node, &mut t, OpKind::Insert, InsertFlags::empty(), 1, Bytes::new());
            index.store(key, node);
        }

        let exact = index.get(b"d", FindFlags::EXACT).unwrap();
        assert_eq!(exact.1, ApproxMatch::Exact);

        let (node, tag) = index.get(b"c", FindFlags::LEQ).unwrap();
        assert_eq!(tag, ApproxMatch::Lt);
        assert_eq!(&store.node(node).key[..], b"b");

        let (node, tag) = index.get(b"c", FindFlags::GEQ).unwrap();
        assert_eq!(tag, ApproxMatch::Gt);
        assert_eq!(&store.node(node).key[..], b"d");

        assert!(index.get(b"a", FindFlags::LT).is_none());
        assert!(index.get(b"g", FindFlags::GT).is_none());
    }

    #[test]
    fn test_sibling_traversal() {
        let mut store = TxnStore::new();
        let mut index = TxnIndex::new(KeyType::Binary);
        let mut t = txn(1);
        for key in [&b"b"[..], &b"d"[..]] {
            let node = store.new_node(0, Bytes::copy_from_slice(key));
            store.append_op(node, &mut t, OpKind::Insert, InsertFlags::empty(), 1, Bytes::new());
            index.store(key, node);
        }
        let first = index.first().unwrap();
        assert_eq!(&store.node(first).key[..], b"b");
        let next = index.next_sibling(b"b").unwrap();
        assert_eq!(&store.node(next).key[..], b"d");
        assert!(index.next_sibling(b"d").is_none());
        let prev = index.previous_sibling(b"d").unwrap();
        assert_eq!(&store.node(prev).key[..], b"b");
    }
}
