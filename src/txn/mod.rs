//! Transactions and the transaction manager.

pub mod cursor;
pub mod index;

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::error::{BurrowError, BurrowResult, ErrorKind};
use crate::flags::TxnFlags;
use index::OpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

pub struct TransactionState {
    pub id: u64,
    pub name: Option<String>,
    pub flags: TxnFlags,
    pub status: TxnStatus,

    /// op chain across all databases, ordered by lsn
    pub oldest_op: Option<OpId>,
    pub newest_op: Option<OpId>,

    /// a transaction cannot commit or abort while cursors reference it
    pub cursor_refcount: u32,
    pub op_counter: u32,
    pub accum_data_size: usize,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        self.status == TxnStatus::Active
    }

    pub fn is_committed(&self) -> bool {
        self.status == TxnStatus::Committed
    }

    pub fn is_aborted(&self) -> bool {
        self.status == TxnStatus::Aborted
    }

    pub fn is_temporary(&self) -> bool {
        self.flags.contains(TxnFlags::TEMPORARY)
    }
}

// flush the committed queue when any of these thresholds is crossed
const FLUSH_TXN_THRESHOLD: usize = 64;
const FLUSH_OPS_THRESHOLD: usize = FLUSH_TXN_THRESHOLD * 20;
const FLUSH_BYTES_THRESHOLD: usize = 1024 * 1024;

/// Owns every outstanding transaction, assigns ids and lsns, and keeps
/// the FIFO of transactions awaiting their flush into the B+tree.
pub struct TxnManager {
    txns: HashMap<u64, TransactionState>,
    /// begin order; the head is the oldest outstanding transaction
    queue: VecDeque<u64>,
    names: HashMap<String, u64>,

    next_txn_id: u64,
    next_lsn: u64,

    queued_txn: usize,
    queued_ops: usize,
    queued_bytes: usize,

    txn_threshold: usize,
    ops_threshold: usize,
    bytes_threshold: usize,

    pub txns_begun: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
}

impl TxnManager {
    pub fn new(flush_when_committed: bool) -> Self {
        let (t, o, b) = if flush_when_committed {
            (0, 0, 0)
        } else {
            (
                FLUSH_TXN_THRESHOLD,
                FLUSH_OPS_THRESHOLD,
                FLUSH_BYTES_THRESHOLD,
            )
        };
        Self {
            txns: HashMap::new(),
            queue: VecDeque::new(),
            names: HashMap::new(),
            next_txn_id: 1,
            next_lsn: 1,
            queued_txn: 0,
            queued_ops: 0,
            queued_bytes: 0,
            txn_threshold: t,
            ops_threshold: o,
            bytes_threshold: b,
            txns_begun: 0,
            txns_committed: 0,
            txns_aborted: 0,
        }
    }

    /// Every mutating operation draws a strictly increasing lsn.
    pub fn next_lsn(&mut self) -> u64 {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        lsn
    }

    pub fn highest_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    /// Fast-forward the counter during recovery so fresh operations
    /// stay above every journaled lsn.
    pub fn restore_lsn(&mut self, lsn: u64) {
        if lsn >= self.next_lsn {
            self.next_lsn = lsn + 1;
        }
    }

    pub fn begin(&mut self, name: Option<&str>, flags: TxnFlags) -> BurrowResult<u64> {
        if let Some(name) = name {
            if self.names.contains_key(name) {
                return Err(BurrowError::new(
                    ErrorKind::InvalidParameter,
                    &format!("transaction name {:?} is already in use", name),
                ));
            }
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txns.insert(
            id,
            TransactionState {
                id,
                name: name.map(str::to_string),
                flags,
                status: TxnStatus::Active,
                oldest_op: None,
                newest_op: None,
                cursor_refcount: 0,
                op_counter: 0,
                accum_data_size: 0,
            },
        );
        if let Some(name) = name {
            self.names.insert(name.to_string(), id);
        }
        self.queue.push_back(id);
        self.txns_begun += 1;
        debug!("begin txn, id: {}, flags: {:?}", id, flags);
        Ok(id)
    }

    pub fn state(&self, id: u64) -> BurrowResult<&TransactionState> {
        self.txns
            .get(&id)
            .ok_or_else(|| BurrowError::new(ErrorKind::InvalidParameter, "unknown transaction"))
    }

    pub fn state_mut(&mut self, id: u64) -> BurrowResult<&mut TransactionState> {
        self.txns
            .get_mut(&id)
            .ok_or_else(|| BurrowError::new(ErrorKind::InvalidParameter, "unknown transaction"))
    }

    pub fn get(&self, id: u64) -> Option<&TransactionState> {
        self.txns.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut TransactionState> {
        self.txns.get_mut(&id)
    }

    pub fn active_count(&self) -> usize {
        self.txns.values().filter(|t| t.is_active()).count()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn head(&self) -> Option<u64> {
        self.queue.front().copied()
    }

    /// Snapshot of the outstanding-transaction queue, oldest first.
    pub fn outstanding_ids(&self) -> Vec<u64> {
        self.queue.iter().copied().collect()
    }

    /// Remove the queue head and drop its state.
    pub fn pop_head(&mut self) {
        if let Some(id) = self.queue.pop_front() {
            if let Some(txn) = self.txns.remove(&id) {
                if let Some(name) = txn.name {
                    self.names.remove(&name);
                }
            }
        }
    }

    pub fn note_committed(&mut self, id: u64) {
        let (ops, bytes) = {
            let txn = &self.txns[&id];
            (txn.op_counter as usize, txn.accum_data_size)
        };
        self.queued_txn += 1;
        self.queued_ops += ops;
        self.queued_bytes += bytes;
        self.txns_committed += 1;
    }

    pub fn note_aborted(&mut self) {
        self.queued_txn += 1;
        self.txns_aborted += 1;
    }

    pub fn note_flushed(&mut self, ops: usize, bytes: usize) {
        self.queued_txn = self.queued_txn.saturating_sub(1);
        self.queued_ops = self.queued_ops.saturating_sub(ops);
        self.queued_bytes = self.queued_bytes.saturating_sub(bytes);
    }

    pub fn should_flush(&self) -> bool {
        self.queued_txn > self.txn_threshold
            || self.queued_ops > self.ops_threshold
            || self.queued_bytes > self.bytes_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_is_strictly_increasing() {
        let mut mgr = TxnManager::new(false);
        let a = mgr.next_lsn();
        let b = mgr.next_lsn();
        let c = mgr.next_lsn();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_begin_assigns_monotone_ids() {
        let mut mgr = TxnManager::new(false);
        let a = mgr.begin(None, TxnFlags::empty()).unwrap();
        let b = mgr.begin(None, TxnFlags::empty()).unwrap();
        assert!(b > a);
        assert_eq!(mgr.head(), Some(a));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut mgr = TxnManager::new(false);
        mgr.begin(Some("loader"), TxnFlags::empty()).unwrap();
        let err = mgr.begin(Some("loader"), TxnFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_flush_when_committed_collapses_thresholds() {
        let mut mgr = TxnManager::new(true);
        let id = mgr.begin(None, TxnFlags::empty()).unwrap();
        mgr.state_mut(id).unwrap().status = TxnStatus::Committed;
        mgr.note_committed(id);
        assert!(mgr.should_flush());

        let mut lazy = TxnManager::new(false);
        let id = lazy.begin(None, TxnFlags::empty()).unwrap();
        lazy.state_mut(id).unwrap().status = TxnStatus::Committed;
        lazy.note_committed(id);
        assert!(!lazy.should_flush());
    }
}
