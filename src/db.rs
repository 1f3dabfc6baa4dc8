//! Per-database core logic: the visibility walk over pending operations,
//! write-conflict checks, the transactional insert/find/erase paths, the
//! commit queue flush, and journal-driven recovery.

use bytes::Bytes;
use log::debug;

use crate::btree::BtreeContext;
use crate::cursor::{CoupledSide, CursorId, DupeLine, LastOp};
use crate::env::EnvInner;
use crate::error::{BurrowError, BurrowResult, DbResult, ErrorKind};
use crate::flags::{DbFlags, FindFlags, InsertFlags, TxnFlags};
use crate::journal::{RecoveredOp, RecoveredOpKind};
use crate::key::{ApproxMatch, KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED};
use crate::txn::index::{NodeId, OpId, OpKind, TxnStore};
use crate::txn::TxnManager;
use crate::txn::cursor as txn_cursor;

/// How a visibility walk treats an op of a foreign active transaction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictMode {
    /// point reads and writes: report `TxnConflict`
    Error,
    /// aggregate reads: the op is simply not visible yet
    Ignore,
}

/// Walk one node's ops newest to oldest and classify the key's pending
/// state for `observer`.
pub(crate) enum NodeState {
    /// no decisive visible op; fall through to the B+tree
    Undecided,
    Exists(OpId),
    Erased,
    Conflict,
}

pub(crate) fn node_state(
    txn_store: &TxnStore,
    mgr: &TxnManager,
    node: NodeId,
    observer: Option<u64>,
) -> NodeState {
    let mut current = txn_store.node(node).newest_op;
    while let Some(op_id) = current {
        let op = txn_store.op(op_id);
        let optxn = mgr.get(op.txn_id);
        let aborted = optxn.map(|t| t.is_aborted()).unwrap_or(false);
        let committed = optxn.map(|t| t.is_committed()).unwrap_or(true);

        if op.flushed || aborted {
            // skip
        } else if committed || Some(op.txn_id) == observer {
            match op.kind {
                OpKind::Erase => return NodeState::Erased,
                OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate => {
                    return NodeState::Exists(op_id)
                }
                OpKind::Nop => {}
            }
        } else if observer.is_none() {
            // a non-transactional observer reads committed state;
            // uncommitted foreign work is simply not visible yet
        } else {
            return NodeState::Conflict;
        }
        current = op.node_prev;
    }
    NodeState::Undecided
}

impl EnvInner {
    // ------------------------------------------------------------------
    // conflict checks
    // ------------------------------------------------------------------

    /// Walk the node newest to oldest before appending an insert op.
    fn check_insert_conflicts(
        &mut self,
        name: u16,
        txn: u64,
        node: NodeId,
        key: &[u8],
        flags: InsertFlags,
    ) -> DbResult {
        match node_state(&self.txn_store, &self.txn, node, Some(txn)) {
            NodeState::Erased => return Ok(()),
            NodeState::Exists(_) => {
                return if flags.contains(InsertFlags::OVERWRITE) || flags.is_duplicate() {
                    Ok(())
                } else {
                    Err(BurrowError::of(ErrorKind::DuplicateKey))
                };
            }
            NodeState::Conflict => return Err(BurrowError::of(ErrorKind::TxnConflict)),
            NodeState::Undecided => {}
        }

        // nothing pending; flushed state is a plain btree lookup, which
        // fills the changeset as a side effect
        if flags.contains(InsertFlags::OVERWRITE) || flags.is_duplicate() {
            return Ok(());
        }
        let result = self.btree_find_exact_exists(name, key)?;
        self.store.clear_changeset();
        if result {
            Err(BurrowError::of(ErrorKind::DuplicateKey))
        } else {
            Ok(())
        }
    }

    /// Same walk for erase.
    fn check_erase_conflicts(&mut self, name: u16, txn: u64, node: NodeId, key: &[u8]) -> DbResult {
        match node_state(&self.txn_store, &self.txn, node, Some(txn)) {
            NodeState::Erased => return Err(BurrowError::of(ErrorKind::KeyNotFound)),
            NodeState::Exists(_) => return Ok(()),
            NodeState::Conflict => return Err(BurrowError::of(ErrorKind::TxnConflict)),
            NodeState::Undecided => {}
        }
        let exists = self.btree_find_exact_exists(name, key)?;
        self.store.clear_changeset();
        if exists {
            Ok(())
        } else {
            Err(BurrowError::of(ErrorKind::KeyNotFound))
        }
    }

    fn btree_find_exact_exists(&mut self, name: u16, key: &[u8]) -> BurrowResult<bool> {
        let db = self.databases.get_mut(&name).unwrap();
        let mut ctx = BtreeContext {
            store: &mut self.store,
            blobs: &mut self.blobs,
            cursors: &mut db.cursors,
        };
        match db.btree.find_position(&mut ctx, key, FindFlags::EXACT) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::KeyNotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // transactional writes
    // ------------------------------------------------------------------

    /// Get or create the node for `key`; the second value reports a
    /// fresh node (removed again if the operation fails).
    fn get_or_create_node(&mut self, name: u16, key: &[u8]) -> (NodeId, bool) {
        let db = self.databases.get_mut(&name).unwrap();
        match db.txn_index.get(key, FindFlags::EXACT) {
            Some((node, _)) => (node, false),
            None => {
                let node = self
                    .txn_store
                    .new_node(name, Bytes::copy_from_slice(key));
                db.txn_index.store(key, node);
                (node, true)
            }
        }
    }

    fn drop_node_if_created(&mut self, name: u16, node: NodeId, created: bool, key: &[u8]) {
        if created {
            let db = self.databases.get_mut(&name).unwrap();
            db.txn_index.remove(key);
            self.txn_store.free_node(node);
        }
    }

    /// Append an insert-class op for `key` under `txn`.
    pub(crate) fn insert_txn(
        &mut self,
        name: u16,
        txn: u64,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        cursor: Option<CursorId>,
    ) -> DbResult {
        let (node, created) = self.get_or_create_node(name, key);

        if let Err(e) = self.check_insert_conflicts(name, txn, node, key, flags) {
            self.drop_node_if_created(name, node, created, key);
            return Err(e);
        }

        let kind = if flags.is_duplicate() {
            OpKind::InsertDuplicate
        } else if flags.contains(InsertFlags::OVERWRITE) {
            OpKind::InsertOverwrite
        } else {
            OpKind::Insert
        };
        let lsn = self.txn.next_lsn();
        let txn_state = self.txn.get_mut(txn).expect("active transaction");
        let op = self.txn_store.append_op(
            node,
            txn_state,
            kind,
            flags,
            lsn,
            Bytes::copy_from_slice(record),
        );

        if let Some(cid) = cursor {
            let db = self.databases.get_mut(&name).unwrap();
            let dup_index = db.cursors.get(cid).dupecache_index;
            if dup_index > 0 {
                self.txn_store.op_mut(op).referenced_dup = dup_index;
            }
            txn_cursor::couple_to_op(&mut db.cursors, &mut self.txn_store, cid, op);
            self.increment_dupe_index(name, node, Some(cid), dup_index);
        }

        if self.journal_enabled() {
            let journal_flags = if flags.is_duplicate() {
                flags
            } else {
                flags | InsertFlags::OVERWRITE
            };
            if let Some(journal) = &mut self.journal {
                journal.append_insert(name, txn, key, record, journal_flags.bits(), lsn)?;
            }
        }
        Ok(())
    }

    /// Append an erase op for `key` under `txn`.
    pub(crate) fn erase_txn(
        &mut self,
        name: u16,
        txn: u64,
        key: &[u8],
        cursor: Option<CursorId>,
    ) -> DbResult {
        let cursor_dup = cursor
            .map(|cid| self.databases[&name].cursors.get(cid).dupecache_index)
            .unwrap_or(0);

        let (node, created) = self.get_or_create_node(name, key);

        // duplicate erases through a cursor skip the conflict check; the
        // duplicate was already resolved by the cursor's positioning
        if cursor_dup == 0 {
            if let Err(e) = self.check_erase_conflicts(name, txn, node, key) {
                self.drop_node_if_created(name, node, created, key);
                return Err(e);
            }
        }

        let lsn = self.txn.next_lsn();
        let txn_state = self.txn.get_mut(txn).expect("active transaction");
        let op = self.txn_store.append_op(
            node,
            txn_state,
            OpKind::Erase,
            InsertFlags::empty(),
            lsn,
            Bytes::new(),
        );
        if cursor_dup > 0 {
            self.txn_store.op_mut(op).referenced_dup = cursor_dup;
        }

        // ops of this node owned by cursors have to let go: their txn
        // side moves off, and btree cursors parked on this key go nil
        self.nil_all_cursors_in_node(name, txn, cursor, node)?;
        self.nil_all_cursors_in_btree(name, cursor, &Bytes::copy_from_slice(key))?;

        if self.journal_enabled() {
            if let Some(journal) = &mut self.journal {
                journal.append_erase(name, txn, key, cursor_dup, 0, lsn)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // transactional reads
    // ------------------------------------------------------------------

    /// The full merged lookup: pending ops first, then the B+tree, with
    /// approximate candidates of both sides reconciled.
    pub(crate) fn find_txn(
        &mut self,
        name: u16,
        txn: Option<u64>,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<(Bytes, Bytes, ApproxMatch)> {
        let key_type = self.databases[&name].btree.key_type;

        let mut exact_is_erased = false;
        let mut first_loop = true;
        let mut approximated = false;

        // find the node and walk ops; an erased key with approximate
        // matching moves to the neighbouring node and retries
        let mut candidate: Option<OpId> = None;
        let mut node_lookup = self.databases[&name].txn_index.get(key, flags);
        'retry: while let Some((node, tag)) = node_lookup {
            if tag.is_approximate() {
                approximated = true;
            }
            match node_state(&self.txn_store, &self.txn, node, txn) {
                NodeState::Conflict => return Err(BurrowError::of(ErrorKind::TxnConflict)),
                NodeState::Erased => {
                    if first_loop && !approximated {
                        exact_is_erased = true;
                    }
                    first_loop = false;
                    let node_key = self.txn_store.node(node).key.clone();
                    let db = &self.databases[&name];
                    let sibling = if flags.contains(FindFlags::LT) {
                        db.txn_index.previous_sibling(&node_key)
                    } else if flags.contains(FindFlags::GT) {
                        db.txn_index.next_sibling(&node_key)
                    } else {
                        return Err(BurrowError::of(ErrorKind::KeyNotFound));
                    };
                    approximated = true;
                    match sibling {
                        Some(next) => {
                            node_lookup = Some((next, ApproxMatch::Exact));
                            continue 'retry;
                        }
                        None => {
                            node_lookup = None;
                            break 'retry;
                        }
                    }
                }
                NodeState::Exists(op) => {
                    if !approximated {
                        // exact pending hit
                        let record = self.txn_store.op(op).record.clone();
                        return Ok((Bytes::copy_from_slice(key), record, ApproxMatch::Exact));
                    }
                    candidate = Some(op);
                    break 'retry;
                }
                NodeState::Undecided => {
                    // only flushed/aborted ops; the btree holds the truth
                    // for this key
                    if !approximated {
                        node_lookup = None;
                        break 'retry;
                    }
                    // treat the node key itself as a btree-visible key:
                    // fall through to the plain btree lookup below
                    node_lookup = None;
                    break 'retry;
                }
            }
        }

        if let Some(op) = candidate {
            // an approximate candidate from the pending layer; check
            // whether the btree has a closer key
            let txn_key = {
                let node = self.txn_store.op(op).node;
                self.txn_store.node(node).key.clone()
            };
            let direction = if flags.contains(FindFlags::GT) {
                ApproxMatch::Gt
            } else {
                ApproxMatch::Lt
            };

            let mut btree_flags = flags;
            if exact_is_erased {
                btree_flags -= FindFlags::EXACT;
            }
            let btree_hit = self.btree_find(name, key, btree_flags);
            match btree_hit {
                Err(e) if e.kind() == ErrorKind::KeyNotFound => {
                    let record = self.txn_store.op(op).record.clone();
                    return Ok((txn_key, record, direction));
                }
                Err(e) => return Err(e),
                Ok((bkey, brecord, btag)) => {
                    if btag == ApproxMatch::Exact && !exact_is_erased {
                        return Ok((bkey, brecord, ApproxMatch::Exact));
                    }
                    let cmp = key_type.compare(&bkey, &txn_key);
                    let use_btree = if flags.contains(FindFlags::GT) {
                        cmp == std::cmp::Ordering::Less
                    } else {
                        cmp == std::cmp::Ordering::Greater
                    };
                    if use_btree {
                        // confirm the btree neighbour was not erased or
                        // overwritten by pending ops
                        let (k, r, _) = self.find_txn(name, txn, &bkey, FindFlags::EXACT)?;
                        return Ok((k, r, direction));
                    }
                    let record = self.txn_store.op(op).record.clone();
                    return Ok((txn_key, record, direction));
                }
            }
        }

        // nothing pending decided the lookup; go to the btree, but an
        // erased exact key must not resurface
        let mut btree_flags = flags;
        if exact_is_erased {
            btree_flags -= FindFlags::EXACT;
            if !btree_flags.is_approximate() {
                return Err(BurrowError::of(ErrorKind::KeyNotFound));
            }
        }
        let (bkey, brecord, btag) = self.btree_find(name, key, btree_flags)?;
        if btag.is_approximate() || exact_is_erased {
            // the neighbour may itself carry pending state
            if let Some((node, _)) = self.databases[&name].txn_index.get(&bkey, FindFlags::EXACT) {
                match node_state(&self.txn_store, &self.txn, node, txn) {
                    NodeState::Conflict => return Err(BurrowError::of(ErrorKind::TxnConflict)),
                    NodeState::Erased => {
                        // step once more in the requested direction
                        return self.find_txn(name, txn, &bkey, flags - FindFlags::EXACT);
                    }
                    NodeState::Exists(op) => {
                        let record = self.txn_store.op(op).record.clone();
                        let tag = if btag.is_approximate() {
                            btag
                        } else {
                            direction_tag(flags)
                        };
                        return Ok((bkey, record, tag));
                    }
                    NodeState::Undecided => {}
                }
            }
            let tag = if btag.is_approximate() {
                btag
            } else {
                direction_tag(flags)
            };
            return Ok((bkey, brecord, tag));
        }
        Ok((bkey, brecord, btag))
    }

    fn btree_find(
        &mut self,
        name: u16,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<(Bytes, Bytes, ApproxMatch)> {
        let db = self.databases.get_mut(&name).unwrap();
        let mut ctx = BtreeContext {
            store: &mut self.store,
            blobs: &mut self.blobs,
            cursors: &mut db.cursors,
        };
        db.btree.find(&mut ctx, key, flags)
    }

    // ------------------------------------------------------------------
    // the merged duplicate view
    // ------------------------------------------------------------------

    /// Materialize the ordered duplicate view of `key`: the B+tree
    /// duplicates in physical order, with the visible pending ops of the
    /// node applied oldest to newest. An empty view means the key is not
    /// visible at all.
    pub(crate) fn build_dup_view(
        &mut self,
        name: u16,
        observer: Option<u64>,
        key: &[u8],
        conflicts: ConflictMode,
    ) -> BurrowResult<Vec<DupeLine>> {
        let mut view: Vec<DupeLine> = Vec::new();

        let btree_dups = {
            let db = self.databases.get_mut(&name).unwrap();
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            match db.btree.find_position(&mut ctx, key, FindFlags::EXACT) {
                Ok((pid, slot, _)) => db.btree.dup_count_at(&mut ctx, pid, slot)?,
                Err(e) if e.kind() == ErrorKind::KeyNotFound => 0,
                Err(e) => return Err(e),
            }
        };
        for i in 1..=btree_dups {
            view.push(DupeLine::Btree(i));
        }

        let node = match self.databases[&name].txn_index.get(key, FindFlags::EXACT) {
            Some((node, _)) => node,
            None => return Ok(view),
        };

        // collect visible ops oldest to newest, then apply them in order
        let mut chain = Vec::new();
        let mut current = self.txn_store.node(node).oldest_op;
        while let Some(op_id) = current {
            chain.push(op_id);
            current = self.txn_store.op(op_id).node_next;
        }

        for op_id in chain {
            let (txn_id, kind, flushed, flags, referenced_dup) = {
                let op = self.txn_store.op(op_id);
                (op.txn_id, op.kind, op.flushed, op.orig_flags, op.referenced_dup)
            };
            let optxn = self.txn.get(txn_id);
            let aborted = optxn.map(|t| t.is_aborted()).unwrap_or(false);
            let committed = optxn.map(|t| t.is_committed()).unwrap_or(true);

            if flushed || aborted {
                continue;
            }
            if !(committed || Some(txn_id) == observer) {
                if observer.is_none() {
                    continue;
                }
                match conflicts {
                    ConflictMode::Error => return Err(BurrowError::of(ErrorKind::TxnConflict)),
                    ConflictMode::Ignore => continue,
                }
            }
            match kind {
                OpKind::Insert | OpKind::InsertOverwrite => {
                    view.clear();
                    view.push(DupeLine::Txn(op_id));
                }
                OpKind::InsertDuplicate => {
                    let pos = if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
                        0
                    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE)
                        && referenced_dup >= 1
                    {
                        (referenced_dup as usize - 1).min(view.len())
                    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER)
                        && referenced_dup >= 1
                    {
                        (referenced_dup as usize).min(view.len())
                    } else {
                        view.len()
                    };
                    view.insert(pos, DupeLine::Txn(op_id));
                }
                OpKind::Erase => {
                    if referenced_dup == 0 {
                        view.clear();
                    } else if (referenced_dup as usize) <= view.len() {
                        view.remove(referenced_dup as usize - 1);
                    }
                }
                OpKind::Nop => {}
            }
        }
        Ok(view)
    }

    // ------------------------------------------------------------------
    // cursor invalidation broadcasts
    // ------------------------------------------------------------------

    /// After an erase op lands on `node`, every txn cursor in the node
    /// moves off it (their union cursors fall back to the btree side).
    /// Erasing one duplicate only adjusts the other cursors' duplicate
    /// indexes.
    pub(crate) fn nil_all_cursors_in_node(
        &mut self,
        name: u16,
        _txn: u64,
        current: Option<CursorId>,
        node: NodeId,
    ) -> DbResult {
        let current_dup = current
            .map(|cid| self.databases[&name].cursors.get(cid).dupecache_index)
            .unwrap_or(0);

        let mut op_walk = self.txn_store.node(node).newest_op;
        while let Some(op_id) = op_walk {
            let cursor_list = self.txn_store.op(op_id).cursor_list.clone();
            for cid in cursor_list {
                if Some(cid) == current {
                    continue;
                }
                let db = self.databases.get_mut(&name).unwrap();
                if current_dup > 0 {
                    let parent_dup = db.cursors.get(cid).dupecache_index;
                    if current_dup < parent_dup {
                        db.cursors.get_mut(cid).dupecache_index = parent_dup - 1;
                        db.cursors.get_mut(cid).dupecache.clear();
                        continue;
                    } else if current_dup > parent_dup {
                        continue;
                    }
                }
                txn_cursor::set_to_nil(&mut db.cursors, &mut self.txn_store, cid);
                let state = db.cursors.get_mut(cid);
                state.side = if state.btree.is_nil() {
                    CoupledSide::Nil
                } else {
                    CoupledSide::Btree
                };
                state.clear_dupecache();
                state.last_op = LastOp::LookupOrInsert;
            }
            op_walk = self.txn_store.op(op_id).node_prev;
        }
        Ok(())
    }

    /// Nil every btree-side cursor standing on `key` (the key is being
    /// erased).
    pub(crate) fn nil_all_cursors_in_btree(
        &mut self,
        name: u16,
        current: Option<CursorId>,
        key: &Bytes,
    ) -> DbResult {
        let current_dup = current
            .map(|cid| self.databases[&name].cursors.get(cid).dupecache_index)
            .unwrap_or(0);

        let ids = self.databases[&name].cursors.ids();
        for cid in ids {
            if Some(cid) == current {
                continue;
            }
            let db = self.databases.get_mut(&name).unwrap();
            let state = db.cursors.get(cid);
            if state.is_nil() || state.side == CoupledSide::Txn {
                continue;
            }
            let points_to = {
                let mut ctx = BtreeContext {
                    store: &mut self.store,
                    blobs: &mut self.blobs,
                    cursors: &mut db.cursors,
                };
                db.btree.cursor_points_to_key(&mut ctx, cid, key)?
            };
            if !points_to {
                continue;
            }
            if current_dup > 0 {
                let parent_dup = db.cursors.get(cid).dupecache_index;
                if current_dup < parent_dup {
                    db.cursors.get_mut(cid).dupecache_index = parent_dup - 1;
                    db.cursors.get_mut(cid).dupecache.clear();
                    continue;
                } else if current_dup > parent_dup {
                    continue;
                }
            }
            self.nil_union_cursor(name, cid)?;
        }
        Ok(())
    }

    /// Fully nil one union cursor (both sides).
    pub(crate) fn nil_union_cursor(&mut self, name: u16, cid: CursorId) -> DbResult {
        let db = self.databases.get_mut(&name).unwrap();
        txn_cursor::set_to_nil(&mut db.cursors, &mut self.txn_store, cid);
        {
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            db.btree.cursor_set_to_nil(&mut ctx, cid)?;
        }
        let state = db.cursors.get_mut(cid);
        state.side = CoupledSide::Nil;
        state.clear_dupecache();
        Ok(())
    }

    /// A duplicate was inserted at `start` (1-based): every other cursor
    /// on the same key with a higher duplicate index shifts right.
    pub(crate) fn increment_dupe_index(
        &mut self,
        name: u16,
        node: NodeId,
        skip: Option<CursorId>,
        start: u32,
    ) {
        let key = self.txn_store.node(node).key.clone();
        let ids = self.databases[&name].cursors.ids();
        for cid in ids {
            if Some(cid) == skip {
                continue;
            }
            let db = self.databases.get_mut(&name).unwrap();
            let state = db.cursors.get(cid);
            if state.is_nil() {
                continue;
            }
            let mut hit = false;
            if let Some(op) = state.txn.coupled_op() {
                if self.txn_store.op(op).node == node {
                    hit = true;
                }
            }
            if !hit && state.side == CoupledSide::Btree {
                let mut ctx = BtreeContext {
                    store: &mut self.store,
                    blobs: &mut self.blobs,
                    cursors: &mut db.cursors,
                };
                hit = db
                    .btree
                    .cursor_points_to_key(&mut ctx, cid, &key)
                    .unwrap_or(false);
            }
            if hit {
                let state = db.cursors.get_mut(cid);
                if state.dupecache_index > start {
                    state.dupecache_index += 1;
                    state.dupecache.clear();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // database-level operations
    // ------------------------------------------------------------------

    fn validate_key_record(
        &self,
        name: u16,
        key: &[u8],
        record: Option<&[u8]>,
    ) -> DbResult {
        let db = self.db_state(name)?;
        let key_size = db.btree.key_size;
        if key_size != KEY_SIZE_UNLIMITED && key.len() != key_size as usize {
            return Err(BurrowError::new(
                ErrorKind::InvalidKeySize,
                &format!("key size {} instead of {}", key.len(), key_size),
            ));
        }
        // variable-size keys must leave room for a sensible fanout
        if key.len() > self.config.page_size as usize / 4 {
            return Err(BurrowError::new(
                ErrorKind::InvalidKeySize,
                "key too large for the page size",
            ));
        }
        if let Some(record) = record {
            let record_size = db.btree.record_size;
            if record_size != RECORD_SIZE_UNLIMITED && record.len() != record_size as usize {
                return Err(BurrowError::new(
                    ErrorKind::InvalidRecordSize,
                    &format!("record size {} instead of {}", record.len(), record_size),
                ));
            }
        }
        Ok(())
    }

    /// Insert through the database handle. Returns the key actually
    /// used (record-number databases assign it).
    pub(crate) fn db_insert(
        &mut self,
        name: u16,
        txn: Option<u64>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> BurrowResult<Bytes> {
        self.db_state(name)?;
        let mut flags = flags;
        if flags.contains(InsertFlags::PARTIAL) {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "partial writes go through insert_partial",
            ));
        }

        // record-number databases assign the key themselves
        let record_number = self.databases[&name]
            .btree
            .flags
            .contains(DbFlags::RECORD_NUMBER);
        let key: Bytes = if record_number {
            if flags.contains(InsertFlags::OVERWRITE) {
                if key.len() != 8 {
                    return Err(BurrowError::new(
                        ErrorKind::InvalidKeySize,
                        "record-number overwrite requires the 8-byte key",
                    ));
                }
                Bytes::copy_from_slice(key)
            } else {
                if !key.is_empty() {
                    return Err(BurrowError::new(
                        ErrorKind::InvalidKeySize,
                        "record-number keys are assigned by the database",
                    ));
                }
                let db = self.databases.get_mut(&name).unwrap();
                db.recno += 1;
                flags |= InsertFlags::HINT_APPEND;
                Bytes::copy_from_slice(&db.recno.to_le_bytes())
            }
        } else {
            self.validate_key_record(name, key, Some(record))?;
            Bytes::copy_from_slice(key)
        };
        if record_number {
            self.validate_key_record(name, &key, Some(record))?;
        }
        if flags.is_duplicate()
            && !self.databases[&name]
                .btree
                .flags
                .contains(DbFlags::ENABLE_DUPLICATES)
        {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "duplicates are not enabled for this database",
            ));
        }

        self.store.purge_cache();

        let result = if self.txns_enabled() || txn.is_some() {
            let (effective, temporary) = match txn {
                Some(id) => (id, false),
                None => (self.begin_txn(None, TxnFlags::TEMPORARY)?, true),
            };
            let st = self.insert_txn(name, effective, &key, record, flags, None);
            if temporary {
                match &st {
                    Ok(()) => self.txn_commit(effective)?,
                    Err(_) => self.txn_abort(effective)?,
                }
            }
            st
        } else {
            let st = {
                let db = self.databases.get_mut(&name).unwrap();
                let mut ctx = BtreeContext {
                    store: &mut self.store,
                    blobs: &mut self.blobs,
                    cursors: &mut db.cursors,
                };
                db.btree.insert(&mut ctx, &key, record, flags, 0).map(|_| ())
            };
            if st.is_ok() {
                self.sync_db_root(name);
                self.write_header()?;
                if self.flags.contains(crate::flags::EnvFlags::ENABLE_RECOVERY) {
                    let lsn = self.txn.next_lsn();
                    self.store.flush_changeset(lsn)?;
                }
            }
            st
        };

        self.store.clear_changeset();
        result.map(|()| key)
    }

    /// Replace a slice of an existing record, zero-padding gaps.
    pub(crate) fn db_insert_partial(
        &mut self,
        name: u16,
        key: &[u8],
        slice: &[u8],
        offset: usize,
    ) -> DbResult {
        let existing = match self.db_find(name, None, key, FindFlags::EXACT) {
            Ok((_, record, _)) => Some(record),
            Err(e) if e.kind() == ErrorKind::KeyNotFound => None,
            Err(e) => return Err(e),
        };
        let mut record = existing.map(|r| r.to_vec()).unwrap_or_default();
        if record.len() < offset + slice.len() {
            record.resize(offset + slice.len(), 0);
        }
        record[offset..offset + slice.len()].copy_from_slice(slice);
        self.db_insert(name, None, key, &record, InsertFlags::OVERWRITE)
            .map(|_| ())
    }

    pub(crate) fn db_find(
        &mut self,
        name: u16,
        txn: Option<u64>,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<(Bytes, Bytes, ApproxMatch)> {
        self.db_state(name)?;
        self.validate_key_record(name, key, None)?;
        self.store.purge_cache();

        let result = if self.txns_enabled() || txn.is_some() {
            self.find_txn(name, txn, key, flags)
        } else {
            self.btree_find(name, key, flags)
        };
        self.store.clear_changeset();
        result
    }

    pub(crate) fn db_erase(&mut self, name: u16, txn: Option<u64>, key: &[u8]) -> DbResult {
        self.db_state(name)?;
        self.validate_key_record(name, key, None)?;
        self.store.purge_cache();

        let result = if self.txns_enabled() || txn.is_some() {
            let (effective, temporary) = match txn {
                Some(id) => (id, false),
                None => (self.begin_txn(None, TxnFlags::TEMPORARY)?, true),
            };
            let st = self.erase_txn(name, effective, key, None);
            if temporary {
                match &st {
                    Ok(()) => self.txn_commit(effective)?,
                    Err(_) => self.txn_abort(effective)?,
                }
            }
            st
        } else {
            let st = {
                let db = self.databases.get_mut(&name).unwrap();
                let mut ctx = BtreeContext {
                    store: &mut self.store,
                    blobs: &mut self.blobs,
                    cursors: &mut db.cursors,
                };
                db.btree.erase(&mut ctx, key, 0)
            };
            if st.is_ok() {
                self.nil_all_cursors_in_btree(name, None, &Bytes::copy_from_slice(key))?;
                self.sync_db_root(name);
                self.write_header()?;
                if self.flags.contains(crate::flags::EnvFlags::ENABLE_RECOVERY) {
                    let lsn = self.txn.next_lsn();
                    self.store.flush_changeset(lsn)?;
                }
            }
            st
        };

        self.store.clear_changeset();
        result
    }

    /// Key (or key/duplicate) count merged over both layers.
    pub(crate) fn db_count(
        &mut self,
        name: u16,
        txn: Option<u64>,
        distinct: bool,
    ) -> BurrowResult<u64> {
        self.db_state(name)?;
        let mut total: i64 = {
            let db = self.databases.get_mut(&name).unwrap();
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            db.btree.count(&mut ctx, distinct)? as i64
        };

        let keys: Vec<Bytes> = {
            let db = &self.databases[&name];
            let txn_store = &self.txn_store;
            db.txn_index
                .node_ids()
                .map(|n| txn_store.node(n).key.clone())
                .collect()
        };
        for key in keys {
            let btree_dups = {
                let db = self.databases.get_mut(&name).unwrap();
                let mut ctx = BtreeContext {
                    store: &mut self.store,
                    blobs: &mut self.blobs,
                    cursors: &mut db.cursors,
                };
                match db.btree.find_position(&mut ctx, &key, FindFlags::EXACT) {
                    Ok((pid, slot, _)) => db.btree.dup_count_at(&mut ctx, pid, slot)? as i64,
                    Err(_) => 0,
                }
            };
            let merged =
                self.build_dup_view(name, txn, &key, ConflictMode::Ignore)?.len() as i64;
            total += if distinct {
                (merged.min(1)) - (btree_dups.min(1))
            } else {
                merged - btree_dups
            };
        }
        self.store.clear_changeset();
        Ok(total.max(0) as u64)
    }

    pub(crate) fn db_check_integrity(&mut self, name: u16) -> DbResult {
        self.db_state(name)?;
        let result = {
            let db = self.databases.get_mut(&name).unwrap();
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            db.btree.check_integrity(&mut ctx)
        };
        self.store.clear_changeset();
        result
    }

    // ------------------------------------------------------------------
    // commit / abort / flush
    // ------------------------------------------------------------------

    pub(crate) fn txn_commit(&mut self, id: u64) -> DbResult {
        {
            let state = self.txn.state(id)?;
            if !state.is_active() {
                return Err(BurrowError::new(
                    ErrorKind::InvalidParameter,
                    "transaction is no longer active",
                ));
            }
            // open cursors do not block a commit: the flush migrates
            // them onto the resulting B+tree positions
        }
        self.txn.state_mut(id)?.status = crate::txn::TxnStatus::Committed;
        debug!("commit txn, id: {}", id);

        if self.journal_enabled() {
            let lsn = self.txn.next_lsn();
            if let Some(journal) = &mut self.journal {
                journal.append_txn_commit(id, lsn)?;
            }
        }

        self.txn.note_committed(id);
        if self.txn.should_flush() {
            self.flush_committed_txns()?;
        }
        Ok(())
    }

    pub(crate) fn txn_abort(&mut self, id: u64) -> DbResult {
        {
            let state = self.txn.state(id)?;
            if !state.is_active() {
                return Err(BurrowError::new(
                    ErrorKind::InvalidParameter,
                    "transaction is no longer active",
                ));
            }
            if state.cursor_refcount > 0 {
                return Err(BurrowError::of(ErrorKind::CursorStillOpen));
            }
        }
        self.txn.state_mut(id)?.status = crate::txn::TxnStatus::Aborted;
        debug!("abort txn, id: {}", id);

        if self.journal_enabled() {
            let lsn = self.txn.next_lsn();
            if let Some(journal) = &mut self.journal {
                journal.append_txn_abort(id, lsn)?;
            }
        }

        // aborted operations release immediately
        self.free_txn_ops(id)?;
        self.store.clear_changeset();
        self.txn.note_aborted();
        if self.txn.should_flush() {
            self.flush_committed_txns()?;
        }
        Ok(())
    }

    /// Unlink and release every op of a transaction, nilling coupled
    /// cursors first.
    fn free_txn_ops(&mut self, id: u64) -> DbResult {
        let mut ops = Vec::new();
        let mut current = self.txn.state(id)?.oldest_op;
        while let Some(op_id) = current {
            ops.push(op_id);
            current = self.txn_store.op(op_id).txn_next;
        }

        for op_id in ops {
            let node_id = self.txn_store.op(op_id).node;
            let db_id = self.txn_store.node(node_id).db_id;

            let cursor_list = self.txn_store.op(op_id).cursor_list.clone();
            if let Some(db) = self.databases.get_mut(&db_id) {
                for cid in cursor_list {
                    txn_cursor::set_to_nil(&mut db.cursors, &mut self.txn_store, cid);
                    let state = db.cursors.get_mut(cid);
                    if state.side == CoupledSide::Txn {
                        state.side = if state.btree.is_nil() {
                            CoupledSide::Nil
                        } else {
                            CoupledSide::Btree
                        };
                    }
                    state.clear_dupecache();
                }
            } else {
                self.txn_store.op_mut(op_id).cursor_list.clear();
            }

            let txn_state = self.txn.get_mut(id).expect("transaction state");
            if let Some(empty_node) = self.txn_store.destroy_op(op_id, txn_state) {
                let key = self.txn_store.node(empty_node).key.clone();
                if let Some(db) = self.databases.get_mut(&db_id) {
                    db.txn_index.remove(&key);
                }
                self.txn_store.free_node(empty_node);
            }
        }
        Ok(())
    }

    /// Drain the committed prefix of the outstanding-transaction queue
    /// into the B+tree.
    pub(crate) fn flush_committed_txns(&mut self) -> DbResult {
        let mut highest_lsn = 0u64;

        loop {
            let head = match self.txn.head() {
                Some(head) => head,
                None => break,
            };
            let status = match self.txn.get(head) {
                Some(state) => state.status,
                None => break,
            };
            match status {
                crate::txn::TxnStatus::Committed => {
                    let (ops, bytes) = {
                        let state = self.txn.get(head).unwrap();
                        (state.op_counter as usize, state.accum_data_size)
                    };
                    let lsn = self.flush_txn(head)?;
                    if lsn > highest_lsn {
                        highest_lsn = lsn;
                    }
                    self.txn.note_flushed(ops, bytes);
                    self.free_txn_ops(head)?;
                    self.txn.pop_head();
                }
                crate::txn::TxnStatus::Aborted => {
                    self.txn.pop_head();
                }
                crate::txn::TxnStatus::Active => break,
            }
        }

        let names: Vec<u16> = self.databases.keys().copied().collect();
        for name in names {
            self.sync_db_root(name);
        }
        self.write_header()?;

        if highest_lsn > 0 {
            if self.flags.contains(crate::flags::EnvFlags::ENABLE_RECOVERY) {
                self.store.flush_changeset(highest_lsn)?;
            }
            if let Some(journal) = &mut self.journal {
                journal.transaction_flushed(highest_lsn)?;
                if self.txn.queued_count() == 0 {
                    journal.reset()?;
                }
            }
        }
        Ok(())
    }

    /// Replay one committed transaction's ops, oldest first, into the
    /// B+tree; coupled cursors migrate from the op to the landing
    /// position.
    fn flush_txn(&mut self, id: u64) -> BurrowResult<u64> {
        let mut highest_lsn = 0u64;
        let mut current = self.txn.state(id)?.oldest_op;

        while let Some(op_id) = current {
            let next = self.txn_store.op(op_id).txn_next;
            let flushed = self.txn_store.op(op_id).flushed;
            if !flushed {
                self.flush_txn_operation(id, op_id)?;
                self.txn_store.op_mut(op_id).flushed = true;
            }
            let lsn = self.txn_store.op(op_id).lsn;
            if lsn > highest_lsn {
                highest_lsn = lsn;
            }
            current = next;
        }
        debug!("flushed txn, id: {}, highest lsn: {}", id, highest_lsn);
        Ok(highest_lsn)
    }

    /// Apply a single op to the B+tree and re-couple its cursors.
    fn flush_txn_operation(&mut self, _txn_id: u64, op_id: OpId) -> DbResult {
        let (node_id, kind, orig_flags, referenced_dup, record) = {
            let op = self.txn_store.op(op_id);
            (
                op.node,
                op.kind,
                op.orig_flags,
                op.referenced_dup,
                op.record.clone(),
            )
        };
        let (db_id, key) = {
            let node = self.txn_store.node(node_id);
            (node.db_id, node.key.clone())
        };
        if !self.databases.contains_key(&db_id) {
            return Err(BurrowError::of(ErrorKind::DatabaseNotFound));
        }

        match kind {
            OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate => {
                let additional = if kind == OpKind::InsertDuplicate {
                    InsertFlags::DUPLICATE
                } else {
                    InsertFlags::OVERWRITE
                };
                let landing = {
                    let db = self.databases.get_mut(&db_id).unwrap();
                    let mut ctx = BtreeContext {
                        store: &mut self.store,
                        blobs: &mut self.blobs,
                        cursors: &mut db.cursors,
                    };
                    db.btree.insert(
                        &mut ctx,
                        &key,
                        &record,
                        orig_flags | additional,
                        referenced_dup,
                    )?
                };
                self.sync_db_root(db_id);

                // move coupled cursors over to the btree
                let cursor_list = self.txn_store.op(op_id).cursor_list.clone();
                for cid in cursor_list {
                    let db = self.databases.get_mut(&db_id).unwrap();
                    txn_cursor::set_to_nil(&mut db.cursors, &mut self.txn_store, cid);
                    {
                        let mut ctx = BtreeContext {
                            store: &mut self.store,
                            blobs: &mut self.blobs,
                            cursors: &mut db.cursors,
                        };
                        db.btree
                            .cursor_couple_to(&mut ctx, cid, landing.0, landing.1, landing.2)?;
                    }
                    let state = db.cursors.get_mut(cid);
                    state.side = CoupledSide::Btree;
                    state.clear_dupecache();
                }
            }
            OpKind::Erase => {
                let st = {
                    let db = self.databases.get_mut(&db_id).unwrap();
                    let mut ctx = BtreeContext {
                        store: &mut self.store,
                        blobs: &mut self.blobs,
                        cursors: &mut db.cursors,
                    };
                    db.btree.erase(&mut ctx, &key, referenced_dup)
                };
                match st {
                    Err(e) if e.kind() == ErrorKind::KeyNotFound => {}
                    other => other?,
                }
                self.sync_db_root(db_id);
            }
            OpKind::Nop => {}
        }

        // duplicate views held by other cursors may reference this op;
        // the op object is about to be released, so those views rebuild
        // from scratch on their next use
        let db = self.databases.get_mut(&db_id).unwrap();
        for cid in db.cursors.ids() {
            let state = db.cursors.get_mut(cid);
            if state.dupecache.iter().any(|line| *line == DupeLine::Txn(op_id)) {
                state.dupecache.clear();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // recovery
    // ------------------------------------------------------------------

    /// Reapply journaled operations of committed-but-unflushed
    /// transactions, in order.
    pub(crate) fn replay_recovered_ops(&mut self, ops: Vec<RecoveredOp>) -> DbResult {
        let mut opened: Vec<u16> = Vec::new();
        let mut highest_lsn = 0u64;

        for op in ops {
            if !self.databases.contains_key(&op.db) {
                self.open_db(op.db)?;
                opened.push(op.db);
            }
            if op.lsn > highest_lsn {
                highest_lsn = op.lsn;
            }
            let db = self.databases.get_mut(&op.db).unwrap();
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            match op.kind {
                RecoveredOpKind::Insert => {
                    db.btree.insert(
                        &mut ctx,
                        &op.key,
                        &op.record,
                        InsertFlags::from_bits_truncate(op.flags),
                        0,
                    )?;
                }
                RecoveredOpKind::Erase => {
                    match db.btree.erase(&mut ctx, &op.key, op.dup_index) {
                        Err(e) if e.kind() == ErrorKind::KeyNotFound => {}
                        other => other?,
                    }
                }
            }
            self.sync_db_root(op.db);
        }

        self.write_header()?;
        self.store.flush_changeset(highest_lsn)?;
        if let Some(journal) = &mut self.journal {
            journal.transaction_flushed(highest_lsn)?;
            journal.reset()?;
        }
        for name in opened {
            self.db_close_internal(name)?;
        }
        debug!("recovery replay complete, highest lsn: {}", highest_lsn);
        Ok(())
    }
}

fn direction_tag(flags: FindFlags) -> ApproxMatch {
    if flags.contains(FindFlags::GT) {
        ApproxMatch::Gt
    } else if flags.contains(FindFlags::LT) {
        ApproxMatch::Lt
    } else {
        ApproxMatch::Exact
    }
}
