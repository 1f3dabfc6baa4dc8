//! The public cursor: one B+tree subcursor plus one transaction
//! subcursor, merged into a single ordered view. The heavy lifting (the
//! union merge itself) lives in the `EnvInner` impl blocks further down;
//! this file starts with the cursor state and its arena.

use bytes::Bytes;

use crate::btree::cursor::BtreeCursorState;
use crate::txn::index::OpId;

pub type CursorId = usize;

/// Which subcursor the union cursor currently reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoupledSide {
    Nil,
    Btree,
    Txn,
}

/// What the previous operation on this cursor was; `move` consults this
/// so a find followed by a step does not re-report the found key, and so
/// a direction change resynchronizes both subcursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOp {
    None,
    LookupOrInsert,
    MoveNext,
    MovePrevious,
}

/// One line of the materialized duplicate view of the current key:
/// either a physical B+tree duplicate (by 1-based index) or a pending
/// duplicate op in the transaction overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupeLine {
    Btree(u32),
    Txn(OpId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnCursorState {
    Nil,
    Coupled(OpId),
}

impl TxnCursorState {
    pub fn is_nil(&self) -> bool {
        *self == TxnCursorState::Nil
    }

    pub fn coupled_op(&self) -> Option<OpId> {
        match self {
            TxnCursorState::Nil => None,
            TxnCursorState::Coupled(op) => Some(*op),
        }
    }
}

pub struct CursorState {
    /// the transaction this cursor operates under, if any
    pub txn_id: Option<u64>,
    pub btree: BtreeCursorState,
    pub txn: TxnCursorState,
    pub side: CoupledSide,

    /// merged duplicate list of the current key; empty when the key has
    /// no duplicates or the cache was invalidated
    pub dupecache: Vec<DupeLine>,
    /// 1-based position in the dupecache; 0 = not positioned on a dup
    pub dupecache_index: u32,

    pub last_op: LastOp,
    pub first_use: bool,
}

impl CursorState {
    pub fn new(txn_id: Option<u64>) -> Self {
        Self {
            txn_id,
            btree: BtreeCursorState::Nil,
            txn: TxnCursorState::Nil,
            side: CoupledSide::Nil,
            dupecache: Vec::new(),
            dupecache_index: 0,
            last_op: LastOp::None,
            first_use: true,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.btree.is_nil() && self.txn.is_nil()
    }

    pub fn clear_dupecache(&mut self) {
        self.dupecache.clear();
        self.dupecache_index = 0;
    }
}

/// The per-database registry of live cursors. Pages and txn-ops link to
/// cursors through these ids; the arena is the single place a cursor's
/// state lives.
pub struct CursorArena {
    slots: Vec<Option<CursorState>>,
    free: Vec<CursorId>,
}

impl CursorArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, state: CursorState) -> CursorId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(state);
                id
            }
            None => {
                self.slots.push(Some(state));
                self.slots.len() - 1
            }
        }
    }

    pub fn release(&mut self, cid: CursorId) {
        self.slots[cid] = None;
        self.free.push(cid);
    }

    pub fn get(&self, cid: CursorId) -> &CursorState {
        self.slots[cid].as_ref().expect("dangling cursor id")
    }

    pub fn get_mut(&mut self, cid: CursorId) -> &mut CursorState {
        self.slots[cid].as_mut().expect("dangling cursor id")
    }

    pub fn contains(&self, cid: CursorId) -> bool {
        cid < self.slots.len() && self.slots[cid].is_some()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn ids(&self) -> Vec<CursorId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }
}

// ----------------------------------------------------------------------
// the union view
// ----------------------------------------------------------------------

use crate::btree::{Btree, BtreeContext};
use crate::db::ConflictMode;
use crate::env::EnvInner;
use crate::error::{BurrowError, BurrowResult, DbResult, ErrorKind};
use crate::flags::{DbFlags, FindFlags, InsertFlags, MoveFlags, TxnFlags};
use crate::txn::cursor as txn_cursor;

impl EnvInner {
    /// Split-borrow helper: the database's tree handle plus a context
    /// over the store, the blob manager and the cursor arena.
    pub(crate) fn with_btree<R>(
        &mut self,
        name: u16,
        f: impl FnOnce(&mut Btree, &mut BtreeContext) -> R,
    ) -> R {
        let db = self.databases.get_mut(&name).expect("database is open");
        let mut ctx = BtreeContext {
            store: &mut self.store,
            blobs: &mut self.blobs,
            cursors: &mut db.cursors,
        };
        f(&mut db.btree, &mut ctx)
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn cursor_create(&mut self, name: u16, txn: Option<u64>) -> BurrowResult<CursorId> {
        self.db_state(name)?;
        if let Some(id) = txn {
            let state = self.txn.state_mut(id)?;
            if !state.is_active() {
                return Err(BurrowError::new(
                    ErrorKind::InvalidParameter,
                    "transaction is no longer active",
                ));
            }
            state.cursor_refcount += 1;
        }
        let db = self.databases.get_mut(&name).unwrap();
        Ok(db.cursors.alloc(CursorState::new(txn)))
    }

    pub(crate) fn cursor_clone(&mut self, name: u16, cid: CursorId) -> BurrowResult<CursorId> {
        self.db_state(name)?;
        let (txn_id, btree, txn_sub, side, dupecache, dupecache_index, last_op, first_use) = {
            let state = self.databases[&name].cursors.get(cid);
            (
                state.txn_id,
                state.btree.clone(),
                state.txn,
                state.side,
                state.dupecache.clone(),
                state.dupecache_index,
                state.last_op,
                state.first_use,
            )
        };
        if let Some(id) = txn_id {
            self.txn.state_mut(id)?.cursor_refcount += 1;
        }

        let db = self.databases.get_mut(&name).unwrap();
        let new_cid = db.cursors.alloc(CursorState::new(txn_id));
        {
            let state = db.cursors.get_mut(new_cid);
            state.side = side;
            state.dupecache = dupecache;
            state.dupecache_index = dupecache_index;
            state.last_op = last_op;
            state.first_use = first_use;
        }

        // thread the clone into the same page / op lists
        match btree {
            BtreeCursorState::Coupled { pid, slot, dup } => {
                let mut ctx = BtreeContext {
                    store: &mut self.store,
                    blobs: &mut self.blobs,
                    cursors: &mut db.cursors,
                };
                db.btree.cursor_couple_to(&mut ctx, new_cid, pid, slot, dup)?;
            }
            other => db.cursors.get_mut(new_cid).btree = other,
        }
        if let TxnCursorState::Coupled(op) = txn_sub {
            txn_cursor::couple_to_op(&mut db.cursors, &mut self.txn_store, new_cid, op);
        }
        Ok(new_cid)
    }

    pub(crate) fn cursor_close(&mut self, name: u16, cid: CursorId) -> DbResult {
        let db = match self.databases.get_mut(&name) {
            Some(db) => db,
            None => return Ok(()),
        };
        if !db.cursors.contains(cid) {
            return Ok(());
        }
        let txn_id = db.cursors.get(cid).txn_id;
        txn_cursor::set_to_nil(&mut db.cursors, &mut self.txn_store, cid);
        {
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            db.btree.cursor_set_to_nil(&mut ctx, cid)?;
        }
        db.cursors.release(cid);
        if let Some(id) = txn_id {
            if let Some(state) = self.txn.get_mut(id) {
                state.cursor_refcount = state.cursor_refcount.saturating_sub(1);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // the current position
    // ------------------------------------------------------------------

    pub(crate) fn union_current_key(&mut self, name: u16, cid: CursorId) -> BurrowResult<Bytes> {
        let (side, txn_sub) = {
            let state = self.databases[&name].cursors.get(cid);
            (state.side, state.txn)
        };
        match side {
            CoupledSide::Txn => {
                let op = txn_sub
                    .coupled_op()
                    .ok_or_else(|| BurrowError::of(ErrorKind::CursorIsNil))?;
                let node = self.txn_store.op(op).node;
                Ok(self.txn_store.node(node).key.clone())
            }
            CoupledSide::Btree => self.with_btree(name, |btree, ctx| btree.cursor_key(ctx, cid)),
            CoupledSide::Nil => Err(BurrowError::of(ErrorKind::CursorIsNil)),
        }
    }

    /// Couple both subcursors at `key` and install the merged duplicate
    /// view, positioned at the 1-based `index`.
    pub(crate) fn position_at_key(
        &mut self,
        name: u16,
        cid: CursorId,
        key: &[u8],
        view: Vec<DupeLine>,
        index: u32,
    ) -> DbResult {
        debug_assert!(!view.is_empty());
        debug_assert!(index >= 1 && index as usize <= view.len());

        // btree side: coupled when the key physically exists
        self.with_btree(name, |btree, ctx| {
            match btree.cursor_find(ctx, cid, key, FindFlags::EXACT) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == ErrorKind::KeyNotFound => btree.cursor_set_to_nil(ctx, cid),
                Err(e) => Err(e),
            }
        })?;

        // txn side: coupled to the newest visible op of the node
        let node = self.databases[&name]
            .txn_index
            .get(key, FindFlags::EXACT)
            .map(|(n, _)| n);
        {
            let db = self.databases.get_mut(&name).unwrap();
            match node {
                Some(node) => {
                    match txn_cursor::move_top_in_node(
                        &mut db.cursors,
                        &mut self.txn_store,
                        &self.txn,
                        cid,
                        node,
                        true,
                    ) {
                        Ok(()) => {}
                        Err(e)
                            if e.kind() == ErrorKind::KeyNotFound
                                || e.kind() == ErrorKind::KeyErasedInTxn => {}
                        Err(e) => return Err(e),
                    }
                }
                None => txn_cursor::set_to_nil(&mut db.cursors, &mut self.txn_store, cid),
            }
        }

        let entry = view[index as usize - 1];
        match entry {
            DupeLine::Btree(dup) => {
                let db = self.databases.get_mut(&name).unwrap();
                db.cursors.get_mut(cid).btree.set_dup(dup);
                db.cursors.get_mut(cid).side = CoupledSide::Btree;
            }
            DupeLine::Txn(op) => {
                let db = self.databases.get_mut(&name).unwrap();
                txn_cursor::couple_to_op(&mut db.cursors, &mut self.txn_store, cid, op);
                db.cursors.get_mut(cid).side = CoupledSide::Txn;
            }
        }

        let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
        if view.len() > 1 {
            state.dupecache = view;
            state.dupecache_index = index;
        } else {
            state.clear_dupecache();
        }
        Ok(())
    }

    fn read_dupe_entry(&mut self, name: u16, cid: CursorId, entry: DupeLine) -> BurrowResult<Bytes> {
        match entry {
            DupeLine::Txn(op) => Ok(self.txn_store.op(op).record.clone()),
            DupeLine::Btree(dup) => self.with_btree(name, |btree, ctx| {
                let (pid, slot) = btree.cursor_position(ctx, cid)?;
                btree.read_record_at(ctx, pid, slot, dup)
            }),
        }
    }

    /// The key and record under the cursor.
    pub(crate) fn cursor_current(&mut self, name: u16, cid: CursorId) -> BurrowResult<(Bytes, Bytes)> {
        self.db_state(name)?;
        let key = self.union_current_key(name, cid)?;
        let (entry, side, txn_sub) = {
            let state = self.databases[&name].cursors.get(cid);
            let entry = if state.dupecache.is_empty() {
                None
            } else {
                let idx = state.dupecache_index.max(1) as usize - 1;
                state.dupecache.get(idx).copied()
            };
            (entry, state.side, state.txn)
        };

        let record = match entry {
            Some(entry) => self.read_dupe_entry(name, cid, entry)?,
            None => match side {
                CoupledSide::Txn => {
                    let op = txn_sub
                        .coupled_op()
                        .ok_or_else(|| BurrowError::of(ErrorKind::CursorIsNil))?;
                    self.txn_store.op(op).record.clone()
                }
                CoupledSide::Btree => {
                    self.with_btree(name, |btree, ctx| btree.cursor_record(ctx, cid))?
                }
                CoupledSide::Nil => return Err(BurrowError::of(ErrorKind::CursorIsNil)),
            },
        };
        Ok((key, record))
    }

    /// Rebuild the duplicate view after a sibling mutation cleared it.
    fn refresh_dupecache(&mut self, name: u16, cid: CursorId) -> DbResult {
        let needs = {
            let state = self.databases[&name].cursors.get(cid);
            state.dupecache.is_empty()
                && state.dupecache_index > 0
                && state.side != CoupledSide::Nil
        };
        if !needs {
            return Ok(());
        }
        let observer = self.databases[&name].cursors.get(cid).txn_id;
        let key = self.union_current_key(name, cid)?;
        let view = self.build_dup_view(name, observer, &key, ConflictMode::Ignore)?;
        let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
        if view.len() > 1 {
            state.dupecache_index = state.dupecache_index.min(view.len() as u32).max(1);
            state.dupecache = view;
        } else {
            state.clear_dupecache();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // the ordered merge
    // ------------------------------------------------------------------

    /// Land on the nearest visible key beyond `anchor` (or the edge of
    /// the merged view when `anchor` is `None`), skipping keys whose
    /// merged duplicate view is empty.
    fn union_seek(
        &mut self,
        name: u16,
        cid: CursorId,
        anchor: Option<Bytes>,
        forward: bool,
    ) -> DbResult {
        let observer = self.databases[&name].cursors.get(cid).txn_id;
        let key_type = self.databases[&name].btree.key_type;
        let conflicts = if anchor.is_none() {
            ConflictMode::Error
        } else {
            ConflictMode::Ignore
        };
        let mut after = anchor;

        loop {
            let kb: Option<Bytes> = self.with_btree(name, |btree, ctx| {
                let position = match &after {
                    Some(key) => {
                        let flags = if forward { FindFlags::GT } else { FindFlags::LT };
                        match btree.find_position(ctx, key, flags) {
                            Ok((pid, slot, _)) => Some((pid, slot)),
                            Err(e) if e.kind() == ErrorKind::KeyNotFound => None,
                            Err(e) => return Err(e),
                        }
                    }
                    None => {
                        if forward {
                            btree.first_position(ctx)?
                        } else {
                            btree.last_position(ctx)?
                        }
                    }
                };
                match position {
                    Some((pid, slot)) => Ok(Some(btree.key_at(ctx, pid, slot)?)),
                    None => Ok(None),
                }
            })?;

            let kt: Option<Bytes> = {
                let db = &self.databases[&name];
                let txn_store = &self.txn_store;
                let node = match &after {
                    Some(key) => {
                        if forward {
                            db.txn_index.next_sibling(key)
                        } else {
                            db.txn_index.previous_sibling(key)
                        }
                    }
                    None => {
                        if forward {
                            db.txn_index.first()
                        } else {
                            db.txn_index.last()
                        }
                    }
                };
                node.map(|n| txn_store.node(n).key.clone())
            };

            let key = match (kb, kt) {
                (None, None) => {
                    self.nil_union_cursor(name, cid)?;
                    return Err(BurrowError::of(ErrorKind::KeyNotFound));
                }
                (Some(b), None) => b,
                (None, Some(t)) => t,
                (Some(b), Some(t)) => {
                    let pick_btree = if forward {
                        key_type.compare(&b, &t) != std::cmp::Ordering::Greater
                    } else {
                        key_type.compare(&b, &t) != std::cmp::Ordering::Less
                    };
                    if pick_btree {
                        b
                    } else {
                        t
                    }
                }
            };

            let view = self.build_dup_view(name, observer, &key, conflicts)?;
            if view.is_empty() {
                // erased (or not yet visible); step over it
                after = Some(key);
                continue;
            }
            let index = if forward { 1 } else { view.len() as u32 };
            return self.position_at_key(name, cid, &key, view, index);
        }
    }

    // ------------------------------------------------------------------
    // public cursor operations
    // ------------------------------------------------------------------

    pub(crate) fn cursor_find(
        &mut self,
        name: u16,
        cid: CursorId,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<Bytes> {
        self.db_state(name)?;
        self.validate_cursor_key(name, key)?;
        self.store.purge_cache();

        let observer = self.databases[&name].cursors.get(cid).txn_id;
        {
            let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
            state.first_use = false;
            state.clear_dupecache();
        }
        self.nil_union_cursor(name, cid)?;

        let transactional = self.txns_enabled() || observer.is_some();
        let result = if !transactional {
            // direct btree lookup
            self.with_btree(name, |btree, ctx| {
                btree.cursor_find(ctx, cid, key, flags).map(|_| ())
            })
            .and_then(|()| {
                let db = self.databases.get_mut(&name).unwrap();
                db.cursors.get_mut(cid).side = CoupledSide::Btree;
                self.with_btree(name, |btree, ctx| btree.cursor_record(ctx, cid))
            })
        } else if flags.is_approximate() {
            // resolve the target key across both layers, then couple
            self.find_txn(name, observer, key, flags)
                .and_then(|(found_key, _, _)| {
                    let view =
                        self.build_dup_view(name, observer, &found_key, ConflictMode::Error)?;
                    if view.is_empty() {
                        return Err(BurrowError::of(ErrorKind::KeyNotFound));
                    }
                    self.position_at_key(name, cid, &found_key, view, 1)?;
                    self.cursor_current(name, cid).map(|(_, record)| record)
                })
        } else {
            self.cursor_find_exact(name, cid, key, observer)
        };

        match result {
            Ok(record) => {
                let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
                state.last_op = LastOp::LookupOrInsert;
                self.store.clear_changeset();
                Ok(record)
            }
            Err(e) => {
                self.store.clear_changeset();
                Err(e)
            }
        }
    }

    fn cursor_find_exact(
        &mut self,
        name: u16,
        cid: CursorId,
        key: &[u8],
        observer: Option<u64>,
    ) -> BurrowResult<Bytes> {
        // probe the pending layer first; it decides erased/conflicting
        // keys and couples the cursor so the caller knows which op
        let probe = {
            let db = self.databases.get_mut(&name).unwrap();
            txn_cursor::find(
                &mut db.cursors,
                &mut self.txn_store,
                &self.txn,
                &db.txn_index,
                cid,
                key,
                FindFlags::EXACT,
            )
        };
        match probe {
            Err(e) if e.kind() == ErrorKind::TxnConflict => return Err(e),
            Err(e) if e.kind() == ErrorKind::KeyErasedInTxn => {
                let op = self.databases[&name]
                    .cursors
                    .get(cid)
                    .txn
                    .coupled_op()
                    .expect("erased find couples to the erase op");
                if self.txn_store.op(op).referenced_dup == 0 {
                    // every duplicate is gone
                    return Err(BurrowError::of(ErrorKind::KeyNotFound));
                }
            }
            _ => {}
        }

        let view = self.build_dup_view(name, observer, key, ConflictMode::Error)?;
        if view.is_empty() {
            return Err(BurrowError::of(ErrorKind::KeyNotFound));
        }
        self.position_at_key(name, cid, key, view, 1)?;
        self.cursor_current(name, cid).map(|(_, record)| record)
    }

    pub(crate) fn cursor_move(
        &mut self,
        name: u16,
        cid: CursorId,
        flags: MoveFlags,
    ) -> BurrowResult<(Bytes, Bytes)> {
        self.db_state(name)?;
        self.store.purge_cache();

        let observer = self.databases[&name].cursors.get(cid).txn_id;
        let transactional = self.txns_enabled() || observer.is_some();

        // a nil cursor re-enters at the edge: at the near edge on its
        // first use, at the far edge after running off the end
        let mut flags = flags;
        let (is_nil, first_use) = {
            let state = self.databases[&name].cursors.get(cid);
            (state.is_nil(), state.first_use)
        };
        if is_nil {
            if flags.contains(MoveFlags::NEXT) {
                flags -= MoveFlags::NEXT;
                flags |= if first_use {
                    MoveFlags::FIRST
                } else {
                    MoveFlags::LAST
                };
            } else if flags.contains(MoveFlags::PREVIOUS) {
                flags -= MoveFlags::PREVIOUS;
                flags |= if first_use {
                    MoveFlags::LAST
                } else {
                    MoveFlags::FIRST
                };
            }
        }
        self.databases
            .get_mut(&name)
            .unwrap()
            .cursors
            .get_mut(cid)
            .first_use = false;

        let result = if !transactional {
            self.with_btree(name, |btree, ctx| btree.cursor_move(ctx, cid, flags))
                .map(|()| {
                    let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
                    state.side = CoupledSide::Btree;
                    state.clear_dupecache();
                })
                .and_then(|()| {
                    let key = self.with_btree(name, |btree, ctx| btree.cursor_key(ctx, cid))?;
                    let record =
                        self.with_btree(name, |btree, ctx| btree.cursor_record(ctx, cid))?;
                    Ok((key, record))
                })
        } else {
            self.union_move(name, cid, flags)
        };

        let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
        match &result {
            Ok(_) => {
                state.last_op = if flags.contains(MoveFlags::NEXT) {
                    LastOp::MoveNext
                } else if flags.contains(MoveFlags::PREVIOUS) {
                    LastOp::MovePrevious
                } else {
                    LastOp::None
                };
            }
            Err(_) => {
                state.last_op = LastOp::None;
            }
        }
        self.store.clear_changeset();

        result.map_err(|e| {
            if e.kind() == ErrorKind::KeyErasedInTxn {
                BurrowError::of(ErrorKind::KeyNotFound)
            } else {
                e
            }
        })
    }

    fn union_move(
        &mut self,
        name: u16,
        cid: CursorId,
        flags: MoveFlags,
    ) -> BurrowResult<(Bytes, Bytes)> {
        if flags.contains(MoveFlags::FIRST) {
            self.union_seek(name, cid, None, true)?;
            return self.cursor_current(name, cid);
        }
        if flags.contains(MoveFlags::LAST) {
            self.union_seek(name, cid, None, false)?;
            return self.cursor_current(name, cid);
        }

        let forward = flags.contains(MoveFlags::NEXT);
        if !flags.intersects(MoveFlags::NEXT | MoveFlags::PREVIOUS) {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "move requires a direction flag",
            ));
        }

        // duplicates first
        if !flags.contains(MoveFlags::SKIP_DUPLICATES) {
            self.refresh_dupecache(name, cid)?;
            let stepped = {
                let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
                if state.dupecache.is_empty() {
                    false
                } else if forward && state.dupecache_index < state.dupecache.len() as u32 {
                    state.dupecache_index += 1;
                    true
                } else if !forward && state.dupecache_index > 1 {
                    state.dupecache_index -= 1;
                    true
                } else {
                    false
                }
            };
            if stepped {
                // re-point the active side at the new duplicate
                let key = self.union_current_key(name, cid)?;
                let (view, index) = {
                    let state = self.databases[&name].cursors.get(cid);
                    (state.dupecache.clone(), state.dupecache_index)
                };
                self.position_at_key(name, cid, &key, view, index)?;
                return self.cursor_current(name, cid);
            }
        }
        if flags.contains(MoveFlags::ONLY_DUPLICATES) {
            return Err(BurrowError::of(ErrorKind::KeyNotFound));
        }

        let anchor = self.union_current_key(name, cid)?;
        self.union_seek(name, cid, Some(anchor), forward)?;
        self.cursor_current(name, cid)
    }

    pub(crate) fn cursor_insert(
        &mut self,
        name: u16,
        cid: CursorId,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> DbResult {
        self.db_state(name)?;
        let mut flags = flags;
        let observer = self.databases[&name].cursors.get(cid).txn_id;

        // record-number databases assign the key
        let record_number = self.databases[&name]
            .btree
            .flags
            .contains(DbFlags::RECORD_NUMBER);
        let key: Bytes = if record_number && !flags.contains(InsertFlags::OVERWRITE) {
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
        } else {
            Bytes::copy_from_slice(key)
        };
        self.validate_cursor_key(name, &key)?;
        let record_size = self.databases[&name].btree.record_size;
        if record_size != crate::key::RECORD_SIZE_UNLIMITED
            && record.len() != record_size as usize
        {
            return Err(BurrowError::new(
                ErrorKind::InvalidRecordSize,
                &format!("record size {} instead of {}", record.len(), record_size),
            ));
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
        self.databases
            .get_mut(&name)
            .unwrap()
            .cursors
            .get_mut(cid)
            .first_use = false;

        let transactional = self.txns_enabled() || observer.is_some();
        let result = if transactional {
            let (effective, temporary) = match observer {
                Some(id) => (id, false),
                None => (self.begin_txn(None, TxnFlags::TEMPORARY)?, true),
            };
            let st = self.insert_txn(name, effective, &key, record, flags, Some(cid));
            let st = st.and_then(|()| {
                // the inserting cursor lands on the new op (and, for a
                // duplicate, on its position in the merged view)
                let op = self.databases[&name]
                    .cursors
                    .get(cid)
                    .txn
                    .coupled_op()
                    .expect("insert couples the cursor");
                let view = self.build_dup_view(name, Some(effective), &key, ConflictMode::Error)?;
                let index = view
                    .iter()
                    .position(|line| *line == DupeLine::Txn(op))
                    .map(|i| i as u32 + 1)
                    .unwrap_or(1);
                if view.is_empty() {
                    let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
                    state.side = CoupledSide::Txn;
                    state.clear_dupecache();
                    Ok(())
                } else {
                    self.position_at_key(name, cid, &key, view, index)
                }
            });
            if temporary {
                match &st {
                    Ok(()) => self.txn_commit(effective)?,
                    Err(_) => self.txn_abort(effective)?,
                }
            }
            st
        } else {
            let dup_ref = self.databases[&name].cursors.get(cid).btree.dup();
            let st = self.with_btree(name, |btree, ctx| {
                let (pid, slot, dup) = btree.insert(ctx, &key, record, flags, dup_ref)?;
                btree.cursor_couple_to(ctx, cid, pid, slot, dup)?;
                Ok(dup)
            });
            match st {
                Ok(new_dup) => {
                    {
                        let db = self.databases.get_mut(&name).unwrap();
                        db.cursors.get_mut(cid).side = CoupledSide::Btree;
                        db.cursors.get_mut(cid).clear_dupecache();
                        db.cursors.get_mut(cid).dupecache_index = new_dup;
                    }
                    if new_dup > 0 {
                        self.adjust_btree_dup_siblings(name, cid, &key, new_dup, true)?;
                    }
                    self.sync_db_root(name);
                    self.write_header()?;
                    if self.flags.contains(crate::flags::EnvFlags::ENABLE_RECOVERY) {
                        let lsn = self.txn.next_lsn();
                        self.store.flush_changeset(lsn)?;
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        if result.is_ok() {
            let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
            state.last_op = LastOp::LookupOrInsert;
        }
        self.store.clear_changeset();
        result
    }

    pub(crate) fn cursor_erase(&mut self, name: u16, cid: CursorId) -> DbResult {
        self.db_state(name)?;
        let observer = self.databases[&name].cursors.get(cid).txn_id;
        if self.databases[&name].cursors.get(cid).is_nil() {
            return Err(BurrowError::of(ErrorKind::CursorIsNil));
        }
        self.store.purge_cache();

        let transactional = self.txns_enabled() || observer.is_some();
        let result = if transactional {
            let key = self.union_current_key(name, cid)?;
            let (effective, temporary) = match observer {
                Some(id) => (id, false),
                None => (self.begin_txn(None, TxnFlags::TEMPORARY)?, true),
            };
            let st = self.erase_txn(name, effective, &key, Some(cid));
            if temporary {
                match &st {
                    Ok(()) => self.txn_commit(effective)?,
                    Err(_) => self.txn_abort(effective)?,
                }
            }
            st
        } else {
            let key = self.with_btree(name, |btree, ctx| btree.cursor_key(ctx, cid))?;
            let dup = self.databases[&name].cursors.get(cid).btree.dup();
            let st = self.with_btree(name, |btree, ctx| btree.erase(ctx, &key, dup));
            if st.is_ok() {
                if dup > 0 {
                    self.adjust_btree_dup_siblings(name, cid, &key, dup, false)?;
                } else {
                    self.nil_all_cursors_in_btree(name, Some(cid), &key)?;
                }
                self.sync_db_root(name);
                self.write_header()?;
                if self.flags.contains(crate::flags::EnvFlags::ENABLE_RECOVERY) {
                    let lsn = self.txn.next_lsn();
                    self.store.flush_changeset(lsn)?;
                }
            }
            st
        };

        if result.is_ok() {
            // a successful erase leaves the cursor nil
            self.nil_union_cursor(name, cid)?;
        }
        self.store.clear_changeset();
        result
    }

    pub(crate) fn cursor_overwrite(&mut self, name: u16, cid: CursorId, record: &[u8]) -> DbResult {
        self.db_state(name)?;
        let observer = self.databases[&name].cursors.get(cid).txn_id;
        if self.databases[&name].cursors.get(cid).is_nil() {
            return Err(BurrowError::of(ErrorKind::CursorIsNil));
        }
        self.store.purge_cache();

        let transactional = self.txns_enabled() || observer.is_some();
        let result = if transactional {
            // an overwrite of a foreign active op is a conflict
            let conflicted = {
                let db = &self.databases[&name];
                txn_cursor::has_conflict(&db.cursors, &self.txn_store, &self.txn, cid)
            };
            if conflicted {
                return Err(BurrowError::of(ErrorKind::TxnConflict));
            }
            let key = self.union_current_key(name, cid)?;
            let (effective, temporary) = match observer {
                Some(id) => (id, false),
                None => (self.begin_txn(None, TxnFlags::TEMPORARY)?, true),
            };
            let st = self.insert_txn(
                name,
                effective,
                &key,
                record,
                InsertFlags::OVERWRITE,
                Some(cid),
            );
            if st.is_ok() {
                let db = self.databases.get_mut(&name).unwrap();
                db.cursors.get_mut(cid).side = CoupledSide::Txn;
                db.cursors.get_mut(cid).clear_dupecache();
            }
            if temporary {
                match &st {
                    Ok(()) => self.txn_commit(effective)?,
                    Err(_) => self.txn_abort(effective)?,
                }
            }
            st
        } else {
            let dup = self.databases[&name].cursors.get(cid).btree.dup();
            let st = self.with_btree(name, |btree, ctx| {
                let (pid, slot) = btree.cursor_position(ctx, cid)?;
                btree.overwrite_record_at(ctx, pid, slot, dup, record)
            });
            if st.is_ok() {
                if self.flags.contains(crate::flags::EnvFlags::ENABLE_RECOVERY) {
                    let lsn = self.txn.next_lsn();
                    self.store.flush_changeset(lsn)?;
                }
            }
            st
        };

        if result.is_ok() {
            let state = self.databases.get_mut(&name).unwrap().cursors.get_mut(cid);
            state.last_op = LastOp::LookupOrInsert;
        }
        self.store.clear_changeset();
        result
    }

    pub(crate) fn cursor_dup_count(&mut self, name: u16, cid: CursorId) -> BurrowResult<u32> {
        self.db_state(name)?;
        self.refresh_dupecache(name, cid)?;
        let (cache_len, side) = {
            let state = self.databases[&name].cursors.get(cid);
            (state.dupecache.len(), state.side)
        };
        if cache_len > 0 {
            return Ok(cache_len as u32);
        }
        match side {
            CoupledSide::Nil => Err(BurrowError::of(ErrorKind::CursorIsNil)),
            CoupledSide::Txn => {
                // count across both layers
                let observer = self.databases[&name].cursors.get(cid).txn_id;
                let key = self.union_current_key(name, cid)?;
                let view = self.build_dup_view(name, observer, &key, ConflictMode::Ignore)?;
                Ok(view.len().max(1) as u32)
            }
            CoupledSide::Btree => {
                self.with_btree(name, |btree, ctx| btree.cursor_dup_count(ctx, cid))
            }
        }
    }

    pub(crate) fn cursor_dup_position(&mut self, name: u16, cid: CursorId) -> BurrowResult<u32> {
        self.db_state(name)?;
        let state = self.databases[&name].cursors.get(cid);
        if state.is_nil() {
            return Err(BurrowError::of(ErrorKind::CursorIsNil));
        }
        if state.dupecache_index > 0 {
            return Ok(state.dupecache_index);
        }
        if state.side == CoupledSide::Btree {
            let dup = state.btree.dup();
            return Ok(dup.max(1));
        }
        Ok(1)
    }

    pub(crate) fn cursor_record_size(&mut self, name: u16, cid: CursorId) -> BurrowResult<u64> {
        let (_, record) = self.cursor_current(name, cid)?;
        Ok(record.len() as u64)
    }

    pub(crate) fn cursor_is_pending(&self, name: u16, cid: CursorId) -> BurrowResult<bool> {
        let state = self.db_state(name)?.cursors.get(cid);
        Ok(state.side == CoupledSide::Txn && !state.txn.is_nil())
    }

    fn validate_cursor_key(&self, name: u16, key: &[u8]) -> DbResult {
        let db = self.db_state(name)?;
        let key_size = db.btree.key_size;
        if key_size != crate::key::KEY_SIZE_UNLIMITED && key.len() != key_size as usize {
            return Err(BurrowError::new(
                ErrorKind::InvalidKeySize,
                &format!("key size {} instead of {}", key.len(), key_size),
            ));
        }
        if key.len() > self.config.page_size as usize / 4 {
            return Err(BurrowError::new(
                ErrorKind::InvalidKeySize,
                "key too large for the page size",
            ));
        }
        Ok(())
    }

    /// After a physical duplicate insert/erase at `dup`, sibling cursors
    /// standing on the same key shift their duplicate position.
    fn adjust_btree_dup_siblings(
        &mut self,
        name: u16,
        current: CursorId,
        key: &Bytes,
        dup: u32,
        inserted: bool,
    ) -> DbResult {
        let ids = self.databases[&name].cursors.ids();
        for other in ids {
            if other == current {
                continue;
            }
            let points_to = {
                let db = self.databases.get_mut(&name).unwrap();
                let state = db.cursors.get(other);
                if state.is_nil() {
                    false
                } else {
                    let mut ctx = BtreeContext {
                        store: &mut self.store,
                        blobs: &mut self.blobs,
                        cursors: &mut db.cursors,
                    };
                    db.btree.cursor_points_to_key(&mut ctx, other, key)?
                }
            };
            if !points_to {
                continue;
            }
            let db = self.databases.get_mut(&name).unwrap();
            let state = db.cursors.get_mut(other);
            let other_dup = state.btree.dup();
            if inserted {
                if other_dup >= dup {
                    state.btree.set_dup(other_dup + 1);
                }
                if state.dupecache_index >= dup {
                    state.dupecache_index += 1;
                    state.dupecache.clear();
                }
            } else {
                if other_dup > dup {
                    state.btree.set_dup(other_dup - 1);
                }
                if state.dupecache_index > dup {
                    state.dupecache_index -= 1;
                    state.dupecache.clear();
                }
            }
        }
        Ok(())
    }
}
