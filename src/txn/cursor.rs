//! Operations of the transaction subcursor: coupling to ops, the
//! newest-to-oldest visibility walk, and ordered movement over the
//! transaction index.

use crate::cursor::{CursorArena, CursorId, TxnCursorState};
use crate::error::{BurrowError, BurrowResult, ErrorKind};
use crate::flags::{FindFlags, MoveFlags};
use crate::txn::index::{NodeId, OpKind, TxnIndex, TxnStore};
use crate::txn::TxnManager;

/// Couple a cursor to an op, threading it into the op's cursor list.
pub fn couple_to_op(cursors: &mut CursorArena, store: &mut TxnStore, cid: CursorId, op: usize) {
    set_to_nil(cursors, store, cid);
    store.op_mut(op).cursor_list.push(cid);
    cursors.get_mut(cid).txn = TxnCursorState::Coupled(op);
}

/// Nil the transaction subcursor, removing it from its op's cursor list.
pub fn set_to_nil(cursors: &mut CursorArena, store: &mut TxnStore, cid: CursorId) {
    if let TxnCursorState::Coupled(op) = cursors.get(cid).txn {
        let list = &mut store.op_mut(op).cursor_list;
        if let Some(pos) = list.iter().position(|&c| c == cid) {
            list.swap_remove(pos);
        }
        cursors.get_mut(cid).txn = TxnCursorState::Nil;
    }
}

/// Walk a node's ops newest to oldest and couple to the newest visible
/// one.
///
/// - an insert-class op ends the walk with success
/// - an erase op ends it with `KeyErasedInTxn` (the cursor still couples,
///   the caller needs to know which key was erased)
/// - an op of a foreign active transaction ends it with `TxnConflict`
///   unless `ignore_conflicts` is set
/// - aborted and flushed ops are skipped
pub fn move_top_in_node(
    cursors: &mut CursorArena,
    store: &mut TxnStore,
    mgr: &TxnManager,
    cid: CursorId,
    node_id: NodeId,
    ignore_conflicts: bool,
) -> BurrowResult<()> {
    let observer = cursors.get(cid).txn_id;
    let mut current = store.node(node_id).newest_op;

    while let Some(op_id) = current {
        let (txn_id, kind, flushed, prev) = {
            let op = store.op(op_id);
            (op.txn_id, op.kind, op.flushed, op.node_prev)
        };
        let optxn = mgr.get(txn_id);
        let aborted = optxn.map(|t| t.is_aborted()).unwrap_or(false);
        let committed = optxn.map(|t| t.is_committed()).unwrap_or(true);

        if flushed || aborted {
            // skip
        } else if !committed && Some(txn_id) != observer && observer.is_none() {
            // uncommitted foreign work is invisible to a
            // non-transactional observer
        } else if committed || Some(txn_id) == observer {
            match kind {
                OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate => {
                    couple_to_op(cursors, store, cid, op_id);
                    return Ok(());
                }
                OpKind::Erase => {
                    couple_to_op(cursors, store, cid, op_id);
                    return Err(BurrowError::of(ErrorKind::KeyErasedInTxn));
                }
                OpKind::Nop => {}
            }
        } else if !ignore_conflicts {
            couple_to_op(cursors, store, cid, op_id);
            return Err(BurrowError::of(ErrorKind::TxnConflict));
        }

        current = prev;
    }

    Err(BurrowError::of(ErrorKind::KeyNotFound))
}

/// Position the subcursor on `key` (or a neighbour when approximate
/// matching is requested and the exact key was erased).
pub fn find(
    cursors: &mut CursorArena,
    store: &mut TxnStore,
    mgr: &TxnManager,
    index: &TxnIndex,
    cid: CursorId,
    key: &[u8],
    flags: FindFlags,
) -> BurrowResult<()> {
    set_to_nil(cursors, store, cid);

    let mut node = match index.get(key, flags) {
        Some((node, _)) => node,
        None => return Err(BurrowError::of(ErrorKind::KeyNotFound)),
    };

    loop {
        match move_top_in_node(cursors, store, mgr, cid, node, false) {
            Err(e) if e.kind() == ErrorKind::KeyErasedInTxn => {
                // erased; with approximate matching move on to a sibling
                let node_key = store.node(node).key.clone();
                let sibling = if flags.contains(FindFlags::GT) {
                    index.next_sibling(&node_key)
                } else if flags.contains(FindFlags::LT) {
                    index.previous_sibling(&node_key)
                } else {
                    return Err(e);
                };
                match sibling {
                    Some(next) => node = next,
                    None => return Err(BurrowError::of(ErrorKind::KeyNotFound)),
                }
            }
            other => return other,
        }
    }
}

/// Ordered movement over the transaction index. `NEXT`/`PREVIOUS` skip
/// conflicting nodes; `FIRST`/`LAST` report them.
pub fn cursor_move(
    cursors: &mut CursorArena,
    store: &mut TxnStore,
    mgr: &TxnManager,
    index: &TxnIndex,
    cid: CursorId,
    flags: MoveFlags,
) -> BurrowResult<()> {
    if flags.contains(MoveFlags::FIRST) {
        set_to_nil(cursors, store, cid);
        let node = index
            .first()
            .ok_or_else(|| BurrowError::of(ErrorKind::KeyNotFound))?;
        return move_top_in_node(cursors, store, mgr, cid, node, false);
    }
    if flags.contains(MoveFlags::LAST) {
        set_to_nil(cursors, store, cid);
        let node = index
            .last()
            .ok_or_else(|| BurrowError::of(ErrorKind::KeyNotFound))?;
        return move_top_in_node(cursors, store, mgr, cid, node, false);
    }

    let op = cursors
        .get(cid)
        .txn
        .coupled_op()
        .ok_or_else(|| BurrowError::of(ErrorKind::CursorIsNil))?;
    let mut key = store.node(store.op(op).node).key.clone();

    loop {
        let sibling = if flags.contains(MoveFlags::NEXT) {
            index.next_sibling(&key)
        } else {
            index.previous_sibling(&key)
        };
        let node = match sibling {
            Some(node) => node,
            None => return Err(BurrowError::of(ErrorKind::KeyNotFound)),
        };
        match move_top_in_node(cursors, store, mgr, cid, node, true) {
            Err(e) if e.kind() == ErrorKind::KeyNotFound => {
                key = store.node(node).key.clone();
            }
            other => return other,
        }
    }
}

/// `true` when the coupled op belongs to a foreign transaction that is
/// still active.
pub fn has_conflict(
    cursors: &CursorArena,
    store: &TxnStore,
    mgr: &TxnManager,
    cid: CursorId,
) -> bool {
    let state = cursors.get(cid);
    if let TxnCursorState::Coupled(op) = state.txn {
        let txn_id = store.op(op).txn_id;
        if Some(txn_id) != state.txn_id {
            if let Some(optxn) = mgr.get(txn_id) {
                return optxn.is_active();
            }
        }
    }
    false
}
