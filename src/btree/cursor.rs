//! The B+tree subcursor.
//!
//! A cursor is nil, coupled (pinned to a live page slot and threaded
//! into that page's cursor list) or uncoupled (owning a copy of the key
//! it last pointed at). Every page mutation that can shift slots runs
//! through the adjustment helpers here, so coupled cursors either follow
//! their item or degrade to the uncoupled state.

use bytes::Bytes;

use super::{Btree, BtreeContext};
use crate::cursor::CursorId;
use crate::error::{BurrowError, BurrowResult, ErrorKind};
use crate::flags::{FindFlags, MoveFlags};
use crate::key::ApproxMatch;
use crate::page::PageId;
use crate::record::RecordLocator;
use crate::utils::HandyRwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtreeCursorState {
    Nil,
    Coupled {
        pid: PageId,
        slot: usize,
        /// 1-based duplicate position; 0 = the key as a whole
        dup: u32,
    },
    Uncoupled {
        key: Bytes,
        dup: u32,
    },
}

impl BtreeCursorState {
    pub fn is_nil(&self) -> bool {
        *self == BtreeCursorState::Nil
    }

    pub fn is_coupled(&self) -> bool {
        matches!(self, BtreeCursorState::Coupled { .. })
    }

    pub fn is_uncoupled(&self) -> bool {
        matches!(self, BtreeCursorState::Uncoupled { .. })
    }

    pub fn dup(&self) -> u32 {
        match self {
            BtreeCursorState::Nil => 0,
            BtreeCursorState::Coupled { dup, .. } => *dup,
            BtreeCursorState::Uncoupled { dup, .. } => *dup,
        }
    }

    pub fn set_dup(&mut self, new_dup: u32) {
        match self {
            BtreeCursorState::Nil => {}
            BtreeCursorState::Coupled { dup, .. } => *dup = new_dup,
            BtreeCursorState::Uncoupled { dup, .. } => *dup = new_dup,
        }
    }
}

impl Btree {
    // ------------------------------------------------------------------
    // state transitions
    // ------------------------------------------------------------------

    pub fn cursor_couple_to(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
        pid: PageId,
        slot: usize,
        dup: u32,
    ) -> BurrowResult<()> {
        self.cursor_set_to_nil(ctx, cid)?;
        let page = ctx.store.fetch_leaf(pid)?;
        page.wl().add_cursor(cid);
        ctx.cursors.get_mut(cid).btree = BtreeCursorState::Coupled { pid, slot, dup };
        Ok(())
    }

    pub fn cursor_set_to_nil(&self, ctx: &mut BtreeContext, cid: CursorId) -> BurrowResult<()> {
        if let BtreeCursorState::Coupled { pid, .. } = ctx.cursors.get(cid).btree {
            let page = ctx.store.fetch_leaf(pid)?;
            page.wl().remove_cursor(cid);
        }
        ctx.cursors.get_mut(cid).btree = BtreeCursorState::Nil;
        Ok(())
    }

    /// Re-run an exact find on the snapshot key and couple to the
    /// result, restoring the saved duplicate position.
    pub fn cursor_re_couple(&self, ctx: &mut BtreeContext, cid: CursorId) -> BurrowResult<()> {
        let (key, dup) = match ctx.cursors.get(cid).btree.clone() {
            BtreeCursorState::Uncoupled { key, dup } => (key, dup),
            BtreeCursorState::Coupled { .. } => return Ok(()),
            BtreeCursorState::Nil => return Err(BurrowError::of(ErrorKind::CursorIsNil)),
        };
        let (pid, slot, _) = self.find_position(ctx, &key, FindFlags::EXACT)?;
        self.cursor_couple_to(ctx, cid, pid, slot, dup)
    }

    /// Uncouple every cursor coupled to `pid` at a slot at or beyond
    /// `from_slot`. Called before any split or merge that shifts the
    /// page's item layout; cursors strictly left of the split point stay
    /// coupled.
    pub fn uncouple_all_cursors(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        from_slot: usize,
    ) -> BurrowResult<()> {
        let page = ctx.store.fetch_leaf(pid)?;
        let snapshot: Vec<CursorId> = page.rl().cursor_list().to_vec();
        for cid in snapshot {
            let state = ctx.cursors.get(cid).btree.clone();
            if let BtreeCursorState::Coupled { slot, dup, .. } = state {
                if slot >= from_slot {
                    let key = page.rl().item(slot).key.clone();
                    page.wl().remove_cursor(cid);
                    ctx.cursors.get_mut(cid).btree = BtreeCursorState::Uncoupled { key, dup };
                }
            }
        }
        Ok(())
    }

    /// Keep coupled cursors pointing at their item after an in-page
    /// insert at `pos`.
    pub fn adjust_cursors_on_insert(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        pos: usize,
    ) -> BurrowResult<()> {
        let page = ctx.store.fetch_leaf(pid)?;
        let snapshot: Vec<CursorId> = page.rl().cursor_list().to_vec();
        for cid in snapshot {
            if let BtreeCursorState::Coupled { slot, .. } = &mut ctx.cursors.get_mut(cid).btree {
                if *slot >= pos {
                    *slot += 1;
                }
            }
        }
        Ok(())
    }

    /// Keep coupled cursors consistent after the item at `pos` was
    /// removed: cursors on the removed slot uncouple (the key is gone,
    /// they keep its copy), cursors to the right shift left.
    pub fn adjust_cursors_on_erase(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        pos: usize,
        erased_key: &Bytes,
    ) -> BurrowResult<()> {
        let page = ctx.store.fetch_leaf(pid)?;
        let snapshot: Vec<CursorId> = page.rl().cursor_list().to_vec();
        for cid in snapshot {
            let state = ctx.cursors.get(cid).btree.clone();
            if let BtreeCursorState::Coupled { slot, dup, .. } = state {
                if slot == pos {
                    page.wl().remove_cursor(cid);
                    ctx.cursors.get_mut(cid).btree = BtreeCursorState::Uncoupled {
                        key: erased_key.clone(),
                        dup,
                    };
                } else if slot > pos {
                    if let BtreeCursorState::Coupled { slot, .. } =
                        &mut ctx.cursors.get_mut(cid).btree
                    {
                        *slot -= 1;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // queries on the current position
    // ------------------------------------------------------------------

    /// The coupled position, re-coupling first if needed.
    pub fn cursor_position(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
    ) -> BurrowResult<(PageId, usize)> {
        if ctx.cursors.get(cid).btree.is_uncoupled() {
            self.cursor_re_couple(ctx, cid)?;
        }
        match ctx.cursors.get(cid).btree {
            BtreeCursorState::Coupled { pid, slot, .. } => Ok((pid, slot)),
            _ => Err(BurrowError::of(ErrorKind::CursorIsNil)),
        }
    }

    pub fn cursor_key(&self, ctx: &mut BtreeContext, cid: CursorId) -> BurrowResult<Bytes> {
        match ctx.cursors.get(cid).btree.clone() {
            BtreeCursorState::Coupled { pid, slot, .. } => {
                let page = ctx.store.fetch_leaf(pid)?;
                let key = page.rl().item(slot).key.clone();
                Ok(key)
            }
            BtreeCursorState::Uncoupled { key, .. } => Ok(key),
            BtreeCursorState::Nil => Err(BurrowError::of(ErrorKind::CursorIsNil)),
        }
    }

    pub fn cursor_record(&self, ctx: &mut BtreeContext, cid: CursorId) -> BurrowResult<Bytes> {
        let dup = ctx.cursors.get(cid).btree.dup();
        let (pid, slot) = self.cursor_position(ctx, cid)?;
        self.read_record_at(ctx, pid, slot, dup)
    }

    pub fn cursor_dup_count(&self, ctx: &mut BtreeContext, cid: CursorId) -> BurrowResult<u32> {
        let (pid, slot) = self.cursor_position(ctx, cid)?;
        self.dup_count_at(ctx, pid, slot)
    }

    /// Whether the cursor currently stands on `key`.
    pub fn cursor_points_to_key(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
        key: &[u8],
    ) -> BurrowResult<bool> {
        match ctx.cursors.get(cid).btree.clone() {
            BtreeCursorState::Coupled { pid, slot, .. } => {
                let page = ctx.store.fetch_leaf(pid)?;
                let equal = self
                    .key_type
                    .compare(&page.rl().item(slot).key, key)
                    == std::cmp::Ordering::Equal;
                Ok(equal)
            }
            BtreeCursorState::Uncoupled { key: own, .. } => {
                Ok(self.key_type.compare(&own, key) == std::cmp::Ordering::Equal)
            }
            BtreeCursorState::Nil => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // find / move
    // ------------------------------------------------------------------

    pub fn cursor_find(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<ApproxMatch> {
        let (pid, slot, approx) = self.find_position(ctx, key, flags)?;
        let dup = self.initial_dup_forward(ctx, pid, slot)?;
        self.cursor_couple_to(ctx, cid, pid, slot, dup)?;
        Ok(approx)
    }

    pub fn cursor_move(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
        flags: MoveFlags,
    ) -> BurrowResult<()> {
        if flags.contains(MoveFlags::FIRST) {
            return self.cursor_move_first(ctx, cid);
        }
        if flags.contains(MoveFlags::LAST) {
            return self.cursor_move_last(ctx, cid);
        }

        if ctx.cursors.get(cid).btree.is_nil() {
            return Err(BurrowError::of(ErrorKind::CursorIsNil));
        }
        if ctx.cursors.get(cid).btree.is_uncoupled() {
            // the key may have been erased meanwhile; land on the
            // nearest neighbour in the movement direction
            if let Err(e) = self.cursor_re_couple(ctx, cid) {
                if e.kind() != ErrorKind::KeyNotFound {
                    return Err(e);
                }
                return self.cursor_re_couple_approx(ctx, cid, flags);
            }
        }

        if flags.contains(MoveFlags::NEXT) {
            self.cursor_move_next(ctx, cid, flags)
        } else if flags.contains(MoveFlags::PREVIOUS) {
            self.cursor_move_previous(ctx, cid, flags)
        } else {
            Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "move requires a direction flag",
            ))
        }
    }

    fn cursor_move_first(&self, ctx: &mut BtreeContext, cid: CursorId) -> BurrowResult<()> {
        let mut pid = self.leftmost_leaf(ctx)?;
        loop {
            let page = ctx.store.fetch_leaf(pid)?;
            let (count, right) = {
                let p = page.rl();
                (p.item_count(), p.get_right_pid())
            };
            if count > 0 {
                let dup = self.initial_dup_forward(ctx, pid, 0)?;
                return self.cursor_couple_to(ctx, cid, pid, 0, dup);
            }
            match right {
                Some(next) => pid = next,
                None => return Err(BurrowError::of(ErrorKind::KeyNotFound)),
            }
        }
    }

    fn cursor_move_last(&self, ctx: &mut BtreeContext, cid: CursorId) -> BurrowResult<()> {
        let mut pid = self.rightmost_leaf(ctx)?;
        loop {
            let page = ctx.store.fetch_leaf(pid)?;
            let (count, left) = {
                let p = page.rl();
                (p.item_count(), p.get_left_pid())
            };
            if count > 0 {
                let slot = count - 1;
                let dup = self.initial_dup_backward(ctx, pid, slot)?;
                return self.cursor_couple_to(ctx, cid, pid, slot, dup);
            }
            match left {
                Some(prev) => pid = prev,
                None => return Err(BurrowError::of(ErrorKind::KeyNotFound)),
            }
        }
    }

    fn cursor_move_next(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
        flags: MoveFlags,
    ) -> BurrowResult<()> {
        let (pid, slot, dup) = match ctx.cursors.get(cid).btree {
            BtreeCursorState::Coupled { pid, slot, dup } => (pid, slot, dup),
            _ => return Err(BurrowError::of(ErrorKind::CursorIsNil)),
        };

        // step within the duplicate list first
        if !flags.contains(MoveFlags::SKIP_DUPLICATES) {
            let dcount = self.dup_count_at(ctx, pid, slot)?;
            if dup > 0 && dup < dcount {
                ctx.cursors.get_mut(cid).btree.set_dup(dup + 1);
                return Ok(());
            }
        }
        if flags.contains(MoveFlags::ONLY_DUPLICATES) {
            return Err(BurrowError::of(ErrorKind::KeyNotFound));
        }

        match self.next_position(ctx, pid, slot)? {
            Some((npid, nslot)) => {
                let dup = self.initial_dup_forward(ctx, npid, nslot)?;
                self.cursor_couple_to(ctx, cid, npid, nslot, dup)
            }
            None => Err(BurrowError::of(ErrorKind::KeyNotFound)),
        }
    }

    fn cursor_move_previous(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
        flags: MoveFlags,
    ) -> BurrowResult<()> {
        let (pid, slot, dup) = match ctx.cursors.get(cid).btree {
            BtreeCursorState::Coupled { pid, slot, dup } => (pid, slot, dup),
            _ => return Err(BurrowError::of(ErrorKind::CursorIsNil)),
        };

        if !flags.contains(MoveFlags::SKIP_DUPLICATES) && dup > 1 {
            ctx.cursors.get_mut(cid).btree.set_dup(dup - 1);
            return Ok(());
        }
        if flags.contains(MoveFlags::ONLY_DUPLICATES) {
            return Err(BurrowError::of(ErrorKind::KeyNotFound));
        }

        match self.previous_position(ctx, pid, slot)? {
            Some((ppid, pslot)) => {
                let dup = self.initial_dup_backward(ctx, ppid, pslot)?;
                self.cursor_couple_to(ctx, cid, ppid, pslot, dup)
            }
            None => Err(BurrowError::of(ErrorKind::KeyNotFound)),
        }
    }

    /// The uncoupled key no longer exists; land on its neighbour in the
    /// direction of travel.
    fn cursor_re_couple_approx(
        &self,
        ctx: &mut BtreeContext,
        cid: CursorId,
        flags: MoveFlags,
    ) -> BurrowResult<()> {
        let key = match ctx.cursors.get(cid).btree.clone() {
            BtreeCursorState::Uncoupled { key, .. } => key,
            _ => return Err(BurrowError::of(ErrorKind::CursorIsNil)),
        };
        let direction = if flags.contains(MoveFlags::NEXT) {
            FindFlags::GT
        } else {
            FindFlags::LT
        };
        let (pid, slot, _) = self.find_position(ctx, &key, direction)?;
        let dup = if flags.contains(MoveFlags::NEXT) {
            self.initial_dup_forward(ctx, pid, slot)?
        } else {
            self.initial_dup_backward(ctx, pid, slot)?
        };
        self.cursor_couple_to(ctx, cid, pid, slot, dup)
    }

    /// Duplicate position when a key is entered moving forward.
    fn initial_dup_forward(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
    ) -> BurrowResult<u32> {
        let page = ctx.store.fetch_leaf(pid)?;
        let has_dups = matches!(page.rl().item(slot).locator, RecordLocator::DupList(_));
        Ok(if has_dups { 1 } else { 0 })
    }

    /// Duplicate position when a key is entered moving backward.
    fn initial_dup_backward(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
    ) -> BurrowResult<u32> {
        let count = self.dup_count_at(ctx, pid, slot)?;
        Ok(if count > 1 { count } else { 0 })
    }
}
