//! The on-disk B+tree index: ordered search, insert with split
//! propagation, erase with borrow/merge rebalancing, duplicate lists,
//! and integrity checking.

pub mod cursor;

use std::cmp::Ordering;

use bytes::Bytes;
use log::debug;

use crate::blob::BlobManager;
use crate::cursor::CursorArena;
use crate::error::{BurrowError, BurrowResult, DbResult, ErrorKind};
use crate::flags::{DbFlags, FindFlags, InsertFlags};
use crate::key::{ApproxMatch, KeyType};
use crate::page::{InternalEntry, InternalPage, LeafItem, LeafPage, PageId, EMPTY_PAGE_ID};
use crate::page_store::{NodeRef, PageStore};
use crate::record::{DupList, RecordLocator, FORCED_INLINE_MAX, INLINE_RECORD_MAX};
use crate::types::Pod;
use crate::utils::HandyRwLock;

/// Everything a B+tree operation needs besides the tree handle itself.
/// The fields are split borrows of the environment, so tree code can
/// touch pages, blobs and cursors at the same time.
pub struct BtreeContext<'a> {
    pub store: &'a mut PageStore,
    pub blobs: &'a mut BlobManager,
    pub cursors: &'a mut CursorArena,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Hint {
    None,
    Append,
    Prepend,
}

/// The handle of one database's index.
pub struct Btree {
    pub root_pid: PageId,
    pub key_type: KeyType,
    pub key_size: u16,
    pub record_size: u32,
    pub flags: DbFlags,
}

impl Btree {
    pub fn new(key_type: KeyType, key_size: u16, record_size: u32, flags: DbFlags) -> Self {
        Self {
            root_pid: EMPTY_PAGE_ID,
            key_type,
            key_size,
            record_size,
            flags,
        }
    }

    /// Allocate the initial (empty leaf) root.
    pub fn create_root(&mut self, ctx: &mut BtreeContext) -> DbResult {
        let root = ctx.store.allocate_leaf()?;
        self.root_pid = root.rl().get_pid();
        Ok(())
    }

    // ------------------------------------------------------------------
    // descent
    // ------------------------------------------------------------------

    /// Walk from the root to the leaf where `key` belongs, refreshing
    /// parent pointers along the path. Parent pointers are only valid
    /// for pages of the most recent descent; every operation descends
    /// before it mutates.
    fn descend_to_leaf(
        &self,
        ctx: &mut BtreeContext,
        key: &[u8],
        hint: Hint,
    ) -> BurrowResult<Pod<LeafPage>> {
        let mut pid = self.root_pid;
        let mut parent = EMPTY_PAGE_ID;
        loop {
            match ctx.store.fetch_node(pid)? {
                NodeRef::Leaf(page) => {
                    page.wl().set_parent_pid(parent);
                    let misrouted = {
                        let p = page.rl();
                        match hint {
                            Hint::None => false,
                            Hint::Append => {
                                p.item_count() > 0
                                    && self.key_type.compare(key, &p.item(0).key)
                                        == Ordering::Less
                            }
                            Hint::Prepend => {
                                p.item_count() > 0
                                    && self
                                        .key_type
                                        .compare(key, &p.item(p.item_count() - 1).key)
                                        == Ordering::Greater
                            }
                        }
                    };
                    if misrouted {
                        return self.descend_to_leaf(ctx, key, Hint::None);
                    }
                    return Ok(page);
                }
                NodeRef::Internal(page) => {
                    page.wl().set_parent_pid(parent);
                    parent = pid;
                    let p = page.rl();
                    pid = match hint {
                        Hint::Append => {
                            if p.entry_count() > 0 {
                                p.entry(p.entry_count() - 1).child
                            } else {
                                p.get_ptr_down()
                            }
                        }
                        Hint::Prepend => p.get_ptr_down(),
                        Hint::None => p.find_child(self.key_type, key).1,
                    };
                }
            }
        }
    }

    pub fn leftmost_leaf(&self, ctx: &mut BtreeContext) -> BurrowResult<PageId> {
        let mut pid = self.root_pid;
        loop {
            match ctx.store.fetch_node(pid)? {
                NodeRef::Leaf(_) => return Ok(pid),
                NodeRef::Internal(page) => {
                    let down = page.rl().get_ptr_down();
                    pid = down;
                }
            }
        }
    }

    pub fn rightmost_leaf(&self, ctx: &mut BtreeContext) -> BurrowResult<PageId> {
        let mut pid = self.root_pid;
        loop {
            match ctx.store.fetch_node(pid)? {
                NodeRef::Leaf(_) => return Ok(pid),
                NodeRef::Internal(page) => {
                    let p = page.rl();
                    pid = if p.entry_count() > 0 {
                        p.entry(p.entry_count() - 1).child
                    } else {
                        p.get_ptr_down()
                    };
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // find
    // ------------------------------------------------------------------

    /// Locate `key` (or its neighbour under approximate matching) and
    /// report the position together with the match tag.
    pub fn find_position(
        &self,
        ctx: &mut BtreeContext,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<(PageId, usize, ApproxMatch)> {
        let leaf = self.descend_to_leaf(ctx, key, Hint::None)?;
        let pid = leaf.rl().get_pid();
        let lookup = leaf.rl().find_slot(self.key_type, key);

        match lookup {
            Ok(slot) => {
                if flags.contains(FindFlags::EXACT) || flags.is_empty() {
                    return Ok((pid, slot, ApproxMatch::Exact));
                }
                // strict neighbour requested
                if flags.contains(FindFlags::GT) {
                    match self.next_position(ctx, pid, slot)? {
                        Some((npid, nslot)) => Ok((npid, nslot, ApproxMatch::Gt)),
                        None => Err(BurrowError::of(ErrorKind::KeyNotFound)),
                    }
                } else {
                    match self.previous_position(ctx, pid, slot)? {
                        Some((ppid, pslot)) => Ok((ppid, pslot, ApproxMatch::Lt)),
                        None => Err(BurrowError::of(ErrorKind::KeyNotFound)),
                    }
                }
            }
            Err(pos) => {
                if flags.contains(FindFlags::LT) {
                    if pos > 0 {
                        return Ok((pid, pos - 1, ApproxMatch::Lt));
                    }
                    return match self.previous_position(ctx, pid, 0)? {
                        Some((ppid, pslot)) => Ok((ppid, pslot, ApproxMatch::Lt)),
                        None => Err(BurrowError::of(ErrorKind::KeyNotFound)),
                    };
                }
                if flags.contains(FindFlags::GT) {
                    let count = {
                        let page = ctx.store.fetch_leaf(pid)?;
                        let c = page.rl().item_count();
                        c
                    };
                    if pos < count {
                        return Ok((pid, pos, ApproxMatch::Gt));
                    }
                    // first item of the following leaves
                    return match self.skip_right_from(ctx, pid)? {
                        Some((npid, nslot)) => Ok((npid, nslot, ApproxMatch::Gt)),
                        None => Err(BurrowError::of(ErrorKind::KeyNotFound)),
                    };
                }
                Err(BurrowError::of(ErrorKind::KeyNotFound))
            }
        }
    }

    /// Point lookup returning the matched key, its record and the match
    /// tag. Under `dup` addressing the first duplicate is returned.
    pub fn find(
        &self,
        ctx: &mut BtreeContext,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<(Bytes, Bytes, ApproxMatch)> {
        let (pid, slot, approx) = self.find_position(ctx, key, flags)?;
        let page = ctx.store.fetch_leaf(pid)?;
        let found_key = page.rl().item(slot).key.clone();
        let record = self.read_record_at(ctx, pid, slot, 0)?;
        Ok((found_key, record, approx))
    }

    /// The first populated position of the tree.
    pub fn first_position(&self, ctx: &mut BtreeContext) -> BurrowResult<Option<(PageId, usize)>> {
        let pid = self.leftmost_leaf(ctx)?;
        let page = ctx.store.fetch_leaf(pid)?;
        let count = page.rl().item_count();
        drop(page);
        if count > 0 {
            Ok(Some((pid, 0)))
        } else {
            self.skip_right_from(ctx, pid)
        }
    }

    /// The last populated position of the tree.
    pub fn last_position(&self, ctx: &mut BtreeContext) -> BurrowResult<Option<(PageId, usize)>> {
        let mut pid = self.rightmost_leaf(ctx)?;
        loop {
            let page = ctx.store.fetch_leaf(pid)?;
            let (count, left) = {
                let p = page.rl();
                (p.item_count(), p.get_left_pid())
            };
            if count > 0 {
                return Ok(Some((pid, count - 1)));
            }
            match left {
                Some(prev) => pid = prev,
                None => return Ok(None),
            }
        }
    }

    pub fn key_at(&self, ctx: &mut BtreeContext, pid: PageId, slot: usize) -> BurrowResult<Bytes> {
        let page = ctx.store.fetch_leaf(pid)?;
        let key = page.rl().item(slot).key.clone();
        Ok(key)
    }

    /// The position after (pid, slot), skipping empty leaves.
    pub fn next_position(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
    ) -> BurrowResult<Option<(PageId, usize)>> {
        let page = ctx.store.fetch_leaf(pid)?;
        let count = page.rl().item_count();
        if slot + 1 < count {
            return Ok(Some((pid, slot + 1)));
        }
        self.skip_right_from(ctx, pid)
    }

    fn skip_right_from(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
    ) -> BurrowResult<Option<(PageId, usize)>> {
        let mut next = {
            let page = ctx.store.fetch_leaf(pid)?;
            let n = page.rl().get_right_pid();
            n
        };
        while let Some(npid) = next {
            let page = ctx.store.fetch_leaf(npid)?;
            let (count, right) = {
                let p = page.rl();
                (p.item_count(), p.get_right_pid())
            };
            if count > 0 {
                return Ok(Some((npid, 0)));
            }
            next = right;
        }
        Ok(None)
    }

    /// The position before (pid, slot), skipping empty leaves.
    pub fn previous_position(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
    ) -> BurrowResult<Option<(PageId, usize)>> {
        if slot > 0 {
            return Ok(Some((pid, slot - 1)));
        }
        let mut prev = {
            let page = ctx.store.fetch_leaf(pid)?;
            let p = page.rl().get_left_pid();
            p
        };
        while let Some(ppid) = prev {
            let page = ctx.store.fetch_leaf(ppid)?;
            let (count, left) = {
                let p = page.rl();
                (p.item_count(), p.get_left_pid())
            };
            if count > 0 {
                return Ok(Some((ppid, count - 1)));
            }
            prev = left;
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // records
    // ------------------------------------------------------------------

    fn make_single_locator(
        &self,
        ctx: &mut BtreeContext,
        record: &[u8],
    ) -> BurrowResult<RecordLocator> {
        let inline_limit = if self.flags.contains(DbFlags::FORCE_RECORDS_INLINE) {
            FORCED_INLINE_MAX
        } else {
            INLINE_RECORD_MAX
        };
        if record.len() <= inline_limit {
            Ok(RecordLocator::Inline(Bytes::copy_from_slice(record)))
        } else {
            Ok(RecordLocator::Blob(ctx.blobs.allocate(ctx.store, record)))
        }
    }

    fn read_single_locator(
        &self,
        ctx: &mut BtreeContext,
        locator: &RecordLocator,
    ) -> BurrowResult<Bytes> {
        match locator {
            RecordLocator::Inline(data) => Ok(data.clone()),
            RecordLocator::Blob(id) => ctx.blobs.read(ctx.store, *id),
            RecordLocator::DupList(_) => Err(BurrowError::new(
                ErrorKind::IntegrityViolated,
                "nested duplicate list",
            )),
        }
    }

    fn free_single_locator(&self, ctx: &mut BtreeContext, locator: &RecordLocator) -> DbResult {
        if let RecordLocator::Blob(id) = locator {
            ctx.blobs.free(ctx.store, *id)?;
        }
        Ok(())
    }

    fn free_locator(&self, ctx: &mut BtreeContext, locator: &RecordLocator) -> DbResult {
        match locator {
            RecordLocator::Inline(_) => Ok(()),
            RecordLocator::Blob(id) => ctx.blobs.free(ctx.store, *id),
            RecordLocator::DupList(id) => {
                let list = DupList::decode(&ctx.blobs.read(ctx.store, *id)?);
                for entry in &list.entries {
                    self.free_single_locator(ctx, entry)?;
                }
                ctx.blobs.free(ctx.store, *id)
            }
        }
    }

    /// Read the record at (pid, slot); `dup` addresses a 1-based
    /// duplicate, 0 means the first.
    pub fn read_record_at(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
        dup: u32,
    ) -> BurrowResult<Bytes> {
        let locator = {
            let page = ctx.store.fetch_leaf(pid)?;
            let l = page.rl().item(slot).locator.clone();
            l
        };
        match locator {
            RecordLocator::DupList(id) => {
                let list = DupList::decode(&ctx.blobs.read(ctx.store, id)?);
                let idx = if dup == 0 { 0 } else { dup as usize - 1 };
                let entry = list.entries.get(idx).ok_or_else(|| {
                    BurrowError::of(ErrorKind::KeyNotFound)
                })?;
                self.read_single_locator(ctx, &entry.clone())
            }
            other => self.read_single_locator(ctx, &other),
        }
    }

    pub fn dup_count_at(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
    ) -> BurrowResult<u32> {
        let locator = {
            let page = ctx.store.fetch_leaf(pid)?;
            let l = page.rl().item(slot).locator.clone();
            l
        };
        match locator {
            RecordLocator::DupList(id) => {
                let list = DupList::decode(&ctx.blobs.read(ctx.store, id)?);
                Ok(list.entries.len() as u32)
            }
            _ => Ok(1),
        }
    }

    /// Replace the record at (pid, slot, dup).
    pub fn overwrite_record_at(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
        dup: u32,
        record: &[u8],
    ) -> DbResult {
        let locator = {
            let page = ctx.store.fetch_leaf(pid)?;
            let l = page.rl().item(slot).locator.clone();
            l
        };
        let new_locator = match locator {
            RecordLocator::DupList(id) => {
                let mut list = DupList::decode(&ctx.blobs.read(ctx.store, id)?);
                let idx = if dup == 0 { 0 } else { dup as usize - 1 };
                if idx >= list.entries.len() {
                    return Err(BurrowError::of(ErrorKind::KeyNotFound));
                }
                let old = list.entries[idx].clone();
                self.free_single_locator(ctx, &old)?;
                list.entries[idx] = self.make_single_locator(ctx, record)?;
                let new_id = ctx.blobs.overwrite(ctx.store, id, &list.encode())?;
                RecordLocator::DupList(new_id)
            }
            old => {
                self.free_single_locator(ctx, &old)?;
                self.make_single_locator(ctx, record)?
            }
        };
        let page = ctx.store.fetch_leaf(pid)?;
        page.wl().item_mut(slot).locator = new_locator;
        drop(page);
        ctx.store.mark_dirty(pid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    /// Insert `key`/`record`. For duplicate modes `dup_ref` is the
    /// 1-based duplicate the cursor currently points at (0 = none).
    /// Returns the landing position and the 1-based duplicate index of
    /// the new record (0 when the key has no duplicates).
    pub fn insert(
        &mut self,
        ctx: &mut BtreeContext,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_ref: u32,
    ) -> BurrowResult<(PageId, usize, u32)> {
        let hint = if flags.contains(InsertFlags::HINT_APPEND) {
            Hint::Append
        } else if flags.contains(InsertFlags::HINT_PREPEND) {
            Hint::Prepend
        } else {
            Hint::None
        };

        let leaf = self.descend_to_leaf(ctx, key, hint)?;
        let pid = leaf.rl().get_pid();
        let lookup = leaf.rl().find_slot(self.key_type, key);

        match lookup {
            Ok(slot) => {
                if flags.is_duplicate() && self.flags.contains(DbFlags::ENABLE_DUPLICATES) {
                    let idx = self.insert_duplicate_at(ctx, pid, slot, record, flags, dup_ref)?;
                    Ok((pid, slot, idx))
                } else if flags.contains(InsertFlags::OVERWRITE) {
                    self.overwrite_record_at(ctx, pid, slot, 0, record)?;
                    Ok((pid, slot, 0))
                } else {
                    Err(BurrowError::of(ErrorKind::DuplicateKey))
                }
            }
            Err(pos) => {
                let locator = self.make_single_locator(ctx, record)?;
                let item = LeafItem {
                    key: Bytes::copy_from_slice(key),
                    locator,
                };
                let fits = {
                    let p = leaf.rl();
                    p.used_bytes() + item.disk_size() <= ctx.store.page_size()
                };
                if fits {
                    self.adjust_cursors_on_insert(ctx, pid, pos)?;
                    leaf.wl().insert_item(pos, item);
                    ctx.store.mark_dirty(pid);
                    Ok((pid, pos, 0))
                } else {
                    let target = self.split_leaf(ctx, leaf, key, flags)?;
                    let tpid = target.rl().get_pid();
                    let pos = match target.rl().find_slot(self.key_type, key) {
                        Err(pos) => pos,
                        Ok(_) => {
                            return Err(BurrowError::new(
                                ErrorKind::IntegrityViolated,
                                "key appeared during split",
                            ))
                        }
                    };
                    self.adjust_cursors_on_insert(ctx, tpid, pos)?;
                    target.wl().insert_item(pos, item);
                    ctx.store.mark_dirty(tpid);
                    Ok((tpid, pos, 0))
                }
            }
        }
    }

    /// Add a duplicate to an existing key, honoring the five insertion
    /// modes. Returns the 1-based index of the new duplicate.
    fn insert_duplicate_at(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        slot: usize,
        record: &[u8],
        flags: InsertFlags,
        dup_ref: u32,
    ) -> BurrowResult<u32> {
        let locator = {
            let page = ctx.store.fetch_leaf(pid)?;
            let l = page.rl().item(slot).locator.clone();
            l
        };
        let (mut list, existing_list_id) = match locator {
            RecordLocator::DupList(id) => {
                (DupList::decode(&ctx.blobs.read(ctx.store, id)?), Some(id))
            }
            single => {
                let mut list = DupList::new();
                list.entries.push(single);
                (list, None)
            }
        };

        let new_entry = self.make_single_locator(ctx, record)?;
        let pos = if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
            0
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) && dup_ref >= 1 {
            dup_ref as usize - 1
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) && dup_ref >= 1 {
            (dup_ref as usize).min(list.entries.len())
        } else {
            list.entries.len()
        };
        list.entries.insert(pos, new_entry);

        let new_locator = match existing_list_id {
            Some(id) => {
                let new_id = ctx.blobs.overwrite(ctx.store, id, &list.encode())?;
                RecordLocator::DupList(new_id)
            }
            None => {
                let id = ctx.blobs.allocate(ctx.store, &list.encode());
                RecordLocator::DupList(id)
            }
        };
        let page = ctx.store.fetch_leaf(pid)?;
        page.wl().item_mut(slot).locator = new_locator;
        drop(page);
        ctx.store.mark_dirty(pid);
        Ok(pos as u32 + 1)
    }

    /// Split a leaf. The new sibling goes to the right; the separator is
    /// copied up. With an append (resp. prepend) hint at the edge of the
    /// tree the split is positional: the new page receives nothing (resp.
    /// everything), so already-full edge leaves stay full.
    fn split_leaf(
        &mut self,
        ctx: &mut BtreeContext,
        page: Pod<LeafPage>,
        insert_key: &[u8],
        flags: InsertFlags,
    ) -> BurrowResult<Pod<LeafPage>> {
        let pid = page.rl().get_pid();
        let count = page.rl().item_count();

        let split_at = {
            let p = page.rl();
            let first_key = p.item(0).key.clone();
            let last_key = p.item(count - 1).key.clone();
            if flags.contains(InsertFlags::HINT_APPEND)
                && self.key_type.compare(insert_key, &last_key) == Ordering::Greater
            {
                count
            } else if flags.contains(InsertFlags::HINT_PREPEND)
                && self.key_type.compare(insert_key, &first_key) == Ordering::Less
            {
                0
            } else {
                count / 2
            }
        };

        self.uncouple_all_cursors(ctx, pid, split_at)?;

        let new_page = ctx.store.allocate_leaf()?;
        let new_pid = new_page.rl().get_pid();

        let moved = page.wl().split_off(split_at);
        let separator = if moved.is_empty() {
            Bytes::copy_from_slice(insert_key)
        } else {
            moved[0].key.clone()
        };

        debug!(
            "split leaf, page: {}, new sibling: {}, split at: {}/{}",
            pid, new_pid, split_at, count
        );

        let old_right = page.rl().get_right_pid();
        let parent_pid = page.rl().get_parent_pid();
        {
            let mut np = new_page.wl();
            np.append_items(moved);
            np.set_right_pid(old_right);
            np.set_left_pid(Some(pid));
            np.set_parent_pid(parent_pid);
        }
        if let Some(orid) = old_right {
            let old_right_page = ctx.store.fetch_leaf(orid)?;
            old_right_page.wl().set_left_pid(Some(new_pid));
            drop(old_right_page);
            ctx.store.mark_dirty(orid);
        }
        page.wl().set_right_pid(Some(new_pid));
        ctx.store.mark_dirty(pid);
        ctx.store.mark_dirty(new_pid);

        self.insert_into_parent(ctx, pid, separator.clone(), new_pid)?;

        let use_new = {
            let np = new_page.rl();
            np.item_count() == 0
                || self.key_type.compare(insert_key, &separator) != Ordering::Less
        };
        Ok(if use_new { new_page } else { page })
    }

    /// Hook a freshly split-off right sibling into the tree, growing it
    /// by one level when the split reached the root.
    fn insert_into_parent(
        &mut self,
        ctx: &mut BtreeContext,
        left_pid: PageId,
        separator: Bytes,
        right_pid: PageId,
    ) -> DbResult {
        let parent_pid = match ctx.store.fetch_node(left_pid)? {
            NodeRef::Leaf(p) => {
                let pp = p.rl().get_parent_pid();
                pp
            }
            NodeRef::Internal(p) => {
                let pp = p.rl().get_parent_pid();
                pp
            }
        };

        if parent_pid == EMPTY_PAGE_ID {
            // the split page was the root; grow the tree
            let root = ctx.store.allocate_internal()?;
            let root_pid = root.rl().get_pid();
            {
                let mut r = root.wl();
                r.set_ptr_down(left_pid);
                r.insert_entry(
                    0,
                    InternalEntry {
                        key: separator,
                        child: right_pid,
                    },
                );
            }
            ctx.store.mark_dirty(root_pid);
            self.set_parent_of(ctx, left_pid, root_pid)?;
            self.set_parent_of(ctx, right_pid, root_pid)?;
            debug!("grow tree, new root: {}", root_pid);
            self.root_pid = root_pid;
            return Ok(());
        }

        let parent = ctx.store.fetch_internal(parent_pid)?;
        let entry_size = 2 + separator.len() + 8;
        let fits = {
            let p = parent.rl();
            p.used_bytes() + entry_size <= ctx.store.page_size()
        };
        let parent = if fits {
            parent
        } else {
            self.split_internal(ctx, parent, &separator)?
        };

        let ppid = parent.rl().get_pid();
        let slot = parent.rl().separator_slot(self.key_type, &separator);
        parent.wl().insert_entry(
            slot,
            InternalEntry {
                key: separator,
                child: right_pid,
            },
        );
        drop(parent);
        ctx.store.mark_dirty(ppid);
        self.set_parent_of(ctx, right_pid, ppid)
    }

    /// Split an internal node; the middle separator is pushed up.
    fn split_internal(
        &mut self,
        ctx: &mut BtreeContext,
        page: Pod<InternalPage>,
        for_key: &[u8],
    ) -> BurrowResult<Pod<InternalPage>> {
        let pid = page.rl().get_pid();
        let count = page.rl().entry_count();
        let mid = count / 2;

        let (push_key, push_child, moved) = {
            let mut p = page.wl();
            let moved = p.split_off(mid + 1);
            let push = p.remove_entry(mid);
            (push.key, push.child, moved)
        };

        let new_page = ctx.store.allocate_internal()?;
        let new_pid = new_page.rl().get_pid();
        let parent_pid = page.rl().get_parent_pid();
        {
            let mut np = new_page.wl();
            np.set_ptr_down(push_child);
            np.append_entries(moved);
            np.set_parent_pid(parent_pid);
        }
        ctx.store.mark_dirty(pid);
        ctx.store.mark_dirty(new_pid);

        debug!(
            "split internal, page: {}, new sibling: {}, pushed key up",
            pid, new_pid
        );

        self.insert_into_parent(ctx, pid, push_key.clone(), new_pid)?;

        Ok(
            if self.key_type.compare(for_key, &push_key) == Ordering::Less {
                page
            } else {
                new_page
            },
        )
    }

    fn set_parent_of(&self, ctx: &mut BtreeContext, pid: PageId, parent: PageId) -> DbResult {
        match ctx.store.fetch_node(pid)? {
            NodeRef::Leaf(p) => p.wl().set_parent_pid(parent),
            NodeRef::Internal(p) => p.wl().set_parent_pid(parent),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // erase
    // ------------------------------------------------------------------

    /// Erase `key`. `dup_index == 0` erases the key with all its
    /// duplicates; otherwise only the addressed duplicate goes.
    pub fn erase(&mut self, ctx: &mut BtreeContext, key: &[u8], dup_index: u32) -> DbResult {
        let leaf = self.descend_to_leaf(ctx, key, Hint::None)?;
        let pid = leaf.rl().get_pid();
        let slot = match leaf.rl().find_slot(self.key_type, key) {
            Ok(slot) => slot,
            Err(_) => return Err(BurrowError::of(ErrorKind::KeyNotFound)),
        };

        if dup_index > 0 {
            let locator = {
                let p = leaf.rl();
                let l = p.item(slot).locator.clone();
                l
            };
            if let RecordLocator::DupList(list_id) = locator {
                let mut list = DupList::decode(&ctx.blobs.read(ctx.store, list_id)?);
                if dup_index as usize > list.entries.len() {
                    return Err(BurrowError::of(ErrorKind::KeyNotFound));
                }
                let removed = list.entries.remove(dup_index as usize - 1);
                self.free_single_locator(ctx, &removed)?;
                let new_locator = if list.entries.len() == 1 {
                    let single = list.entries.pop().unwrap();
                    ctx.blobs.free(ctx.store, list_id)?;
                    single
                } else {
                    let new_id = ctx.blobs.overwrite(ctx.store, list_id, &list.encode())?;
                    RecordLocator::DupList(new_id)
                };
                leaf.wl().item_mut(slot).locator = new_locator;
                drop(leaf);
                ctx.store.mark_dirty(pid);
                return Ok(());
            }
            if dup_index > 1 {
                return Err(BurrowError::of(ErrorKind::KeyNotFound));
            }
            // dup_index == 1 on a single record: erase the whole item
        }

        let erased_key = leaf.rl().item(slot).key.clone();
        self.adjust_cursors_on_erase(ctx, pid, slot, &erased_key)?;
        let item = leaf.wl().remove_item(slot);
        self.free_locator(ctx, &item.locator)?;
        drop(leaf);
        ctx.store.mark_dirty(pid);

        let underfull = {
            let page = ctx.store.fetch_leaf(pid)?;
            let u = page.rl().used_bytes() < ctx.store.page_size() / 2;
            u
        };
        if pid != self.root_pid && underfull {
            self.rebalance_leaf(ctx, pid)?;
        }
        Ok(())
    }

    /// Underflow handling: borrow one item from the left sibling, else
    /// from the right, else merge with the left (preferred) or right.
    fn rebalance_leaf(&mut self, ctx: &mut BtreeContext, pid: PageId) -> DbResult {
        let half = ctx.store.page_size() / 2;
        let page = ctx.store.fetch_leaf(pid)?;
        let parent_pid = page.rl().get_parent_pid();
        if parent_pid == EMPTY_PAGE_ID {
            return Ok(());
        }
        drop(page);

        let parent = ctx.store.fetch_internal(parent_pid)?;
        let (child_idx, left_pid, right_pid) = {
            let p = parent.rl();
            let idx = p.entry_index_of_child(pid);
            let left = match idx {
                Some(0) => Some(p.get_ptr_down()),
                Some(i) => Some(p.entry(i - 1).child),
                None => None,
            };
            let right = match idx {
                Some(i) if i + 1 < p.entry_count() => Some(p.entry(i + 1).child),
                Some(_) => None,
                None => {
                    if p.entry_count() > 0 {
                        Some(p.entry(0).child)
                    } else {
                        None
                    }
                }
            };
            (idx, left, right)
        };
        drop(parent);

        // borrow from the left sibling
        if let Some(lpid) = left_pid {
            let left = ctx.store.fetch_leaf(lpid)?;
            let (lcount, donatable) = {
                let l = left.rl();
                let c = l.item_count();
                let d = c > 0 && l.used_bytes() - l.item(c - 1).disk_size() >= half;
                (c, d)
            };
            if donatable {
                debug!("borrow from left sibling, page: {}, left: {}", pid, lpid);
                let last_key = {
                    let l = left.rl();
                    l.item(lcount - 1).key.clone()
                };
                self.adjust_cursors_on_erase(ctx, lpid, lcount - 1, &last_key)?;
                let item = left.wl().remove_item(lcount - 1);
                self.adjust_cursors_on_insert(ctx, pid, 0)?;
                let page = ctx.store.fetch_leaf(pid)?;
                page.wl().prepend_item(item);
                let new_first = page.rl().item(0).key.clone();
                drop(page);
                // this page has an in-parent left sibling, so it is an
                // entry child and its separator must follow
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let idx = child_idx.expect("leaf with left sibling is an entry child");
                parent.wl().entry_mut(idx).key = new_first;
                drop(parent);
                ctx.store.mark_dirty(lpid);
                ctx.store.mark_dirty(pid);
                ctx.store.mark_dirty(parent_pid);
                return Ok(());
            }
        }

        // borrow from the right sibling
        if let Some(rpid) = right_pid {
            let right = ctx.store.fetch_leaf(rpid)?;
            let donatable = {
                let r = right.rl();
                r.item_count() > 0 && r.used_bytes() - r.item(0).disk_size() >= half
            };
            if donatable {
                debug!("borrow from right sibling, page: {}, right: {}", pid, rpid);
                let first_key = right.rl().item(0).key.clone();
                self.adjust_cursors_on_erase(ctx, rpid, 0, &first_key)?;
                let item = right.wl().remove_item(0);
                let page = ctx.store.fetch_leaf(pid)?;
                let count = page.rl().item_count();
                page.wl().insert_item(count, item);
                drop(page);
                let new_first = right.rl().item(0).key.clone();
                drop(right);
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let ridx = child_idx.map(|i| i + 1).unwrap_or(0);
                parent.wl().entry_mut(ridx).key = new_first;
                drop(parent);
                ctx.store.mark_dirty(rpid);
                ctx.store.mark_dirty(pid);
                ctx.store.mark_dirty(parent_pid);
                return Ok(());
            }
        }

        // merge with the left sibling (preferred)
        if let Some(lpid) = left_pid {
            let fits = {
                let left = ctx.store.fetch_leaf(lpid)?;
                let page = ctx.store.fetch_leaf(pid)?;
                let f = left.rl().used_bytes() + page.rl().used_bytes()
                    <= ctx.store.page_size() + super::page::leaf_page::LEAF_HEADER_SIZE;
                f
            };
            if fits {
                debug!("merge into left sibling, page: {}, left: {}", pid, lpid);
                self.uncouple_all_cursors(ctx, pid, 0)?;
                let page = ctx.store.fetch_leaf(pid)?;
                let items = page.wl().split_off(0);
                let old_right = page.rl().get_right_pid();
                drop(page);
                let left = ctx.store.fetch_leaf(lpid)?;
                {
                    let mut l = left.wl();
                    l.append_items(items);
                    l.set_right_pid(old_right);
                }
                drop(left);
                if let Some(orid) = old_right {
                    let r = ctx.store.fetch_leaf(orid)?;
                    r.wl().set_left_pid(Some(lpid));
                    drop(r);
                    ctx.store.mark_dirty(orid);
                }
                ctx.store.mark_dirty(lpid);
                let idx = child_idx.expect("leaf with left sibling is an entry child");
                self.remove_parent_entry(ctx, parent_pid, idx)?;
                ctx.store.free_page(pid);
                return Ok(());
            }
        }

        // merge the right sibling into this page
        if let Some(rpid) = right_pid {
            let fits = {
                let right = ctx.store.fetch_leaf(rpid)?;
                let page = ctx.store.fetch_leaf(pid)?;
                let f = right.rl().used_bytes() + page.rl().used_bytes()
                    <= ctx.store.page_size() + super::page::leaf_page::LEAF_HEADER_SIZE;
                f
            };
            if fits {
                debug!("merge right sibling, page: {}, right: {}", pid, rpid);
                self.uncouple_all_cursors(ctx, rpid, 0)?;
                let right = ctx.store.fetch_leaf(rpid)?;
                let items = right.wl().split_off(0);
                let new_right = right.rl().get_right_pid();
                drop(right);
                let page = ctx.store.fetch_leaf(pid)?;
                {
                    let mut p = page.wl();
                    p.append_items(items);
                    p.set_right_pid(new_right);
                }
                drop(page);
                if let Some(nrid) = new_right {
                    let r = ctx.store.fetch_leaf(nrid)?;
                    r.wl().set_left_pid(Some(pid));
                    drop(r);
                    ctx.store.mark_dirty(nrid);
                }
                ctx.store.mark_dirty(pid);
                let ridx = child_idx.map(|i| i + 1).unwrap_or(0);
                self.remove_parent_entry(ctx, parent_pid, ridx)?;
                ctx.store.free_page(rpid);
                return Ok(());
            }
        }

        Ok(())
    }

    /// Drop an entry from an internal node and rebalance upward; shrink
    /// the tree when the root degenerates to a single child.
    fn remove_parent_entry(
        &mut self,
        ctx: &mut BtreeContext,
        pid: PageId,
        idx: usize,
    ) -> DbResult {
        let page = ctx.store.fetch_internal(pid)?;
        page.wl().remove_entry(idx);
        drop(page);
        ctx.store.mark_dirty(pid);
        self.rebalance_internal(ctx, pid)
    }

    fn rebalance_internal(&mut self, ctx: &mut BtreeContext, pid: PageId) -> DbResult {
        let half = ctx.store.page_size() / 2;
        let page = ctx.store.fetch_internal(pid)?;
        let (entry_count, ptr_down, parent_pid, used) = {
            let p = page.rl();
            (
                p.entry_count(),
                p.get_ptr_down(),
                p.get_parent_pid(),
                p.used_bytes(),
            )
        };
        drop(page);

        if pid == self.root_pid {
            if entry_count == 0 {
                debug!("shrink tree, new root: {}", ptr_down);
                self.set_parent_of(ctx, ptr_down, EMPTY_PAGE_ID)?;
                ctx.store.free_page(pid);
                self.root_pid = ptr_down;
            }
            return Ok(());
        }
        if used >= half {
            return Ok(());
        }

        let parent = ctx.store.fetch_internal(parent_pid)?;
        let (child_idx, left_pid, right_pid) = {
            let p = parent.rl();
            let idx = p.entry_index_of_child(pid);
            let left = match idx {
                Some(0) => Some(p.get_ptr_down()),
                Some(i) => Some(p.entry(i - 1).child),
                None => None,
            };
            let right = match idx {
                Some(i) if i + 1 < p.entry_count() => Some(p.entry(i + 1).child),
                Some(_) => None,
                None => {
                    if p.entry_count() > 0 {
                        Some(p.entry(0).child)
                    } else {
                        None
                    }
                }
            };
            (idx, left, right)
        };
        drop(parent);

        // rotate one entry in from the left through the parent
        if let Some(lpid) = left_pid {
            let left = ctx.store.fetch_internal(lpid)?;
            let (lcount, donatable) = {
                let l = left.rl();
                let c = l.entry_count();
                let d = c > 0 && l.used_bytes() - l.entry(c - 1).disk_size() >= half;
                (c, d)
            };
            if donatable {
                let idx = child_idx.expect("node with left sibling is an entry child");
                let donated = left.wl().remove_entry(lcount - 1);
                drop(left);
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let separator = parent.rl().entry(idx).key.clone();
                parent.wl().entry_mut(idx).key = donated.key;
                drop(parent);
                let page = ctx.store.fetch_internal(pid)?;
                {
                    let mut p = page.wl();
                    let down = p.get_ptr_down();
                    p.insert_entry(
                        0,
                        InternalEntry {
                            key: separator,
                            child: down,
                        },
                    );
                    p.set_ptr_down(donated.child);
                }
                drop(page);
                ctx.store.mark_dirty(lpid);
                ctx.store.mark_dirty(pid);
                ctx.store.mark_dirty(parent_pid);
                return Ok(());
            }
        }

        // rotate one entry in from the right
        if let Some(rpid) = right_pid {
            let right = ctx.store.fetch_internal(rpid)?;
            let donatable = {
                let r = right.rl();
                r.entry_count() > 0 && r.used_bytes() - r.entry(0).disk_size() >= half
            };
            if donatable {
                let ridx = child_idx.map(|i| i + 1).unwrap_or(0);
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let separator = parent.rl().entry(ridx).key.clone();
                let (donated, right_down) = {
                    let mut r = right.wl();
                    let donated = r.remove_entry(0);
                    let down = r.get_ptr_down();
                    r.set_ptr_down(donated.child);
                    (donated, down)
                };
                parent.wl().entry_mut(ridx).key = donated.key;
                drop(parent);
                drop(right);
                let page = ctx.store.fetch_internal(pid)?;
                {
                    let mut p = page.wl();
                    let count = p.entry_count();
                    p.insert_entry(
                        count,
                        InternalEntry {
                            key: separator,
                            child: right_down,
                        },
                    );
                }
                drop(page);
                ctx.store.mark_dirty(rpid);
                ctx.store.mark_dirty(pid);
                ctx.store.mark_dirty(parent_pid);
                return Ok(());
            }
        }

        // merge into the left sibling: the separator comes down
        if let Some(lpid) = left_pid {
            let fits = {
                let left = ctx.store.fetch_internal(lpid)?;
                let page = ctx.store.fetch_internal(pid)?;
                let idx = child_idx.expect("node with left sibling is an entry child");
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let sep_size = parent.rl().entry(idx).disk_size();
                let f = left.rl().used_bytes() + page.rl().used_bytes() + sep_size
                    <= ctx.store.page_size() + super::page::internal_page::INTERNAL_HEADER_SIZE;
                f
            };
            if fits {
                let idx = child_idx.expect("node with left sibling is an entry child");
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let separator = parent.rl().entry(idx).key.clone();
                drop(parent);
                let page = ctx.store.fetch_internal(pid)?;
                let (down, entries) = {
                    let mut p = page.wl();
                    (p.get_ptr_down(), p.split_off(0))
                };
                drop(page);
                let left = ctx.store.fetch_internal(lpid)?;
                {
                    let mut l = left.wl();
                    let count = l.entry_count();
                    l.insert_entry(
                        count,
                        InternalEntry {
                            key: separator,
                            child: down,
                        },
                    );
                    l.append_entries(entries);
                }
                drop(left);
                ctx.store.mark_dirty(lpid);
                ctx.store.free_page(pid);
                return self.remove_parent_entry(ctx, parent_pid, idx);
            }
        }

        // merge the right sibling into this node
        if let Some(rpid) = right_pid {
            let ridx = child_idx.map(|i| i + 1).unwrap_or(0);
            let fits = {
                let right = ctx.store.fetch_internal(rpid)?;
                let page = ctx.store.fetch_internal(pid)?;
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let sep_size = parent.rl().entry(ridx).disk_size();
                let f = right.rl().used_bytes() + page.rl().used_bytes() + sep_size
                    <= ctx.store.page_size() + super::page::internal_page::INTERNAL_HEADER_SIZE;
                f
            };
            if fits {
                let parent = ctx.store.fetch_internal(parent_pid)?;
                let separator = parent.rl().entry(ridx).key.clone();
                drop(parent);
                let right = ctx.store.fetch_internal(rpid)?;
                let (rdown, rentries) = {
                    let mut r = right.wl();
                    (r.get_ptr_down(), r.split_off(0))
                };
                drop(right);
                let page = ctx.store.fetch_internal(pid)?;
                {
                    let mut p = page.wl();
                    let count = p.entry_count();
                    p.insert_entry(
                        count,
                        InternalEntry {
                            key: separator,
                            child: rdown,
                        },
                    );
                    p.append_entries(rentries);
                }
                drop(page);
                ctx.store.mark_dirty(pid);
                ctx.store.free_page(rpid);
                return self.remove_parent_entry(ctx, parent_pid, ridx);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // scan / count / integrity
    // ------------------------------------------------------------------

    /// Walk the leaves left to right, reporting `(key, count)` per key;
    /// `distinct` counts duplicate keys once.
    pub fn scan(
        &self,
        ctx: &mut BtreeContext,
        distinct: bool,
        visitor: &mut dyn FnMut(&[u8], u64),
    ) -> DbResult {
        let mut pid = self.leftmost_leaf(ctx)?;
        loop {
            let page = ctx.store.fetch_leaf(pid)?;
            let (items, right): (Vec<(Bytes, RecordLocator)>, Option<PageId>) = {
                let p = page.rl();
                (
                    p.items()
                        .iter()
                        .map(|i| (i.key.clone(), i.locator.clone()))
                        .collect(),
                    p.get_right_pid(),
                )
            };
            drop(page);
            for (key, locator) in items {
                let count = if distinct {
                    1
                } else {
                    match locator {
                        RecordLocator::DupList(id) => {
                            DupList::decode(&ctx.blobs.read(ctx.store, id)?).entries.len() as u64
                        }
                        _ => 1,
                    }
                };
                visitor(&key, count);
            }
            match right {
                Some(next) => pid = next,
                None => return Ok(()),
            }
        }
    }

    pub fn count(&self, ctx: &mut BtreeContext, distinct: bool) -> BurrowResult<u64> {
        let mut total = 0;
        self.scan(ctx, distinct, &mut |_, count| total += count)?;
        Ok(total)
    }

    /// Verify per-node ordering, separator bounds, and the sibling
    /// chain.
    pub fn check_integrity(&self, ctx: &mut BtreeContext) -> DbResult {
        let mut leaves = Vec::new();
        self.check_node(ctx, self.root_pid, None, None, &mut leaves)?;

        // the recursively collected leaves must equal the sibling chain
        let mut chain = Vec::new();
        let mut pid = Some(self.leftmost_leaf(ctx)?);
        while let Some(p) = pid {
            chain.push(p);
            let page = ctx.store.fetch_leaf(p)?;
            let r = page.rl().get_right_pid();
            pid = r;
        }
        if chain != leaves {
            return Err(BurrowError::new(
                ErrorKind::IntegrityViolated,
                "leaf sibling chain does not match the tree",
            ));
        }
        Ok(())
    }

    fn check_node(
        &self,
        ctx: &mut BtreeContext,
        pid: PageId,
        lower: Option<Bytes>,
        upper: Option<Bytes>,
        leaves: &mut Vec<PageId>,
    ) -> DbResult {
        match ctx.store.fetch_node(pid)? {
            NodeRef::Leaf(page) => {
                let p = page.rl();
                if !p.check_item_order(self.key_type) {
                    return Err(BurrowError::new(
                        ErrorKind::IntegrityViolated,
                        &format!("leaf {} items out of order", pid),
                    ));
                }
                for item in p.items() {
                    if let Some(lo) = &lower {
                        if self.key_type.compare(&item.key, lo) == Ordering::Less {
                            return Err(BurrowError::new(
                                ErrorKind::IntegrityViolated,
                                &format!("leaf {} item below separator", pid),
                            ));
                        }
                    }
                    if let Some(hi) = &upper {
                        if self.key_type.compare(&item.key, hi) != Ordering::Less {
                            return Err(BurrowError::new(
                                ErrorKind::IntegrityViolated,
                                &format!("leaf {} item above separator", pid),
                            ));
                        }
                    }
                }
                if pid != self.root_pid && p.item_count() == 0 {
                    return Err(BurrowError::new(
                        ErrorKind::IntegrityViolated,
                        &format!("non-root leaf {} is empty", pid),
                    ));
                }
                drop(p);
                leaves.push(pid);
                Ok(())
            }
            NodeRef::Internal(page) => {
                let (down, entries) = {
                    let p = page.rl();
                    if !p.check_entry_order(self.key_type) {
                        return Err(BurrowError::new(
                            ErrorKind::IntegrityViolated,
                            &format!("internal {} separators out of order", pid),
                        ));
                    }
                    if p.get_ptr_down() == EMPTY_PAGE_ID {
                        return Err(BurrowError::new(
                            ErrorKind::IntegrityViolated,
                            &format!("internal {} has a dangling ptr-down", pid),
                        ));
                    }
                    (
                        p.get_ptr_down(),
                        p.entries().to_vec(),
                    )
                };
                let first_sep = entries.first().map(|e| e.key.clone());
                self.check_node(ctx, down, lower.clone(), first_sep, leaves)?;
                for (i, entry) in entries.iter().enumerate() {
                    let next_sep = entries.get(i + 1).map(|e| e.key.clone());
                    self.check_node(
                        ctx,
                        entry.child,
                        Some(entry.key.clone()),
                        next_sep.or_else(|| upper.clone()),
                        leaves,
                    )?;
                }
                Ok(())
            }
        }
    }

    /// Release every page and blob of this tree (database removal).
    pub fn release(&mut self, ctx: &mut BtreeContext) -> DbResult {
        self.release_node(ctx, self.root_pid)?;
        self.root_pid = EMPTY_PAGE_ID;
        Ok(())
    }

    fn release_node(&self, ctx: &mut BtreeContext, pid: PageId) -> DbResult {
        match ctx.store.fetch_node(pid)? {
            NodeRef::Leaf(page) => {
                let locators: Vec<RecordLocator> = {
                    let p = page.rl();
                    p.items().iter().map(|i| i.locator.clone()).collect()
                };
                drop(page);
                for locator in locators {
                    self.free_locator(ctx, &locator)?;
                }
            }
            NodeRef::Internal(page) => {
                let (down, children): (PageId, Vec<PageId>) = {
                    let p = page.rl();
                    (
                        p.get_ptr_down(),
                        p.entries().iter().map(|e| e.child).collect(),
                    )
                };
                drop(page);
                self.release_node(ctx, down)?;
                for child in children {
                    self.release_node(ctx, child)?;
                }
            }
        }
        ctx.store.free_page(pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorState;
    use crate::key::KEY_SIZE_UNLIMITED;

    struct Fixture {
        store: PageStore,
        blobs: BlobManager,
        cursors: CursorArena,
        btree: Btree,
    }

    impl Fixture {
        // a tiny page size keeps split depths interesting
        fn new(page_size: usize) -> Self {
            let mut fixture = Self {
                store: PageStore::new(None, page_size, 64),
                blobs: BlobManager::new(),
                cursors: CursorArena::new(),
                btree: Btree::new(
                    KeyType::Binary,
                    KEY_SIZE_UNLIMITED,
                    crate::key::RECORD_SIZE_UNLIMITED,
                    DbFlags::ENABLE_DUPLICATES,
                ),
            };
            let mut ctx = BtreeContext {
                store: &mut fixture.store,
                blobs: &mut fixture.blobs,
                cursors: &mut fixture.cursors,
            };
            fixture.btree.create_root(&mut ctx).unwrap();
            fixture
        }

        fn with<R>(&mut self, f: impl FnOnce(&mut Btree, &mut BtreeContext) -> R) -> R {
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut self.cursors,
            };
            f(&mut self.btree, &mut ctx)
        }

        fn insert(&mut self, key: &[u8], record: &[u8]) {
            self.with(|btree, ctx| {
                btree.insert(ctx, key, record, InsertFlags::empty(), 0).unwrap();
            });
        }

        fn key(i: u32) -> Vec<u8> {
            format!("{:06}", i).into_bytes()
        }
    }

    #[test]
    fn test_insert_splits_and_stays_ordered() {
        let mut f = Fixture::new(1024);
        for i in 0..500u32 {
            // zig-zag insertion order
            let i = if i % 2 == 0 { i } else { 999 - i };
            f.insert(&Fixture::key(i), b"r");
        }
        f.with(|btree, ctx| btree.check_integrity(ctx)).unwrap();
        // the tree grew beyond a single leaf
        assert_ne!(
            f.with(|btree, ctx| btree.leftmost_leaf(ctx)).unwrap(),
            f.btree.root_pid
        );
        assert_eq!(f.with(|btree, ctx| btree.count(ctx, false)).unwrap(), 500);

        // every key is findable
        for i in (0..500u32).step_by(37) {
            let i = if i % 2 == 0 { i } else { 999 - i };
            let (key, _, approx) = f
                .with(|btree, ctx| btree.find(ctx, &Fixture::key(i), FindFlags::EXACT))
                .unwrap();
            assert_eq!(key, &Fixture::key(i)[..]);
            assert_eq!(approx, ApproxMatch::Exact);
        }
    }

    #[test]
    fn test_erase_shrinks_tree_to_empty_root() {
        let mut f = Fixture::new(1024);
        for i in 0..300u32 {
            f.insert(&Fixture::key(i), b"payload");
        }
        for i in 0..300u32 {
            f.with(|btree, ctx| btree.erase(ctx, &Fixture::key(i), 0)).unwrap();
        }
        f.with(|btree, ctx| btree.check_integrity(ctx)).unwrap();
        assert_eq!(f.with(|btree, ctx| btree.count(ctx, false)).unwrap(), 0);
        // the root degenerated back to a leaf
        let root = f.btree.root_pid;
        assert!(matches!(
            f.with(|_, ctx| ctx.store.fetch_node(root)).unwrap(),
            NodeRef::Leaf(_)
        ));
    }

    #[test]
    fn test_append_hint_split_leaves_full_pages() {
        let mut f = Fixture::new(1024);
        for i in 0..400u32 {
            f.with(|btree, ctx| {
                btree
                    .insert(ctx, &Fixture::key(i), b"r", InsertFlags::HINT_APPEND, 0)
                    .unwrap();
            });
        }
        f.with(|btree, ctx| btree.check_integrity(ctx)).unwrap();

        // with edge splits, interior leaves stay packed: far fewer
        // leaves than a median-split load would produce
        let mut leaves = 0;
        let mut pid = Some(f.with(|btree, ctx| btree.leftmost_leaf(ctx)).unwrap());
        while let Some(p) = pid {
            leaves += 1;
            let page = f.store.fetch_leaf(p).unwrap();
            let right = page.rl().get_right_pid();
            pid = right;
        }
        let capacity_bound = 400 * (2 + 6 + 2) / (1024 - 27) + 1;
        assert!(leaves <= capacity_bound + 1, "leaves: {}", leaves);
    }

    #[test]
    fn test_cursor_list_tracks_coupled_cursors() {
        let mut f = Fixture::new(1024);
        for i in 0..50u32 {
            f.insert(&Fixture::key(i), b"r");
        }

        let cid = f.cursors.alloc(CursorState::new(None));
        f.with(|btree, ctx| btree.cursor_find(ctx, cid, &Fixture::key(7), FindFlags::EXACT))
            .unwrap();

        let (pid, slot) = match &f.cursors.get(cid).btree {
            cursor::BtreeCursorState::Coupled { pid, slot, .. } => (*pid, *slot),
            _ => panic!("cursor should be coupled"),
        };
        assert_eq!(slot, 7);
        {
            let page = f.store.fetch_leaf(pid).unwrap();
            assert!(page.rl().cursor_list().contains(&cid));
        }

        // a split beyond the coupled slot leaves the cursor alone; one
        // at or before it uncouples with the key snapshot
        f.with(|btree, ctx| btree.uncouple_all_cursors(ctx, pid, slot + 1)).unwrap();
        assert!(f.cursors.get(cid).btree.is_coupled());
        f.with(|btree, ctx| btree.uncouple_all_cursors(ctx, pid, 0)).unwrap();
        match &f.cursors.get(cid).btree {
            cursor::BtreeCursorState::Uncoupled { key, .. } => {
                assert_eq!(&key[..], &Fixture::key(7)[..]);
            }
            other => panic!("expected uncoupled state, got {:?}", other),
        }
        {
            let page = f.store.fetch_leaf(pid).unwrap();
            assert!(!page.rl().cursor_list().contains(&cid));
        }

        // re-coupling lands on the same pair
        f.with(|btree, ctx| btree.cursor_re_couple(ctx, cid)).unwrap();
        let key = f.with(|btree, ctx| btree.cursor_key(ctx, cid)).unwrap();
        assert_eq!(&key[..], &Fixture::key(7)[..]);
    }

    #[test]
    fn test_duplicate_list_round_trip() {
        let mut f = Fixture::new(1024);
        f.insert(b"k", b"first");
        for record in [&b"second"[..], b"third"] {
            f.with(|btree, ctx| {
                btree
                    .insert(ctx, b"k", record, InsertFlags::DUPLICATE, 0)
                    .unwrap();
            });
        }
        let (pid, slot, _) = f
            .with(|btree, ctx| btree.find_position(ctx, b"k", FindFlags::EXACT))
            .unwrap();
        assert_eq!(
            f.with(|btree, ctx| btree.dup_count_at(ctx, pid, slot)).unwrap(),
            3
        );
        assert_eq!(
            &f.with(|btree, ctx| btree.read_record_at(ctx, pid, slot, 2)).unwrap()[..],
            b"second"
        );

        // erase the middle duplicate
        f.with(|btree, ctx| btree.erase(ctx, b"k", 2)).unwrap();
        assert_eq!(
            f.with(|btree, ctx| btree.dup_count_at(ctx, pid, slot)).unwrap(),
            2
        );
        assert_eq!(
            &f.with(|btree, ctx| btree.read_record_at(ctx, pid, slot, 2)).unwrap()[..],
            b"third"
        );
    }
}
