//! The page cache: fetches, pins and flushes fixed-size pages by page id,
//! tracks the per-operation changeset, and owns the free-page bitmap.

use std::collections::{HashMap, HashSet};

use bit_vec::BitVec;
use log::debug;

use crate::error::{BurrowError, BurrowResult, ErrorKind};
use crate::io::BurrowFile;
use crate::page::{InternalPage, LeafPage, PageId};
use crate::types::{pod, Pod};
use crate::utils::HandyRwLock;

#[derive(Debug, Default, Clone)]
pub struct StoreMetrics {
    pub pages_fetched: u64,
    pub pages_flushed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// A fetched B+tree node; the page's type byte decides the view.
pub enum NodeRef {
    Leaf(Pod<LeafPage>),
    Internal(Pod<InternalPage>),
}

pub struct PageStore {
    file: Option<BurrowFile>,
    page_size: usize,
    cache_capacity: usize,

    leaf_cache: HashMap<PageId, Pod<LeafPage>>,
    internal_cache: HashMap<PageId, Pod<InternalPage>>,
    /// raw images of blob pages
    raw_cache: HashMap<PageId, Vec<u8>>,
    raw_dirty: HashSet<PageId>,

    /// bit per page; set = free for reuse
    free: BitVec,
    /// total pages the file spans (page 0 included)
    page_count: u64,

    /// pages touched by the current top-level operation
    changeset: HashSet<PageId>,

    pub metrics: StoreMetrics,
}

impl PageStore {
    pub fn new(file: Option<BurrowFile>, page_size: usize, cache_capacity: usize) -> Self {
        Self {
            file,
            page_size,
            cache_capacity,
            leaf_cache: HashMap::new(),
            internal_cache: HashMap::new(),
            raw_cache: HashMap::new(),
            raw_dirty: HashSet::new(),
            free: BitVec::new(),
            page_count: 1, // page 0 is the environment header
            changeset: HashSet::new(),
            metrics: StoreMetrics::default(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_in_memory(&self) -> bool {
        self.file.is_none()
    }

    pub fn set_page_count(&mut self, count: u64) {
        self.page_count = count;
        if self.free.len() < count as usize {
            self.free.grow(count as usize - self.free.len(), false);
        }
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    // ------------------------------------------------------------------
    // fetch / allocate / free
    // ------------------------------------------------------------------

    pub fn fetch_leaf(&mut self, pid: PageId) -> BurrowResult<Pod<LeafPage>> {
        self.metrics.pages_fetched += 1;
        if let Some(page) = self.leaf_cache.get(&pid) {
            self.metrics.cache_hits += 1;
            self.changeset.insert(pid);
            return Ok(page.clone());
        }
        self.metrics.cache_misses += 1;

        let bytes = self.read_page_bytes(pid)?;
        let page = LeafPage::parse(pid, bytes).ok_or_else(|| {
            BurrowError::new(
                ErrorKind::IntegrityViolated,
                &format!("page {} is not a leaf page", pid),
            )
        })?;
        let page = pod(page);
        self.leaf_cache.insert(pid, page.clone());
        self.changeset.insert(pid);
        Ok(page)
    }

    pub fn fetch_internal(&mut self, pid: PageId) -> BurrowResult<Pod<InternalPage>> {
        self.metrics.pages_fetched += 1;
        if let Some(page) = self.internal_cache.get(&pid) {
            self.metrics.cache_hits += 1;
            self.changeset.insert(pid);
            return Ok(page.clone());
        }
        self.metrics.cache_misses += 1;

        let bytes = self.read_page_bytes(pid)?;
        let page = InternalPage::parse(pid, bytes).ok_or_else(|| {
            BurrowError::new(
                ErrorKind::IntegrityViolated,
                &format!("page {} is not an internal page", pid),
            )
        })?;
        let page = pod(page);
        self.internal_cache.insert(pid, page.clone());
        self.changeset.insert(pid);
        Ok(page)
    }

    /// Fetch a page whose kind (leaf or internal) is not known to the
    /// caller, e.g. during a root-to-leaf descent.
    pub fn fetch_node(&mut self, pid: PageId) -> BurrowResult<NodeRef> {
        if self.leaf_cache.contains_key(&pid) {
            return Ok(NodeRef::Leaf(self.fetch_leaf(pid)?));
        }
        if self.internal_cache.contains_key(&pid) {
            return Ok(NodeRef::Internal(self.fetch_internal(pid)?));
        }

        let bytes = self.read_page_bytes(pid)?;
        match bytes.first().and_then(|&b| crate::page::PageCategory::from_u8(b)) {
            Some(crate::page::PageCategory::Leaf) => {
                let page = LeafPage::parse(pid, bytes).ok_or_else(|| {
                    BurrowError::new(ErrorKind::IntegrityViolated, "malformed leaf page")
                })?;
                let page = pod(page);
                self.leaf_cache.insert(pid, page.clone());
                self.changeset.insert(pid);
                self.metrics.pages_fetched += 1;
                self.metrics.cache_misses += 1;
                Ok(NodeRef::Leaf(page))
            }
            Some(crate::page::PageCategory::Internal) => {
                let page = InternalPage::parse(pid, bytes).ok_or_else(|| {
                    BurrowError::new(ErrorKind::IntegrityViolated, "malformed internal page")
                })?;
                let page = pod(page);
                self.internal_cache.insert(pid, page.clone());
                self.changeset.insert(pid);
                self.metrics.pages_fetched += 1;
                self.metrics.cache_misses += 1;
                Ok(NodeRef::Internal(page))
            }
            _ => Err(BurrowError::new(
                ErrorKind::IntegrityViolated,
                &format!("page {} is not a b+tree node", pid),
            )),
        }
    }

    pub fn allocate_leaf(&mut self) -> BurrowResult<Pod<LeafPage>> {
        let pid = self.acquire_page_id();
        debug!("allocate leaf page, pid: {}", pid);
        let page = pod(LeafPage::new(pid));
        page.wl().set_dirty(true);
        self.leaf_cache.insert(pid, page.clone());
        self.changeset.insert(pid);
        Ok(page)
    }

    pub fn allocate_internal(&mut self) -> BurrowResult<Pod<InternalPage>> {
        let pid = self.acquire_page_id();
        debug!("allocate internal page, pid: {}", pid);
        let page = pod(InternalPage::new(pid));
        page.wl().set_dirty(true);
        self.internal_cache.insert(pid, page.clone());
        self.changeset.insert(pid);
        Ok(page)
    }

    /// Acquire `count` contiguous pages (for blobs). Returns the first id.
    pub fn allocate_run(&mut self, count: usize) -> PageId {
        if count == 0 {
            return 0;
        }
        let limit = self.free.len();
        let mut run = 0;
        let mut start = 0;
        for i in 0..limit {
            if self.free.get(i).unwrap_or(false) {
                if run == 0 {
                    start = i;
                }
                run += 1;
                if run == count {
                    for j in start..start + count {
                        self.free.set(j, false);
                    }
                    return start as PageId;
                }
            } else {
                run = 0;
            }
        }
        let pid = self.page_count;
        self.page_count += count as u64;
        self.grow_bitmap();
        pid
    }

    pub fn write_raw(&mut self, pid: PageId, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), self.page_size);
        self.raw_cache.insert(pid, bytes);
        self.raw_dirty.insert(pid);
        self.changeset.insert(pid);
    }

    pub fn read_raw(&mut self, pid: PageId) -> BurrowResult<Vec<u8>> {
        if let Some(bytes) = self.raw_cache.get(&pid) {
            return Ok(bytes.clone());
        }
        let bytes = self.read_page_bytes(pid)?;
        self.raw_cache.insert(pid, bytes.clone());
        Ok(bytes)
    }

    pub fn free_page(&mut self, pid: PageId) {
        self.leaf_cache.remove(&pid);
        self.internal_cache.remove(&pid);
        self.raw_cache.remove(&pid);
        self.raw_dirty.remove(&pid);
        self.changeset.remove(&pid);
        if (pid as usize) >= self.free.len() {
            self.free.grow(pid as usize + 1 - self.free.len(), false);
        }
        self.free.set(pid as usize, true);
    }

    pub fn free_run(&mut self, pid: PageId, count: usize) {
        for i in 0..count {
            self.free_page(pid + i as u64);
        }
    }

    fn acquire_page_id(&mut self) -> PageId {
        for i in 1..self.free.len() {
            if self.free.get(i).unwrap_or(false) {
                self.free.set(i, false);
                return i as PageId;
            }
        }
        let pid = self.page_count;
        self.page_count += 1;
        self.grow_bitmap();
        pid
    }

    fn grow_bitmap(&mut self) {
        if self.free.len() < self.page_count as usize {
            self.free.grow(self.page_count as usize - self.free.len(), false);
        }
    }

    fn read_page_bytes(&mut self, pid: PageId) -> BurrowResult<Vec<u8>> {
        let page_size = self.page_size;
        match &mut self.file {
            Some(file) => file.read_at(pid * page_size as u64, page_size),
            None => Err(BurrowError::new(
                ErrorKind::IoError,
                &format!("page {} is not resident in the in-memory arena", pid),
            )),
        }
    }

    // ------------------------------------------------------------------
    // changeset
    // ------------------------------------------------------------------

    pub fn mark_dirty(&mut self, pid: PageId) {
        self.changeset.insert(pid);
        if let Some(page) = self.leaf_cache.get(&pid) {
            page.wl().set_dirty(true);
        } else if let Some(page) = self.internal_cache.get(&pid) {
            page.wl().set_dirty(true);
        }
    }

    /// Forget the pages collected by a read-like operation. Dirty bits
    /// survive; the pages will reach disk with the next mutation flush.
    pub fn clear_changeset(&mut self) {
        self.changeset.clear();
    }

    pub fn changeset_is_empty(&self) -> bool {
        self.changeset.is_empty()
    }

    /// Write every dirty page of the changeset, stamping leaves with
    /// `lsn`, then clear it.
    pub fn flush_changeset(&mut self, lsn: u64) -> BurrowResult<()> {
        let pids: Vec<PageId> = self.changeset.drain().collect();
        for pid in pids {
            self.flush_page(pid, lsn)?;
        }
        Ok(())
    }

    /// Write every dirty page, cached or listed.
    pub fn flush_all(&mut self, lsn: u64) -> BurrowResult<()> {
        let mut pids: Vec<PageId> = self.leaf_cache.keys().cloned().collect();
        pids.extend(self.internal_cache.keys());
        pids.extend(self.raw_dirty.iter());
        for pid in pids {
            self.flush_page(pid, lsn)?;
        }
        self.changeset.clear();
        if let Some(file) = &mut self.file {
            file.sync()?;
        }
        Ok(())
    }

    fn flush_page(&mut self, pid: PageId, lsn: u64) -> BurrowResult<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let page_size = self.page_size;
        let offset = pid * page_size as u64;

        if let Some(page) = self.leaf_cache.get(&pid) {
            let image = {
                let mut leaf = page.wl();
                if !leaf.is_dirty() {
                    return Ok(());
                }
                if lsn > 0 {
                    leaf.set_lsn(lsn);
                }
                leaf.set_dirty(false);
                leaf.serialize(page_size)
            };
            self.file.as_mut().unwrap().write_at(offset, &image)?;
            self.metrics.pages_flushed += 1;
        } else if let Some(page) = self.internal_cache.get(&pid) {
            let image = {
                let mut node = page.wl();
                if !node.is_dirty() {
                    return Ok(());
                }
                node.set_dirty(false);
                node.serialize(page_size)
            };
            self.file.as_mut().unwrap().write_at(offset, &image)?;
            self.metrics.pages_flushed += 1;
        } else if self.raw_dirty.remove(&pid) {
            if let Some(image) = self.raw_cache.get(&pid) {
                let image = image.clone();
                self.file.as_mut().unwrap().write_at(offset, &image)?;
                self.metrics.pages_flushed += 1;
            }
        }
        Ok(())
    }

    /// Write the environment header image at page 0.
    pub fn write_header_image(&mut self, image: &[u8]) -> BurrowResult<()> {
        debug_assert_eq!(image.len(), self.page_size);
        if let Some(file) = &mut self.file {
            file.write_at(0, image)?;
            self.metrics.pages_flushed += 1;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> BurrowResult<()> {
        if let Some(file) = &mut self.file {
            file.sync()?;
        }
        Ok(())
    }

    /// Evict clean, unpinned pages once the cache exceeds its capacity.
    /// Pages with coupled cursors or pending changes stay resident.
    pub fn purge_cache(&mut self) {
        if self.is_in_memory() {
            return;
        }
        let resident = self.leaf_cache.len() + self.internal_cache.len();
        if resident <= self.cache_capacity {
            return;
        }
        let mut evicted = 0;
        let changeset = &self.changeset;
        self.leaf_cache.retain(|pid, page| {
            let keep = {
                let p = page.rl();
                p.is_dirty() || !p.cursor_list().is_empty() || changeset.contains(pid)
            };
            if !keep {
                evicted += 1;
            }
            keep
        });
        self.internal_cache.retain(|pid, page| {
            let keep = {
                let p = page.rl();
                p.is_dirty() || changeset.contains(pid)
            };
            if !keep {
                evicted += 1;
            }
            keep
        });
        let raw_dirty = &self.raw_dirty;
        self.raw_cache
            .retain(|pid, _| raw_dirty.contains(pid) || changeset.contains(pid));
        debug!("cache purge, evicted: {}", evicted);
    }

    // ------------------------------------------------------------------
    // free-bitmap persistence (the page-manager state blob)
    // ------------------------------------------------------------------

    pub fn encode_state(&self) -> Vec<u8> {
        let mut bytes = (self.page_count as u64).to_le_bytes().to_vec();
        bytes.extend(self.free.to_bytes());
        bytes
    }

    pub fn restore_state(&mut self, bytes: &[u8]) -> BurrowResult<()> {
        if bytes.len() < 8 {
            return Err(BurrowError::new(
                ErrorKind::InvalidFileHeader,
                "truncated page-manager state",
            ));
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[..8]);
        self.page_count = u64::from_le_bytes(count);
        self.free = BitVec::from_bytes(&bytes[8..]);
        if self.free.len() < self.page_count as usize {
            self.free
                .grow(self.page_count as usize - self.free.len(), false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> PageStore {
        PageStore::new(None, 512, 16)
    }

    #[test]
    fn test_allocation_is_monotone_then_reuses() {
        let mut store = memory_store();
        let a = store.allocate_leaf().unwrap().rl().get_pid();
        let b = store.allocate_leaf().unwrap().rl().get_pid();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        store.free_page(a);
        let c = store.allocate_leaf().unwrap().rl().get_pid();
        assert_eq!(c, a);
    }

    #[test]
    fn test_run_allocation() {
        let mut store = memory_store();
        let run = store.allocate_run(3);
        assert_eq!(run, 1);
        let next = store.allocate_run(2);
        assert_eq!(next, 4);

        store.free_run(run, 3);
        // a 2-page run fits into the freed gap
        assert_eq!(store.allocate_run(2), 1);
    }

    #[test]
    fn test_changeset_collects_fetches() {
        let mut store = memory_store();
        let page = store.allocate_leaf().unwrap();
        let pid = page.rl().get_pid();
        assert!(!store.changeset_is_empty());

        store.clear_changeset();
        assert!(store.changeset_is_empty());

        store.fetch_leaf(pid).unwrap();
        assert!(!store.changeset_is_empty());
    }

    #[test]
    fn test_state_round_trip() {
        let mut store = memory_store();
        let a = store.allocate_leaf().unwrap().rl().get_pid();
        let _ = store.allocate_leaf().unwrap();
        store.free_page(a);

        let state = store.encode_state();
        let mut other = memory_store();
        other.restore_state(&state).unwrap();
        assert_eq!(other.page_count(), store.page_count());
        // the freed page is reused first
        assert_eq!(other.allocate_run(1), a);
    }
}
