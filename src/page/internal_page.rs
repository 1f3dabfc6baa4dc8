use std::cmp::Ordering;

use bytes::Bytes;

use super::base_page::BasePage;
use super::page_id::{PageCategory, PageId, EMPTY_PAGE_ID};
use crate::io::{BurrowReader, BurrowWriter};
use crate::key::KeyType;

/// header: type tag (1), item count (2), ptr-down (8)
pub const INTERNAL_HEADER_SIZE: usize = 1 + 2 + 8;

/// A separator and the child holding keys greater than or equal to it.
///
/// # Format
///
/// - 2 bytes: key size
/// - n bytes: separator key
/// - 8 bytes: child page id
#[derive(Clone)]
pub struct InternalEntry {
    pub key: Bytes,
    pub child: PageId,
}

impl InternalEntry {
    pub fn disk_size(&self) -> usize {
        2 + self.key.len() + 8
    }
}

pub struct InternalPage {
    base: BasePage,
    /// child for keys smaller than the first separator
    ptr_down: PageId,
    entries: Vec<InternalEntry>,
}

impl std::ops::Deref for InternalPage {
    type Target = BasePage;
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for InternalPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl InternalPage {
    pub fn new(pid: PageId) -> Self {
        Self {
            base: BasePage::new(pid),
            ptr_down: EMPTY_PAGE_ID,
            entries: Vec::new(),
        }
    }

    pub fn parse(pid: PageId, bytes: Vec<u8>) -> Option<Self> {
        let mut r = BurrowReader::new(bytes);
        if PageCategory::from_u8(r.read::<u8>()) != Some(PageCategory::Internal) {
            return None;
        }
        let count = r.read::<u16>() as usize;
        let ptr_down = r.read::<u64>();

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_size = r.read::<u16>() as usize;
            let key = Bytes::from(r.read_bytes(key_size));
            let child = r.read::<u64>();
            entries.push(InternalEntry { key, child });
        }

        Some(Self {
            base: BasePage::new(pid),
            ptr_down,
            entries,
        })
    }

    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        let mut w = BurrowWriter::new();
        w.write(&PageCategory::Internal.to_u8());
        w.write(&(self.entries.len() as u16));
        w.write(&self.ptr_down);
        for entry in &self.entries {
            w.write(&(entry.key.len() as u16));
            w.write_bytes(&entry.key);
            w.write(&entry.child);
        }
        w.to_padded_bytes(page_size)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, idx: usize) -> &InternalEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut InternalEntry {
        &mut self.entries[idx]
    }

    pub fn entries(&self) -> &[InternalEntry] {
        &self.entries
    }

    pub fn get_ptr_down(&self) -> PageId {
        self.ptr_down
    }

    pub fn set_ptr_down(&mut self, pid: PageId) {
        self.ptr_down = pid;
    }

    pub fn insert_entry(&mut self, idx: usize, entry: InternalEntry) {
        self.entries.insert(idx, entry);
    }

    pub fn remove_entry(&mut self, idx: usize) -> InternalEntry {
        self.entries.remove(idx)
    }

    pub fn split_off(&mut self, from: usize) -> Vec<InternalEntry> {
        self.entries.split_off(from)
    }

    pub fn append_entries(&mut self, entries: Vec<InternalEntry>) {
        self.entries.extend(entries);
    }

    /// The child to descend into for `key`: the child of the last
    /// separator not greater than `key`, or ptr-down when `key` sorts
    /// before every separator. Returns the entry index (`None` for
    /// ptr-down) together with the child page id.
    pub fn find_child(&self, key_type: KeyType, key: &[u8]) -> (Option<usize>, PageId) {
        let pos = self
            .entries
            .partition_point(|e| key_type.compare(&e.key, key) != Ordering::Greater);
        if pos == 0 {
            (None, self.ptr_down)
        } else {
            (Some(pos - 1), self.entries[pos - 1].child)
        }
    }

    /// Index of the entry pointing at `child`, or `None` if `child` is
    /// the ptr-down child.
    pub fn entry_index_of_child(&self, child: PageId) -> Option<usize> {
        self.entries.iter().position(|e| e.child == child)
    }

    /// The position a new separator would occupy.
    pub fn separator_slot(&self, key_type: KeyType, key: &[u8]) -> usize {
        self.entries
            .partition_point(|e| key_type.compare(&e.key, key) == Ordering::Less)
    }

    pub fn used_bytes(&self) -> usize {
        INTERNAL_HEADER_SIZE + self.entries.iter().map(|e| e.disk_size()).sum::<usize>()
    }

    pub fn check_entry_order(&self, key_type: KeyType) -> bool {
        self.entries
            .windows(2)
            .all(|w| key_type.compare(&w[0].key, &w[1].key) == Ordering::Less)
    }
}
