use std::cmp::Ordering;

use bytes::Bytes;

use super::base_page::BasePage;
use super::page_id::{PageCategory, PageId, EMPTY_PAGE_ID};
use crate::io::{BurrowReader, BurrowWriter};
use crate::key::KeyType;
use crate::record::RecordLocator;

/// header: type tag (1), item count (2), left sibling (8),
/// right sibling (8), lsn (8)
pub const LEAF_HEADER_SIZE: usize = 1 + 2 + 8 + 8 + 8;

/// One slot of a leaf page.
///
/// # Format
///
/// - 2 bytes: key size
/// - n bytes: key
/// - locator (see `RecordLocator::serialize`)
#[derive(Clone)]
pub struct LeafItem {
    pub key: Bytes,
    pub locator: RecordLocator,
}

impl LeafItem {
    pub fn disk_size(&self) -> usize {
        2 + self.key.len() + self.locator.disk_size()
    }
}

pub struct LeafPage {
    base: BasePage,
    items: Vec<LeafItem>,
    left_sibling: PageId,
    right_sibling: PageId,
    lsn: u64,
}

impl std::ops::Deref for LeafPage {
    type Target = BasePage;
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for LeafPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl LeafPage {
    pub fn new(pid: PageId) -> Self {
        Self {
            base: BasePage::new(pid),
            items: Vec::new(),
            left_sibling: EMPTY_PAGE_ID,
            right_sibling: EMPTY_PAGE_ID,
            lsn: 0,
        }
    }

    pub fn parse(pid: PageId, bytes: Vec<u8>) -> Option<Self> {
        let mut r = BurrowReader::new(bytes);
        if PageCategory::from_u8(r.read::<u8>()) != Some(PageCategory::Leaf) {
            return None;
        }
        let count = r.read::<u16>() as usize;
        let left_sibling = r.read::<u64>();
        let right_sibling = r.read::<u64>();
        let lsn = r.read::<u64>();

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let key_size = r.read::<u16>() as usize;
            let key = Bytes::from(r.read_bytes(key_size));
            let locator = RecordLocator::parse(&mut r);
            items.push(LeafItem { key, locator });
        }

        Some(Self {
            base: BasePage::new(pid),
            items,
            left_sibling,
            right_sibling,
            lsn,
        })
    }

    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        let mut w = BurrowWriter::new();
        w.write(&PageCategory::Leaf.to_u8());
        w.write(&(self.items.len() as u16));
        w.write(&self.left_sibling);
        w.write(&self.right_sibling);
        w.write(&self.lsn);
        for item in &self.items {
            w.write(&(item.key.len() as u16));
            w.write_bytes(&item.key);
            item.locator.serialize(&mut w);
        }
        w.to_padded_bytes(page_size)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn item(&self, slot: usize) -> &LeafItem {
        &self.items[slot]
    }

    pub fn item_mut(&mut self, slot: usize) -> &mut LeafItem {
        &mut self.items[slot]
    }

    pub fn items(&self) -> &[LeafItem] {
        &self.items
    }

    pub fn insert_item(&mut self, slot: usize, item: LeafItem) {
        self.items.insert(slot, item);
    }

    pub fn remove_item(&mut self, slot: usize) -> LeafItem {
        self.items.remove(slot)
    }

    /// Move the items at `from..` out of this page (for a split).
    pub fn split_off(&mut self, from: usize) -> Vec<LeafItem> {
        self.items.split_off(from)
    }

    pub fn append_items(&mut self, items: Vec<LeafItem>) {
        self.items.extend(items);
    }

    pub fn prepend_item(&mut self, item: LeafItem) {
        self.items.insert(0, item);
    }

    /// Binary search for `key`: `Ok(slot)` on an exact match, otherwise
    /// `Err(insertion_point)`.
    pub fn find_slot(&self, key_type: KeyType, key: &[u8]) -> Result<usize, usize> {
        self.items
            .binary_search_by(|item| key_type.compare(&item.key, key))
    }

    pub fn used_bytes(&self) -> usize {
        LEAF_HEADER_SIZE + self.items.iter().map(|i| i.disk_size()).sum::<usize>()
    }

    pub fn get_left_pid(&self) -> Option<PageId> {
        if self.left_sibling == EMPTY_PAGE_ID {
            None
        } else {
            Some(self.left_sibling)
        }
    }

    pub fn set_left_pid(&mut self, pid: Option<PageId>) {
        self.left_sibling = pid.unwrap_or(EMPTY_PAGE_ID);
    }

    pub fn get_right_pid(&self) -> Option<PageId> {
        if self.right_sibling == EMPTY_PAGE_ID {
            None
        } else {
            Some(self.right_sibling)
        }
    }

    pub fn set_right_pid(&mut self, pid: Option<PageId>) {
        self.right_sibling = pid.unwrap_or(EMPTY_PAGE_ID);
    }

    pub fn get_lsn(&self) -> u64 {
        self.lsn
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = lsn;
    }

    /// Ascending key order within the page.
    pub fn check_item_order(&self, key_type: KeyType) -> bool {
        self.items
            .windows(2)
            .all(|w| key_type.compare(&w[0].key, &w[1].key) == Ordering::Less)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &[u8], record: &[u8]) -> LeafItem {
        LeafItem {
            key: Bytes::copy_from_slice(key),
            locator: RecordLocator::Inline(Bytes::copy_from_slice(record)),
        }
    }

    #[test]
    fn test_parse_round_trip() {
        let mut page = LeafPage::new(3);
        page.insert_item(0, item(b"alpha", b"1"));
        page.insert_item(1, item(b"beta", b"2"));
        page.set_left_pid(Some(2));
        page.set_right_pid(Some(4));
        page.set_lsn(99);

        let image = page.serialize(512);
        assert_eq!(image.len(), 512);

        let parsed = LeafPage::parse(3, image).unwrap();
        assert_eq!(parsed.item_count(), 2);
        assert_eq!(&parsed.item(0).key[..], b"alpha");
        assert_eq!(&parsed.item(1).key[..], b"beta");
        assert_eq!(parsed.get_left_pid(), Some(2));
        assert_eq!(parsed.get_right_pid(), Some(4));
        assert_eq!(parsed.get_lsn(), 99);
    }

    #[test]
    fn test_find_slot() {
        let mut page = LeafPage::new(1);
        for key in [b"b", b"d", b"f"].iter() {
            let pos = page.find_slot(KeyType::Binary, *key).unwrap_err();
            page.insert_item(pos, item(*key, b"x"));
        }
        assert_eq!(page.find_slot(KeyType::Binary, b"d"), Ok(1));
        assert_eq!(page.find_slot(KeyType::Binary, b"a"), Err(0));
        assert_eq!(page.find_slot(KeyType::Binary, b"c"), Err(1));
        assert_eq!(page.find_slot(KeyType::Binary, b"g"), Err(3));
    }

    #[test]
    fn test_item_order_check() {
        let mut page = LeafPage::new(1);
        page.insert_item(0, item(b"a", b"x"));
        page.insert_item(1, item(b"c", b"x"));
        assert!(page.check_item_order(KeyType::Binary));
        page.insert_item(1, item(b"z", b"x"));
        assert!(!page.check_item_order(KeyType::Binary));
    }
}
