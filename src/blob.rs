//! Storage for records that exceed the inline threshold and for
//! duplicate lists. A blob occupies a contiguous run of pages; its id is
//! the first page of the run.

use bytes::Bytes;
use log::debug;

use crate::error::{BurrowError, BurrowResult, ErrorKind};
use crate::io::{BurrowReader, BurrowWriter};
use crate::page::{PageCategory, PageId};
use crate::page_store::PageStore;

/// first page only: type tag (1), payload size (8), run length (4)
const BLOB_HEADER_SIZE: usize = 1 + 8 + 4;

pub struct BlobManager {
    cache: std::collections::HashMap<u64, Bytes>,
    pub blobs_allocated: u64,
}

impl BlobManager {
    pub fn new() -> Self {
        Self {
            cache: std::collections::HashMap::new(),
            blobs_allocated: 0,
        }
    }

    fn pages_needed(&self, store: &PageStore, payload: usize) -> usize {
        let total = BLOB_HEADER_SIZE + payload;
        (total + store.page_size() - 1) / store.page_size()
    }

    pub fn allocate(&mut self, store: &mut PageStore, data: &[u8]) -> u64 {
        let pages = self.pages_needed(store, data.len()).max(1);
        let pid = store.allocate_run(pages);
        self.write_run(store, pid, pages, data);
        self.cache.insert(pid, Bytes::copy_from_slice(data));
        self.blobs_allocated += 1;
        debug!("allocate blob, id: {}, size: {}, pages: {}", pid, data.len(), pages);
        pid
    }

    pub fn read(&mut self, store: &mut PageStore, id: u64) -> BurrowResult<Bytes> {
        if let Some(data) = self.cache.get(&id) {
            return Ok(data.clone());
        }

        let (size, run) = self.read_header(store, id)?;
        let mut raw = Vec::with_capacity(run * store.page_size());
        for i in 0..run {
            raw.extend(store.read_raw(id + i as u64)?);
        }
        let data = Bytes::copy_from_slice(&raw[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + size]);
        self.cache.insert(id, data.clone());
        Ok(data)
    }

    /// Replace a blob's payload. Relocates (and returns a new id) when
    /// the new payload no longer fits into the existing page run.
    pub fn overwrite(&mut self, store: &mut PageStore, id: u64, data: &[u8]) -> BurrowResult<u64> {
        let (_, run) = self.read_header(store, id)?;
        let needed = self.pages_needed(store, data.len()).max(1);

        if needed <= run {
            self.write_run(store, id, run, data);
            self.cache.insert(id, Bytes::copy_from_slice(data));
            return Ok(id);
        }

        self.free(store, id)?;
        Ok(self.allocate(store, data))
    }

    /// Whether `data` would fit into a run of `run` pages.
    pub fn fits_run(&self, store: &PageStore, run: usize, data_len: usize) -> bool {
        BLOB_HEADER_SIZE + data_len <= run * store.page_size()
    }

    /// Write a blob into an already-acquired page run. Used for the
    /// page-manager state snapshot, whose content depends on the
    /// allocation itself.
    pub fn write_preallocated(
        &mut self,
        store: &mut PageStore,
        pid: PageId,
        run: usize,
        data: &[u8],
    ) {
        debug_assert!(self.fits_run(store, run, data.len()));
        self.write_run(store, pid, run, data);
        self.cache.insert(pid, Bytes::copy_from_slice(data));
    }

    pub fn free(&mut self, store: &mut PageStore, id: u64) -> BurrowResult<()> {
        let (_, run) = self.read_header(store, id)?;
        store.free_run(id, run);
        self.cache.remove(&id);
        Ok(())
    }

    fn read_header(&self, store: &mut PageStore, id: u64) -> BurrowResult<(usize, usize)> {
        let first = store.read_raw(id)?;
        let mut r = BurrowReader::new(first);
        if PageCategory::from_u8(r.read::<u8>()) != Some(PageCategory::Blob) {
            return Err(BurrowError::new(
                ErrorKind::BlobNotFound,
                &format!("page {} is not a blob page", id),
            ));
        }
        let size = r.read::<u64>() as usize;
        let run = r.read::<u32>() as usize;
        Ok((size, run))
    }

    fn write_run(&self, store: &mut PageStore, pid: PageId, run: usize, data: &[u8]) {
        let mut w = BurrowWriter::new();
        w.write(&PageCategory::Blob.to_u8());
        w.write(&(data.len() as u64));
        w.write(&(run as u32));
        w.write_bytes(data);
        let image = w.to_padded_bytes(run * store.page_size());

        for (i, chunk) in image.chunks(store.page_size()).enumerate() {
            store.write_raw(pid + i as u64, chunk.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PageStore, BlobManager) {
        (PageStore::new(None, 256, 16), BlobManager::new())
    }

    #[test]
    fn test_small_blob_round_trip() {
        let (mut store, mut blobs) = setup();
        let id = blobs.allocate(&mut store, b"hello blob");
        assert_eq!(&blobs.read(&mut store, id).unwrap()[..], b"hello blob");
    }

    #[test]
    fn test_multi_page_blob() {
        let (mut store, mut blobs) = setup();
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let id = blobs.allocate(&mut store, &data);
        // survive a cache drop
        blobs.cache.clear();
        assert_eq!(&blobs.read(&mut store, id).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_overwrite_in_place_and_relocated() {
        let (mut store, mut blobs) = setup();
        let id = blobs.allocate(&mut store, &[7u8; 300]);

        // shrinking stays in place
        let same = blobs.overwrite(&mut store, id, b"tiny").unwrap();
        assert_eq!(same, id);
        assert_eq!(&blobs.read(&mut store, id).unwrap()[..], b"tiny");

        // growing past the run relocates
        let moved = blobs.overwrite(&mut store, id, &[9u8; 2000]).unwrap();
        assert_ne!(moved, id);
        assert_eq!(blobs.read(&mut store, moved).unwrap().len(), 2000);
    }

    #[test]
    fn test_free_releases_pages() {
        let (mut store, mut blobs) = setup();
        let id = blobs.allocate(&mut store, &[1u8; 600]);
        let pages_before = store.page_count();
        blobs.free(&mut store, id).unwrap();
        // the freed run is reused by the next allocation
        let id2 = blobs.allocate(&mut store, &[2u8; 600]);
        assert_eq!(id2, id);
        assert_eq!(store.page_count(), pages_before);
    }
}
