//! Record payloads and the on-disk locator that a leaf item stores.

use bytes::Bytes;

use crate::io::{BurrowReader, BurrowWriter};

/// Records up to this size are stored inside the leaf item.
pub const INLINE_RECORD_MAX: usize = 8;

/// Upper bound for leaf-inline records of databases with fixed-length
/// records.
pub const FORCED_INLINE_MAX: usize = 32;

const LOCATOR_INLINE: u8 = 0;
const LOCATOR_BLOB: u8 = 1;
const LOCATOR_DUPLIST: u8 = 2;

/// Where a leaf item's record lives: inline in the leaf, in a blob, or —
/// once the key has at least two duplicates — in a duplicate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordLocator {
    Inline(Bytes),
    Blob(u64),
    DupList(u64),
}

impl RecordLocator {
    /// Serialized size of this locator inside a leaf item.
    pub fn disk_size(&self) -> usize {
        match self {
            RecordLocator::Inline(data) => 1 + 1 + data.len(),
            RecordLocator::Blob(_) | RecordLocator::DupList(_) => 1 + 8,
        }
    }

    pub fn serialize(&self, writer: &mut BurrowWriter) {
        match self {
            RecordLocator::Inline(data) => {
                writer.write(&LOCATOR_INLINE);
                writer.write(&(data.len() as u8));
                writer.write_bytes(data);
            }
            RecordLocator::Blob(id) => {
                writer.write(&LOCATOR_BLOB);
                writer.write(id);
            }
            RecordLocator::DupList(id) => {
                writer.write(&LOCATOR_DUPLIST);
                writer.write(id);
            }
        }
    }

    pub fn parse(reader: &mut BurrowReader) -> Self {
        match reader.read::<u8>() {
            LOCATOR_INLINE => {
                let len = reader.read::<u8>() as usize;
                RecordLocator::Inline(Bytes::from(reader.read_bytes(len)))
            }
            LOCATOR_BLOB => RecordLocator::Blob(reader.read::<u64>()),
            tag => {
                debug_assert_eq!(tag, LOCATOR_DUPLIST);
                RecordLocator::DupList(reader.read::<u64>())
            }
        }
    }
}

/// The materialized duplicate list of one key, stored as a blob. Entries
/// are ordered; each is itself an inline record or a blob reference.
#[derive(Debug, Clone, Default)]
pub struct DupList {
    pub entries: Vec<RecordLocator>,
}

impl DupList {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = BurrowWriter::new();
        w.write(&(self.entries.len() as u32));
        for entry in &self.entries {
            entry.serialize(&mut w);
        }
        Bytes::from(w.to_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut r = BurrowReader::new(bytes.to_vec());
        let count = r.read::<u32>() as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(RecordLocator::parse(&mut r));
        }
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_round_trip() {
        let locators = vec![
            RecordLocator::Inline(Bytes::from_static(b"12345")),
            RecordLocator::Blob(0xdead_beef),
            RecordLocator::DupList(42),
        ];
        for locator in locators {
            let mut w = BurrowWriter::new();
            locator.serialize(&mut w);
            let bytes = w.to_bytes();
            assert_eq!(bytes.len(), locator.disk_size());
            let parsed = RecordLocator::parse(&mut BurrowReader::new(bytes));
            assert_eq!(parsed, locator);
        }
    }

    #[test]
    fn test_dup_list_round_trip() {
        let mut list = DupList::new();
        list.entries.push(RecordLocator::Inline(Bytes::from_static(b"a")));
        list.entries.push(RecordLocator::Blob(7));
        list.entries.push(RecordLocator::Inline(Bytes::from_static(b"ccc")));

        let decoded = DupList::decode(&list.encode());
        assert_eq!(decoded.entries, list.entries);
    }
}
