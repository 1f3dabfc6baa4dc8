use itertools::Itertools;

use super::base_page::BasePage;
use super::page_id::{PageCategory, PageId, EMPTY_PAGE_ID};
use crate::error::{BurrowError, BurrowResult, ErrorKind};
use crate::io::{BurrowReader, BurrowWriter};

pub const ENV_MAGIC: [u8; 4] = *b"BRRW";

/// major, minor, revision, file format
pub const ENV_VERSION: [u8; 4] = [1, 0, 0, 1];

const DESCRIPTOR_DISK_SIZE: usize = 2 + 4 + 2 + 2 + 4 + 8 + 2;

/// fixed part: type tag (1), magic (4), version (4), page size (4),
/// max databases (2), page-manager state blob (8)
const HEADER_FIXED_SIZE: usize = 1 + 4 + 4 + 4 + 2 + 8;

/// One named database inside the environment. `name == 0` marks a free
/// descriptor slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbDescriptor {
    pub name: u16,
    pub flags: u32,
    pub key_type: u16,
    pub key_size: u16,
    pub record_size: u32,
    pub root_pid: PageId,
}

impl DbDescriptor {
    pub fn empty() -> Self {
        Self {
            name: 0,
            flags: 0,
            key_type: 0,
            key_size: 0,
            record_size: 0,
            root_pid: EMPTY_PAGE_ID,
        }
    }

    pub fn is_free(&self) -> bool {
        self.name == 0
    }
}

/// Page 0 of the environment file.
#[derive(Debug)]
pub struct HeaderPage {
    base: BasePage,
    page_size: u32,
    max_databases: u16,
    /// blob holding the serialized free-page bitmap
    state_blob: u64,
    descriptors: Vec<DbDescriptor>,
}

impl std::ops::Deref for HeaderPage {
    type Target = BasePage;
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for HeaderPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl HeaderPage {
    pub fn new(page_size: u32, max_databases: u16) -> BurrowResult<Self> {
        let needed = HEADER_FIXED_SIZE + max_databases as usize * DESCRIPTOR_DISK_SIZE;
        if needed > page_size as usize {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                &format!(
                    "{} databases do not fit into a {}-byte header page",
                    max_databases, page_size
                ),
            ));
        }
        Ok(Self {
            base: BasePage::new(0),
            page_size,
            max_databases,
            state_blob: 0,
            descriptors: vec![DbDescriptor::empty(); max_databases as usize],
        })
    }

    pub fn parse(bytes: Vec<u8>) -> BurrowResult<Self> {
        let mut r = BurrowReader::new(bytes);
        if PageCategory::from_u8(r.read::<u8>()) != Some(PageCategory::Header) {
            return Err(BurrowError::new(
                ErrorKind::InvalidFileHeader,
                "page 0 is not an environment header",
            ));
        }
        let magic = r.read_bytes(4);
        if magic != ENV_MAGIC {
            return Err(BurrowError::new(
                ErrorKind::InvalidFileHeader,
                "bad magic bytes",
            ));
        }
        let version = r.read_bytes(4);
        if version[0] != ENV_VERSION[0] || version[3] != ENV_VERSION[3] {
            return Err(BurrowError::new(
                ErrorKind::InvalidFileVersion,
                &format!(
                    "file version {}.{}.{} (format {}) is not supported",
                    version[0], version[1], version[2], version[3]
                ),
            ));
        }
        let page_size = r.read::<u32>();
        let max_databases = r.read::<u16>();
        let state_blob = r.read::<u64>();

        let mut descriptors = Vec::with_capacity(max_databases as usize);
        for _ in 0..max_databases {
            descriptors.push(DbDescriptor {
                name: r.read::<u16>(),
                flags: r.read::<u32>(),
                key_type: r.read::<u16>(),
                key_size: r.read::<u16>(),
                record_size: r.read::<u32>(),
                root_pid: {
                    let pid = r.read::<u64>();
                    let _reserved = r.read::<u16>();
                    pid
                },
            });
        }

        Ok(Self {
            base: BasePage::new(0),
            page_size,
            max_databases,
            state_blob,
            descriptors,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = BurrowWriter::new();
        w.write(&PageCategory::Header.to_u8());
        w.write_bytes(&ENV_MAGIC);
        w.write_bytes(&ENV_VERSION);
        w.write(&self.page_size);
        w.write(&self.max_databases);
        w.write(&self.state_blob);
        for d in &self.descriptors {
            w.write(&d.name);
            w.write(&d.flags);
            w.write(&d.key_type);
            w.write(&d.key_size);
            w.write(&d.record_size);
            w.write(&d.root_pid);
            w.write(&0u16); // reserved
        }
        w.to_padded_bytes(self.page_size as usize)
    }

    pub fn get_page_size(&self) -> u32 {
        self.page_size
    }

    pub fn get_max_databases(&self) -> u16 {
        self.max_databases
    }

    pub fn get_state_blob(&self) -> u64 {
        self.state_blob
    }

    pub fn set_state_blob(&mut self, blob: u64) {
        self.state_blob = blob;
    }

    pub fn descriptor(&self, slot: u16) -> &DbDescriptor {
        &self.descriptors[slot as usize]
    }

    pub fn descriptor_mut(&mut self, slot: u16) -> &mut DbDescriptor {
        &mut self.descriptors[slot as usize]
    }

    /// The descriptor slot for a database name, if present.
    pub fn find_database(&self, name: u16) -> Option<u16> {
        self.descriptors
            .iter()
            .position(|d| d.name == name)
            .map(|p| p as u16)
    }

    pub fn find_free_slot(&self) -> Option<u16> {
        self.descriptors
            .iter()
            .position(|d| d.is_free())
            .map(|p| p as u16)
    }

    pub fn database_names(&self) -> Vec<u16> {
        self.descriptors
            .iter()
            .filter(|d| !d.is_free())
            .map(|d| d.name)
            .sorted()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut header = HeaderPage::new(1024, 8).unwrap();
        header.set_state_blob(77);
        let slot = header.find_free_slot().unwrap();
        *header.descriptor_mut(slot) = DbDescriptor {
            name: 1,
            flags: 3,
            key_type: 7,
            key_size: u16::MAX,
            record_size: u32::MAX,
            root_pid: 5,
        };

        let parsed = HeaderPage::parse(header.serialize()).unwrap();
        assert_eq!(parsed.get_page_size(), 1024);
        assert_eq!(parsed.get_max_databases(), 8);
        assert_eq!(parsed.get_state_blob(), 77);
        assert_eq!(parsed.find_database(1), Some(0));
        assert_eq!(parsed.descriptor(0).root_pid, 5);
        assert_eq!(parsed.database_names(), vec![1]);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let header = HeaderPage::new(1024, 4).unwrap();
        let mut image = header.serialize();
        image[1] = b'x';
        let err = HeaderPage::parse(image).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidFileHeader);
    }

    #[test]
    fn test_too_many_databases() {
        let err = HeaderPage::new(1024, 200).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
    }
}
