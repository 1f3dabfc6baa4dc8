//! The write-ahead journal: length-prefixed, lsn-tagged records of every
//! transactional mutation, replayed on recovery.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{BurrowError, BurrowResult, DbResult, ErrorKind};
use crate::io::{BurrowFile, BurrowReader, BurrowWriter};

const JOURNAL_MAGIC: [u8; 4] = *b"BRWJ";
const JOURNAL_VERSION: u32 = 1;

/// magic (4) + version (4) + flushed lsn (8)
const JOURNAL_HEADER_SIZE: u64 = 16;

#[derive(Debug, PartialEq, Clone, Copy)]
enum RecordType {
    TxnBegin,
    TxnCommit,
    TxnAbort,
    Insert,
    Erase,
}

impl RecordType {
    fn to_u8(self) -> u8 {
        match self {
            RecordType::TxnBegin => 1,
            RecordType::TxnCommit => 2,
            RecordType::TxnAbort => 3,
            RecordType::Insert => 4,
            RecordType::Erase => 5,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::TxnBegin),
            2 => Some(RecordType::TxnCommit),
            3 => Some(RecordType::TxnAbort),
            4 => Some(RecordType::Insert),
            5 => Some(RecordType::Erase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveredOpKind {
    Insert,
    Erase,
}

/// One replayable operation of a committed-but-unflushed transaction.
#[derive(Debug, Clone)]
pub struct RecoveredOp {
    pub db: u16,
    pub txn_id: u64,
    pub lsn: u64,
    pub kind: RecoveredOpKind,
    pub key: Vec<u8>,
    pub record: Vec<u8>,
    pub flags: u32,
    pub dup_index: u32,
}

pub struct Journal {
    file: BurrowFile,
    path: PathBuf,
    flushed_lsn: u64,
    pub bytes_appended: u64,
}

impl Journal {
    pub fn create<P: AsRef<Path>>(path: P) -> BurrowResult<Self> {
        let mut file = BurrowFile::create(&path)?;
        let mut w = BurrowWriter::new();
        w.write_bytes(&JOURNAL_MAGIC);
        w.write(&JOURNAL_VERSION);
        w.write(&0u64);
        file.write_at(0, &w.to_bytes())?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            flushed_lsn: 0,
            bytes_appended: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> BurrowResult<Self> {
        let mut file = BurrowFile::open(&path)?;
        let header = file.read_at(0, JOURNAL_HEADER_SIZE as usize).map_err(|_| {
            BurrowError::new(ErrorKind::LogInvalidFileHeader, "truncated journal header")
        })?;
        let mut r = BurrowReader::new(header);
        if r.read_bytes(4) != JOURNAL_MAGIC {
            return Err(BurrowError::new(
                ErrorKind::LogInvalidFileHeader,
                "bad journal magic",
            ));
        }
        if r.read::<u32>() != JOURNAL_VERSION {
            return Err(BurrowError::new(
                ErrorKind::LogInvalidFileHeader,
                "unsupported journal version",
            ));
        }
        let flushed_lsn = r.read::<u64>();
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            flushed_lsn,
            bytes_appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // append
    // ------------------------------------------------------------------

    fn append_record(&mut self, kind: RecordType, lsn: u64, txn_id: u64, payload: &[u8]) -> DbResult {
        let mut w = BurrowWriter::new();
        w.write(&kind.to_u8());
        w.write(&lsn);
        w.write(&txn_id);
        w.write(&(payload.len() as u32));
        w.write_bytes(payload);
        let bytes = w.to_bytes();
        self.file.append(&bytes)?;
        self.file.sync()?;
        self.bytes_appended += bytes.len() as u64;
        Ok(())
    }

    pub fn append_txn_begin(&mut self, txn_id: u64, name: Option<&str>, lsn: u64) -> DbResult {
        let mut w = BurrowWriter::new();
        let name = name.unwrap_or("");
        w.write(&(name.len() as u8));
        w.write_bytes(name.as_bytes());
        self.append_record(RecordType::TxnBegin, lsn, txn_id, &w.to_bytes())
    }

    pub fn append_txn_commit(&mut self, txn_id: u64, lsn: u64) -> DbResult {
        self.append_record(RecordType::TxnCommit, lsn, txn_id, &[])
    }

    pub fn append_txn_abort(&mut self, txn_id: u64, lsn: u64) -> DbResult {
        self.append_record(RecordType::TxnAbort, lsn, txn_id, &[])
    }

    pub fn append_insert(
        &mut self,
        db: u16,
        txn_id: u64,
        key: &[u8],
        record: &[u8],
        flags: u32,
        lsn: u64,
    ) -> DbResult {
        let mut w = BurrowWriter::new();
        w.write(&db);
        w.write(&flags);
        w.write(&(key.len() as u16));
        w.write_bytes(key);
        w.write(&(record.len() as u32));
        w.write_bytes(record);
        self.append_record(RecordType::Insert, lsn, txn_id, &w.to_bytes())
    }

    pub fn append_erase(
        &mut self,
        db: u16,
        txn_id: u64,
        key: &[u8],
        dup_index: u32,
        flags: u32,
        lsn: u64,
    ) -> DbResult {
        let mut w = BurrowWriter::new();
        w.write(&db);
        w.write(&flags);
        w.write(&dup_index);
        w.write(&(key.len() as u16));
        w.write_bytes(key);
        self.append_record(RecordType::Erase, lsn, txn_id, &w.to_bytes())
    }

    // ------------------------------------------------------------------
    // flush watermark / reset
    // ------------------------------------------------------------------

    /// Persist that everything up to `lsn` reached the B+tree file.
    pub fn transaction_flushed(&mut self, lsn: u64) -> DbResult {
        if lsn <= self.flushed_lsn {
            return Ok(());
        }
        self.flushed_lsn = lsn;
        self.file.write_at(8, &lsn.to_le_bytes())?;
        self.file.sync()?;
        Ok(())
    }

    /// Drop all records; everything durable is in the B+tree file.
    pub fn reset(&mut self) -> DbResult {
        self.file.set_len(JOURNAL_HEADER_SIZE)?;
        self.file.sync()?;
        debug!("journal reset, flushed lsn: {}", self.flushed_lsn);
        Ok(())
    }

    pub fn flushed_lsn(&self) -> u64 {
        self.flushed_lsn
    }

    // ------------------------------------------------------------------
    // recovery
    // ------------------------------------------------------------------

    /// Whether the journal holds committed work beyond the flush
    /// watermark.
    pub fn needs_recovery(&mut self) -> BurrowResult<bool> {
        Ok(!self.recover()?.0.is_empty())
    }

    /// Parse the journal into the flat, in-order sequence of operations
    /// of committed transactions past the flush watermark, plus the
    /// highest lsn seen anywhere in the file.
    pub fn recover(&mut self) -> BurrowResult<(Vec<RecoveredOp>, u64)> {
        use std::collections::HashMap;

        let len = self.file.len()?;
        if len < JOURNAL_HEADER_SIZE {
            return Err(BurrowError::new(
                ErrorKind::LogInvalidFileHeader,
                "journal shorter than its header",
            ));
        }
        let body = self
            .file
            .read_at(JOURNAL_HEADER_SIZE, (len - JOURNAL_HEADER_SIZE) as usize)?;

        let mut ops: HashMap<u64, Vec<RecoveredOp>> = HashMap::new();
        let mut committed: Vec<(u64, u64)> = Vec::new(); // (commit lsn, txn)
        let mut highest_lsn = self.flushed_lsn;

        let mut pos = 0usize;
        while pos + 21 <= body.len() {
            let mut r = BurrowReader::new(body[pos..pos + 21].to_vec());
            let kind = r.read::<u8>();
            let lsn = r.read::<u64>();
            let txn_id = r.read::<u64>();
            let payload_len = r.read::<u32>() as usize;
            if pos + 21 + payload_len > body.len() {
                // torn tail record from a crash mid-append
                break;
            }
            let payload = body[pos + 21..pos + 21 + payload_len].to_vec();
            pos += 21 + payload_len;

            if lsn > highest_lsn {
                highest_lsn = lsn;
            }

            let kind = match RecordType::from_u8(kind) {
                Some(kind) => kind,
                None => {
                    return Err(BurrowError::new(
                        ErrorKind::LogInvalidFileHeader,
                        "unknown journal record type",
                    ))
                }
            };
            match kind {
                RecordType::TxnBegin => {
                    ops.entry(txn_id).or_default();
                }
                RecordType::TxnCommit => committed.push((lsn, txn_id)),
                RecordType::TxnAbort => {
                    ops.remove(&txn_id);
                }
                RecordType::Insert => {
                    let mut r = BurrowReader::new(payload);
                    let db = r.read::<u16>();
                    let flags = r.read::<u32>();
                    let key_len = r.read::<u16>() as usize;
                    let key = r.read_bytes(key_len);
                    let rec_len = r.read::<u32>() as usize;
                    let record = r.read_bytes(rec_len);
                    ops.entry(txn_id).or_default().push(RecoveredOp {
                        db,
                        txn_id,
                        lsn,
                        kind: RecoveredOpKind::Insert,
                        key,
                        record,
                        flags,
                        dup_index: 0,
                    });
                }
                RecordType::Erase => {
                    let mut r = BurrowReader::new(payload);
                    let db = r.read::<u16>();
                    let flags = r.read::<u32>();
                    let dup_index = r.read::<u32>();
                    let key_len = r.read::<u16>() as usize;
                    let key = r.read_bytes(key_len);
                    ops.entry(txn_id).or_default().push(RecoveredOp {
                        db,
                        txn_id,
                        lsn,
                        kind: RecoveredOpKind::Erase,
                        key,
                        record: Vec::new(),
                        flags,
                        dup_index,
                    });
                }
            }
        }

        committed.sort_by_key(|&(lsn, _)| lsn);
        let mut result = Vec::new();
        for (_, txn_id) in committed {
            if let Some(txn_ops) = ops.remove(&txn_id) {
                for op in txn_ops {
                    if op.lsn > self.flushed_lsn {
                        result.push(op);
                    }
                }
            }
        }
        if !result.is_empty() {
            info!(
                "journal holds {} unflushed committed operations",
                result.len()
            );
        }
        Ok((result, highest_lsn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        (dir, path)
    }

    #[test]
    fn test_committed_ops_survive_reopen() {
        let (_dir, path) = scratch();
        {
            let mut j = Journal::create(&path).unwrap();
            j.append_txn_begin(1, Some("loader"), 1).unwrap();
            j.append_insert(0, 1, b"k1", b"v1", 0, 2).unwrap();
            j.append_insert(0, 1, b"k2", b"v2", 0, 3).unwrap();
            j.append_txn_commit(1, 4).unwrap();

            j.append_txn_begin(2, None, 5).unwrap();
            j.append_insert(0, 2, b"k3", b"v3", 0, 6).unwrap();
            // txn 2 never commits
        }

        let mut j = Journal::open(&path).unwrap();
        let (ops, highest) = j.recover().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].key, b"k1");
        assert_eq!(ops[1].key, b"k2");
        assert_eq!(highest, 6);
    }

    #[test]
    fn test_aborted_txn_is_discarded() {
        let (_dir, path) = scratch();
        let mut j = Journal::create(&path).unwrap();
        j.append_txn_begin(1, None, 1).unwrap();
        j.append_insert(0, 1, b"k", b"v", 0, 2).unwrap();
        j.append_txn_abort(1, 3).unwrap();

        let (ops, _) = j.recover().unwrap();
        assert!(ops.is_empty());
        assert!(!j.needs_recovery().unwrap());
    }

    #[test]
    fn test_flush_watermark_excludes_old_ops() {
        let (_dir, path) = scratch();
        let mut j = Journal::create(&path).unwrap();
        j.append_txn_begin(1, None, 1).unwrap();
        j.append_insert(0, 1, b"k", b"v", 0, 2).unwrap();
        j.append_txn_commit(1, 3).unwrap();
        j.transaction_flushed(3).unwrap();

        // the watermark survives a reopen
        let mut j = Journal::open(&path).unwrap();
        assert_eq!(j.flushed_lsn(), 3);
        let (ops, _) = j.recover().unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_torn_tail_record_is_ignored() {
        let (_dir, path) = scratch();
        {
            let mut j = Journal::create(&path).unwrap();
            j.append_txn_begin(1, None, 1).unwrap();
            j.append_insert(0, 1, b"k", b"v", 0, 2).unwrap();
            j.append_txn_commit(1, 3).unwrap();
        }
        // simulate a crash mid-append
        {
            let mut f = BurrowFile::open(&path).unwrap();
            f.append(&[4u8, 9, 0, 0]).unwrap();
        }
        let mut j = Journal::open(&path).unwrap();
        let (ops, _) = j.recover().unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_erase_record_round_trip() {
        let (_dir, path) = scratch();
        let mut j = Journal::create(&path).unwrap();
        j.append_txn_begin(7, None, 1).unwrap();
        j.append_erase(3, 7, b"gone", 2, 0, 2).unwrap();
        j.append_txn_commit(7, 3).unwrap();

        let (ops, _) = j.recover().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, RecoveredOpKind::Erase);
        assert_eq!(ops[0].db, 3);
        assert_eq!(ops[0].dup_index, 2);
        assert_eq!(ops[0].key, b"gone");
    }
}
