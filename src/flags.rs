//! Typed flag sets for every public entry point.
//!
//! The engine keeps one closed set of flag bits; each operation accepts
//! only the subset that is meaningful for it.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Keep all pages and blobs in an anonymous in-memory arena;
        /// nothing is ever written to disk.
        const IN_MEMORY            = 0x0001;
        /// Enable the transactional overlay. Without it, writes go
        /// straight to the B+tree.
        const ENABLE_TRANSACTIONS  = 0x0002;
        /// Journal every mutating operation for crash recovery.
        const ENABLE_RECOVERY      = 0x0004;
        /// Replay the journal automatically when opening a dirty
        /// environment.
        const AUTO_RECOVERY        = 0x0008;
        /// Flush every committed transaction synchronously instead of
        /// waiting for the queue thresholds.
        const FLUSH_WHEN_COMMITTED = 0x0010;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        /// Allow any number of records per key.
        const ENABLE_DUPLICATES    = 0x0001;
        /// Auto-assign a monotone 8-byte key on insert.
        const RECORD_NUMBER        = 0x0002;
        /// Fixed-length records are stored inside the leaf.
        const FORCE_RECORDS_INLINE = 0x0004;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u32 {
        /// An implicit single-statement transaction (begin-then-commit
        /// around one operation).
        const TEMPORARY = 0x0001;
        const READ_ONLY = 0x0002;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Replace the record if the key exists.
        const OVERWRITE               = 0x0001;
        /// Append a duplicate (same as DUPLICATE_INSERT_LAST).
        const DUPLICATE               = 0x0002;
        const DUPLICATE_INSERT_FIRST  = 0x0004;
        const DUPLICATE_INSERT_LAST   = 0x0008;
        /// Insert immediately before the cursor's current duplicate.
        const DUPLICATE_INSERT_BEFORE = 0x0010;
        /// Insert immediately after the cursor's current duplicate.
        const DUPLICATE_INSERT_AFTER  = 0x0020;
        /// Start the descent at the rightmost leaf.
        const HINT_APPEND             = 0x0040;
        /// Start the descent at the leftmost leaf.
        const HINT_PREPEND            = 0x0080;
        /// Replace only a slice of an existing record.
        const PARTIAL                 = 0x0100;
    }
}

impl InsertFlags {
    /// Any of the five duplicate-insertion modes.
    pub fn is_duplicate(&self) -> bool {
        self.intersects(
            InsertFlags::DUPLICATE
                | InsertFlags::DUPLICATE_INSERT_FIRST
                | InsertFlags::DUPLICATE_INSERT_LAST
                | InsertFlags::DUPLICATE_INSERT_BEFORE
                | InsertFlags::DUPLICATE_INSERT_AFTER,
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FindFlags: u32 {
        const EXACT = 0x0001;
        /// Largest key smaller than the target.
        const LT    = 0x0002;
        /// Smallest key greater than the target.
        const GT    = 0x0004;
        /// Exact match, or the largest smaller key.
        const LEQ   = 0x0003;
        /// Exact match, or the smallest greater key.
        const GEQ   = 0x0005;
    }
}

impl FindFlags {
    pub fn is_approximate(&self) -> bool {
        self.intersects(FindFlags::LT | FindFlags::GT)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MoveFlags: u32 {
        const FIRST           = 0x0001;
        const LAST            = 0x0002;
        const NEXT            = 0x0004;
        const PREVIOUS        = 0x0008;
        /// Report every key once, regardless of its duplicate count.
        const SKIP_DUPLICATES = 0x0010;
        /// Stay within the current key's duplicate list.
        const ONLY_DUPLICATES = 0x0020;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloseFlags: u32 {
        /// Close dependents (cursors, transactions, databases) in
        /// reverse dependency order instead of failing.
        const AUTO_CLEANUP = 0x0001;
        /// Commit still-active transactions on close.
        const AUTO_COMMIT  = 0x0002;
        /// Abort still-active transactions on close.
        const AUTO_ABORT   = 0x0004;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leq_geq_composition() {
        assert!(FindFlags::LEQ.contains(FindFlags::EXACT));
        assert!(FindFlags::LEQ.contains(FindFlags::LT));
        assert!(FindFlags::GEQ.contains(FindFlags::GT));
        assert!(FindFlags::EXACT.is_approximate() == false);
        assert!(FindFlags::LEQ.is_approximate());
    }

    #[test]
    fn test_duplicate_modes() {
        assert!(InsertFlags::DUPLICATE.is_duplicate());
        assert!(InsertFlags::DUPLICATE_INSERT_BEFORE.is_duplicate());
        assert!(!InsertFlags::OVERWRITE.is_duplicate());
    }
}
