//! The environment: one file (or in-memory arena) holding many named
//! databases, plus the public handle types.
//!
//! Every public entry point acquires the environment's exclusion region
//! (one lock around `EnvInner`) and holds it for the duration of the
//! call; within it the engine is fully synchronous.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use log::info;
use once_cell::sync::Lazy;

use crate::blob::BlobManager;
use crate::btree::{Btree, BtreeContext};
use crate::cursor::{CursorArena, CursorId};
use crate::error::{BurrowError, BurrowResult, DbResult, ErrorKind};
use crate::flags::{CloseFlags, DbFlags, EnvFlags, FindFlags, InsertFlags, MoveFlags, TxnFlags};
use crate::io::BurrowFile;
use crate::journal::Journal;
use crate::key::{ApproxMatch, KeyType, KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED};
use crate::page::{DbDescriptor, HeaderPage};
use crate::page_store::PageStore;
use crate::record::FORCED_INLINE_MAX;
use crate::txn::index::{TxnIndex, TxnStore};
use crate::txn::TxnManager;
use crate::types::{pod, Pod};
use crate::utils::HandyRwLock;

/// Guards against opening the same environment file twice within one
/// process.
static OPEN_ENVIRONMENTS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub page_size: u32,
    /// page cache capacity, in pages
    pub cache_capacity: usize,
    pub max_databases: u16,
    /// unix file mode bits for freshly created files; 0 keeps the
    /// process default
    pub mode: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_capacity: 256,
            max_databases: 16,
            mode: 0,
        }
    }
}

/// Creation parameters of one database.
#[derive(Debug, Clone)]
pub struct DbParams {
    pub key_type: KeyType,
    pub key_size: u16,
    pub record_size: u32,
    pub flags: DbFlags,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            key_type: KeyType::Binary,
            key_size: KEY_SIZE_UNLIMITED,
            record_size: RECORD_SIZE_UNLIMITED,
            flags: DbFlags::empty(),
        }
    }
}

/// A snapshot of the environment's counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub pages_fetched: u64,
    pub pages_flushed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub blobs_allocated: u64,
    pub txns_begun: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
    pub committed_queue_len: u64,
    pub journal_bytes: u64,
    pub highest_lsn: u64,
}

/// One open database.
pub(crate) struct DatabaseState {
    pub name: u16,
    pub slot: u16,
    pub btree: Btree,
    pub txn_index: TxnIndex,
    pub cursors: CursorArena,
    /// highest record number handed out (record-number databases)
    pub recno: u64,
}

pub(crate) struct EnvInner {
    pub path: Option<PathBuf>,
    pub flags: EnvFlags,
    pub config: EnvConfig,

    pub header: HeaderPage,
    pub header_dirty: bool,

    pub store: PageStore,
    pub blobs: BlobManager,
    pub journal: Option<Journal>,

    pub txn: TxnManager,
    pub txn_store: TxnStore,

    /// open databases, keyed by name
    pub databases: HashMap<u16, DatabaseState>,

    pub closed: bool,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close_inner(CloseFlags::AUTO_CLEANUP | CloseFlags::AUTO_ABORT);
        }
    }
}

impl EnvInner {
    /// Whether transactional routing is active.
    pub fn txns_enabled(&self) -> bool {
        self.flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
    }

    pub fn journal_enabled(&self) -> bool {
        self.journal.is_some()
    }

    pub fn db_state(&self, name: u16) -> BurrowResult<&DatabaseState> {
        self.databases
            .get(&name)
            .ok_or_else(|| BurrowError::of(ErrorKind::DatabaseNotFound))
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    fn validate_config(config: &EnvConfig) -> DbResult {
        let ps = config.page_size;
        if !(1024..=65536).contains(&ps) || !ps.is_power_of_two() {
            return Err(BurrowError::new(
                ErrorKind::InvalidPageSize,
                &format!("page size {} is not a power of two in [1K, 64K]", ps),
            ));
        }
        Ok(())
    }

    fn register_path(path: &Path) -> DbResult {
        let canonical = path.to_path_buf();
        let mut open = OPEN_ENVIRONMENTS.lock().unwrap();
        if !open.insert(canonical) {
            return Err(BurrowError::new(
                ErrorKind::EnvironmentAlreadyOpen,
                &format!("{}", path.display()),
            ));
        }
        Ok(())
    }

    fn unregister_path(path: &Path) {
        OPEN_ENVIRONMENTS.lock().unwrap().remove(path);
    }

    fn journal_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_os_string();
        os.push(".jrn");
        PathBuf::from(os)
    }

    pub fn create(path: &Path, flags: EnvFlags, config: EnvConfig) -> BurrowResult<Self> {
        Self::validate_config(&config)?;
        let in_memory = flags.contains(EnvFlags::IN_MEMORY);

        let file = if in_memory {
            None
        } else {
            Self::register_path(path)?;
            Some(BurrowFile::create(path)?)
        };

        let header = HeaderPage::new(config.page_size, config.max_databases)?;
        let mut store = PageStore::new(file, config.page_size as usize, config.cache_capacity);
        store.write_header_image(&header.serialize())?;

        let journal = if !in_memory
            && flags.contains(EnvFlags::ENABLE_RECOVERY)
            && flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
        {
            Some(Journal::create(Self::journal_path(path))?)
        } else {
            None
        };

        info!(
            "environment created, path: {:?}, page size: {}",
            if in_memory { None } else { Some(path) },
            config.page_size
        );

        Ok(Self {
            path: if in_memory {
                None
            } else {
                Some(path.to_path_buf())
            },
            flags,
            txn: TxnManager::new(flags.contains(EnvFlags::FLUSH_WHEN_COMMITTED)),
            config,
            header,
            header_dirty: false,
            store,
            blobs: BlobManager::new(),
            journal,
            txn_store: TxnStore::new(),
            databases: HashMap::new(),
            closed: false,
        })
    }

    pub fn open(path: &Path, flags: EnvFlags, config: EnvConfig) -> BurrowResult<Self> {
        if flags.contains(EnvFlags::IN_MEMORY) {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "an in-memory environment cannot be re-opened",
            ));
        }
        Self::register_path(path)?;
        let result = Self::open_registered(path, flags, config);
        if result.is_err() {
            Self::unregister_path(path);
        }
        result
    }

    fn open_registered(path: &Path, flags: EnvFlags, config: EnvConfig) -> BurrowResult<Self> {
        let mut file = BurrowFile::open(path)?;

        // the page size lives at a fixed offset; peek before reading the
        // whole header page
        let prefix = file.read_at(0, 13).map_err(|_| {
            BurrowError::new(ErrorKind::InvalidFileHeader, "file shorter than a header")
        })?;
        let page_size = u32::from_le_bytes([prefix[9], prefix[10], prefix[11], prefix[12]]);
        if !(1024..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(BurrowError::new(
                ErrorKind::InvalidFileHeader,
                "implausible page size in header",
            ));
        }

        let header = HeaderPage::parse(file.read_at(0, page_size as usize)?)?;
        let file_len = file.len()?;

        let mut config = config;
        config.page_size = page_size;
        let mut store = PageStore::new(Some(file), page_size as usize, config.cache_capacity);
        store.set_page_count(file_len / page_size as u64);
        let mut blobs = BlobManager::new();

        if header.get_state_blob() != 0 {
            let state = blobs.read(&mut store, header.get_state_blob())?;
            store.restore_state(&state)?;
        }

        let journal = if flags.contains(EnvFlags::ENABLE_RECOVERY)
            && flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
        {
            let jpath = Self::journal_path(path);
            Some(if jpath.exists() {
                Journal::open(&jpath)?
            } else {
                Journal::create(&jpath)?
            })
        } else {
            None
        };

        let mut env = Self {
            path: Some(path.to_path_buf()),
            flags,
            txn: TxnManager::new(flags.contains(EnvFlags::FLUSH_WHEN_COMMITTED)),
            config,
            header,
            header_dirty: false,
            store,
            blobs,
            journal,
            txn_store: TxnStore::new(),
            databases: HashMap::new(),
            closed: false,
        };

        let recovered = match &mut env.journal {
            Some(journal) => Some(journal.recover()?),
            None => None,
        };
        if let Some((ops, highest_lsn)) = recovered {
            env.txn.restore_lsn(highest_lsn);
            if !ops.is_empty() {
                if !flags.contains(EnvFlags::AUTO_RECOVERY) {
                    return Err(BurrowError::of(ErrorKind::NeedRecovery));
                }
                env.replay_recovered_ops(ops)?;
            }
        }

        info!("environment opened, path: {}", path.display());
        Ok(env)
    }

    pub fn flush_inner(&mut self) -> DbResult {
        self.flush_committed_txns()?;
        let lsn = self.txn.highest_lsn();
        self.store.flush_all(lsn)?;
        self.persist_state()?;
        Ok(())
    }

    pub fn close_inner(&mut self, flags: CloseFlags) -> DbResult {
        if self.closed {
            return Ok(());
        }

        let open_cursors: usize = self
            .databases
            .values()
            .map(|db| db.cursors.live_count())
            .sum();
        if open_cursors > 0 && !flags.contains(CloseFlags::AUTO_CLEANUP) {
            return Err(BurrowError::of(ErrorKind::CursorStillOpen));
        }
        if self.txn.active_count() > 0
            && !flags.intersects(CloseFlags::AUTO_COMMIT | CloseFlags::AUTO_ABORT)
        {
            return Err(BurrowError::of(ErrorKind::TxnStillOpen));
        }

        // dependents go down in reverse dependency order: cursors,
        // transactions, databases, then the file
        if open_cursors > 0 {
            let names: Vec<u16> = self.databases.keys().copied().collect();
            for name in names {
                let ids = self.databases[&name].cursors.ids();
                for cid in ids {
                    let _ = self.cursor_close(name, cid);
                }
            }
        }

        let active: Vec<u64> = self
            .txn
            .outstanding_ids()
            .into_iter()
            .filter(|&id| self.txn.get(id).map(|t| t.is_active()).unwrap_or(false))
            .collect();
        for id in active {
            if flags.contains(CloseFlags::AUTO_COMMIT) {
                let _ = self.txn_commit(id);
            } else {
                let _ = self.txn_abort(id);
            }
        }

        self.flush_committed_txns()?;

        let names: Vec<u16> = self.databases.keys().copied().collect();
        for name in names {
            self.db_close_internal(name)?;
        }

        let lsn = self.txn.highest_lsn();
        self.store.flush_all(lsn)?;
        self.persist_state()?;
        if let Some(journal) = &mut self.journal {
            journal.transaction_flushed(lsn)?;
            journal.reset()?;
        }

        if let Some(path) = &self.path {
            Self::unregister_path(path);
        }
        self.closed = true;
        info!("environment closed");
        Ok(())
    }

    /// Persist the free-page bitmap and the header page. The snapshot's
    /// own pages must appear as used in the snapshot, so the run is
    /// acquired before the state is encoded.
    fn persist_state(&mut self) -> DbResult {
        if self.store.is_in_memory() {
            return Ok(());
        }
        let old_blob = self.header.get_state_blob();
        if old_blob != 0 {
            let _ = self.blobs.free(&mut self.store, old_blob);
        }
        let mut slack = 64usize;
        loop {
            let guess = 8 + (self.store.page_count() as usize + slack) / 8 + 16;
            let run = (guess + self.store.page_size() - 1) / self.store.page_size();
            let pid = self.store.allocate_run(run);
            let state = self.store.encode_state();
            if self.blobs.fits_run(&self.store, run, state.len()) {
                self.blobs
                    .write_preallocated(&mut self.store, pid, run, &state);
                self.header.set_state_blob(pid);
                self.header_dirty = true;
                break;
            }
            self.store.free_run(pid, run);
            slack *= 4;
        }
        self.write_header()?;
        let lsn = self.txn.highest_lsn();
        self.store.flush_all(lsn)?;
        self.store.sync()?;
        Ok(())
    }

    pub fn write_header(&mut self) -> DbResult {
        if self.header_dirty {
            let image = self.header.serialize();
            self.store.write_header_image(&image)?;
            self.header_dirty = false;
        }
        Ok(())
    }

    /// Keep the header's root pointer in sync after structural changes.
    pub fn sync_db_root(&mut self, name: u16) {
        if let Some(db) = self.databases.get(&name) {
            let slot = db.slot;
            if self.header.descriptor(slot).root_pid != db.btree.root_pid {
                self.header.descriptor_mut(slot).root_pid = db.btree.root_pid;
                self.header_dirty = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // database management
    // ------------------------------------------------------------------

    pub fn create_db(&mut self, name: u16, params: DbParams) -> DbResult {
        if name == 0 {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "database name 0 is reserved",
            ));
        }
        if self.header.find_database(name).is_some() {
            return Err(BurrowError::of(ErrorKind::DatabaseAlreadyExists));
        }
        let slot = self
            .header
            .find_free_slot()
            .ok_or_else(|| BurrowError::of(ErrorKind::LimitsReached))?;

        let mut flags = params.flags;
        let (key_type, key_size) = if flags.contains(DbFlags::RECORD_NUMBER) {
            (KeyType::U64, 8)
        } else {
            match params.key_type.fixed_size() {
                Some(size) => (params.key_type, size),
                None => (params.key_type, params.key_size),
            }
        };

        // refuse keys so large that a page cannot hold a sensible fanout
        if key_size != KEY_SIZE_UNLIMITED
            && self.config.page_size as usize / (key_size as usize + 8) < 10
        {
            return Err(BurrowError::new(
                ErrorKind::InvalidKeySize,
                "key size too large for the page size",
            ));
        }

        let record_size = params.record_size;
        if record_size != RECORD_SIZE_UNLIMITED && record_size as usize <= FORCED_INLINE_MAX {
            flags |= DbFlags::FORCE_RECORDS_INLINE;
        }

        let btree = Btree::new(key_type, key_size, record_size, flags);
        let mut db = DatabaseState {
            name,
            slot,
            txn_index: TxnIndex::new(key_type),
            cursors: CursorArena::new(),
            recno: 0,
            btree,
        };
        {
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            db.btree.create_root(&mut ctx)?;
        }

        *self.header.descriptor_mut(slot) = DbDescriptor {
            name,
            flags: flags.bits(),
            key_type: key_type.to_u16(),
            key_size,
            record_size,
            root_pid: db.btree.root_pid,
        };
        self.header_dirty = true;
        self.write_header()?;
        // the root page must hit the disk with the descriptor pointing
        // at it, or a crash leaves a dangling root
        self.store.flush_changeset(0)?;

        info!("database created, name: {}, key type: {:?}", name, key_type);
        self.databases.insert(name, db);
        Ok(())
    }

    pub fn open_db(&mut self, name: u16) -> DbResult {
        if self.databases.contains_key(&name) {
            return Err(BurrowError::of(ErrorKind::DatabaseAlreadyOpen));
        }
        let slot = self
            .header
            .find_database(name)
            .ok_or_else(|| BurrowError::of(ErrorKind::DatabaseNotFound))?;
        let desc = self.header.descriptor(slot).clone();
        let flags = DbFlags::from_bits_truncate(desc.flags);
        let key_type = KeyType::from_u16(desc.key_type).ok_or_else(|| {
            BurrowError::new(ErrorKind::InvalidFileHeader, "unknown key type in descriptor")
        })?;

        let mut btree = Btree::new(key_type, desc.key_size, desc.record_size, flags);
        btree.root_pid = desc.root_pid;

        let mut db = DatabaseState {
            name,
            slot,
            txn_index: TxnIndex::new(key_type),
            cursors: CursorArena::new(),
            recno: 0,
            btree,
        };

        // record-number databases lazily restore the highest assigned id
        if flags.contains(DbFlags::RECORD_NUMBER) {
            let mut ctx = BtreeContext {
                store: &mut self.store,
                blobs: &mut self.blobs,
                cursors: &mut db.cursors,
            };
            let rightmost = db.btree.rightmost_leaf(&mut ctx)?;
            let page = ctx.store.fetch_leaf(rightmost)?;
            let last_key = {
                let p = page.rl();
                if p.item_count() > 0 {
                    Some(p.item(p.item_count() - 1).key.clone())
                } else {
                    None
                }
            };
            if let Some(key) = last_key {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&key);
                db.recno = u64::from_le_bytes(raw);
            }
            self.store.clear_changeset();
        }

        self.databases.insert(name, db);
        Ok(())
    }

    /// Close a database: fails with `TxnStillOpen` while an active
    /// transaction holds pending operations against it, and with
    /// `CursorStillOpen` while cursors are open over it.
    pub fn db_close(&mut self, name: u16) -> DbResult {
        {
            let db = self.db_state(name)?;
            if db.cursors.live_count() > 0 {
                return Err(BurrowError::of(ErrorKind::CursorStillOpen));
            }
            for node_id in db.txn_index.node_ids() {
                let mut op = self.txn_store.node(node_id).newest_op;
                while let Some(op_id) = op {
                    let o = self.txn_store.op(op_id);
                    if let Some(txn) = self.txn.get(o.txn_id) {
                        if txn.is_active() {
                            return Err(BurrowError::of(ErrorKind::TxnStillOpen));
                        }
                    }
                    op = o.node_prev;
                }
            }
        }
        self.flush_committed_txns()?;
        self.db_close_internal(name)
    }

    pub(crate) fn db_close_internal(&mut self, name: u16) -> DbResult {
        self.sync_db_root(name);
        self.write_header()?;
        self.databases.remove(&name);
        Ok(())
    }

    pub fn rename_db(&mut self, old_name: u16, new_name: u16) -> DbResult {
        if new_name == 0 {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "database name 0 is reserved",
            ));
        }
        if self.databases.contains_key(&old_name) {
            return Err(BurrowError::of(ErrorKind::DatabaseAlreadyOpen));
        }
        if self.header.find_database(new_name).is_some() {
            return Err(BurrowError::of(ErrorKind::DatabaseAlreadyExists));
        }
        let slot = self
            .header
            .find_database(old_name)
            .ok_or_else(|| BurrowError::of(ErrorKind::DatabaseNotFound))?;
        self.header.descriptor_mut(slot).name = new_name;
        self.header_dirty = true;
        self.write_header()
    }

    pub fn erase_db(&mut self, name: u16) -> DbResult {
        if self.databases.contains_key(&name) {
            return Err(BurrowError::of(ErrorKind::DatabaseAlreadyOpen));
        }
        let slot = self
            .header
            .find_database(name)
            .ok_or_else(|| BurrowError::of(ErrorKind::DatabaseNotFound))?;
        let desc = self.header.descriptor(slot).clone();

        let flags = DbFlags::from_bits_truncate(desc.flags);
        let key_type = KeyType::from_u16(desc.key_type).ok_or_else(|| {
            BurrowError::new(ErrorKind::InvalidFileHeader, "unknown key type in descriptor")
        })?;
        let mut btree = Btree::new(key_type, desc.key_size, desc.record_size, flags);
        btree.root_pid = desc.root_pid;

        let mut cursors = CursorArena::new();
        let mut ctx = BtreeContext {
            store: &mut self.store,
            blobs: &mut self.blobs,
            cursors: &mut cursors,
        };
        btree.release(&mut ctx)?;

        *self.header.descriptor_mut(slot) = DbDescriptor::empty();
        self.header_dirty = true;
        self.write_header()?;
        let lsn = self.txn.highest_lsn();
        self.store.flush_changeset(lsn)?;
        info!("database erased, name: {}", name);
        Ok(())
    }

    pub fn database_names(&self) -> Vec<u16> {
        self.header.database_names()
    }

    // ------------------------------------------------------------------
    // transactions (entry points; the flush machinery lives in db.rs)
    // ------------------------------------------------------------------

    pub fn begin_txn(&mut self, name: Option<&str>, flags: TxnFlags) -> BurrowResult<u64> {
        let id = self.txn.begin(name, flags)?;
        if self.journal_enabled() && !flags.contains(TxnFlags::TEMPORARY) {
            let lsn = self.txn.next_lsn();
            if let Some(journal) = &mut self.journal {
                journal.append_txn_begin(id, name, lsn)?;
            }
        }
        Ok(id)
    }

    pub fn metrics_snapshot(&self) -> Metrics {
        Metrics {
            pages_fetched: self.store.metrics.pages_fetched,
            pages_flushed: self.store.metrics.pages_flushed,
            cache_hits: self.store.metrics.cache_hits,
            cache_misses: self.store.metrics.cache_misses,
            blobs_allocated: self.blobs.blobs_allocated,
            txns_begun: self.txn.txns_begun,
            txns_committed: self.txn.txns_committed,
            txns_aborted: self.txn.txns_aborted,
            committed_queue_len: self.txn.queued_count() as u64,
            journal_bytes: self
                .journal
                .as_ref()
                .map(|j| j.bytes_appended)
                .unwrap_or(0),
            highest_lsn: self.txn.highest_lsn(),
        }
    }
}

// ----------------------------------------------------------------------
// public handles
// ----------------------------------------------------------------------

/// A storage environment: a single file (or in-memory arena) containing
/// many named databases.
#[derive(Clone)]
pub struct Environment {
    inner: Pod<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish()
    }
}

impl Environment {
    pub fn create<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        config: EnvConfig,
    ) -> BurrowResult<Self> {
        let inner = EnvInner::create(path.as_ref(), flags, config)?;
        Ok(Self { inner: pod(inner) })
    }

    pub fn open<P: AsRef<Path>>(path: P, flags: EnvFlags, config: EnvConfig) -> BurrowResult<Self> {
        let inner = EnvInner::open(path.as_ref(), flags, config)?;
        Ok(Self { inner: pod(inner) })
    }

    pub fn create_db(&self, name: u16, params: DbParams) -> BurrowResult<Database> {
        self.inner.wl().create_db(name, params)?;
        Ok(Database {
            inner: self.inner.clone(),
            name,
        })
    }

    pub fn open_db(&self, name: u16) -> BurrowResult<Database> {
        self.inner.wl().open_db(name)?;
        Ok(Database {
            inner: self.inner.clone(),
            name,
        })
    }

    pub fn rename_db(&self, old_name: u16, new_name: u16) -> DbResult {
        self.inner.wl().rename_db(old_name, new_name)
    }

    pub fn erase_db(&self, name: u16) -> DbResult {
        self.inner.wl().erase_db(name)
    }

    pub fn database_names(&self) -> Vec<u16> {
        self.inner.rl().database_names()
    }

    pub fn begin_txn(&self, name: Option<&str>, flags: TxnFlags) -> BurrowResult<Transaction> {
        let id = self.inner.wl().begin_txn(name, flags)?;
        Ok(Transaction {
            inner: self.inner.clone(),
            id,
            finished: false,
        })
    }

    /// Flush committed transactions and all dirty pages to disk.
    pub fn flush(&self) -> DbResult {
        self.inner.wl().flush_inner()
    }

    pub fn close(&self, flags: CloseFlags) -> DbResult {
        self.inner.wl().close_inner(flags)
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.rl().metrics_snapshot()
    }
}

/// A named, ordered key-value database inside an environment.
#[derive(Clone)]
pub struct Database {
    inner: Pod<EnvInner>,
    name: u16,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

impl Database {
    pub fn name(&self) -> u16 {
        self.name
    }

    pub fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> DbResult {
        self.inner
            .wl()
            .db_insert(self.name, txn.map(|t| t.id), key, record, flags)
            .map(|_| ())
    }

    /// Insert, reporting the key actually used (record-number databases
    /// assign it).
    pub fn insert_keyed(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> BurrowResult<Bytes> {
        self.inner
            .wl()
            .db_insert(self.name, txn.map(|t| t.id), key, record, flags)
    }

    /// Replace `slice` at `offset` inside the existing record of `key`,
    /// zero-padding any gap. Incompatible with explicit transactions.
    pub fn insert_partial(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        slice: &[u8],
        offset: usize,
    ) -> DbResult {
        if txn.is_some() {
            return Err(BurrowError::new(
                ErrorKind::InvalidParameter,
                "partial writes cannot run inside a transaction",
            ));
        }
        self.inner.wl().db_insert_partial(self.name, key, slice, offset)
    }

    pub fn find(&self, txn: Option<&Transaction>, key: &[u8]) -> BurrowResult<Bytes> {
        self.inner
            .wl()
            .db_find(self.name, txn.map(|t| t.id), key, FindFlags::EXACT)
            .map(|(_, record, _)| record)
    }

    /// Find with the full match-flag range; reports the matched key and
    /// whether the match was approximate.
    pub fn find_approx(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        flags: FindFlags,
    ) -> BurrowResult<(Bytes, Bytes, ApproxMatch)> {
        self.inner
            .wl()
            .db_find(self.name, txn.map(|t| t.id), key, flags)
    }

    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8]) -> DbResult {
        self.inner.wl().db_erase(self.name, txn.map(|t| t.id), key)
    }

    pub fn count(&self, txn: Option<&Transaction>, distinct: bool) -> BurrowResult<u64> {
        self.inner
            .wl()
            .db_count(self.name, txn.map(|t| t.id), distinct)
    }

    pub fn check_integrity(&self) -> DbResult {
        self.inner.wl().db_check_integrity(self.name)
    }

    pub fn cursor(&self, txn: Option<&Transaction>) -> BurrowResult<Cursor> {
        let id = self
            .inner
            .wl()
            .cursor_create(self.name, txn.map(|t| t.id))?;
        Ok(Cursor {
            inner: self.inner.clone(),
            db: self.name,
            id,
            closed: false,
        })
    }

    pub fn close(&self) -> DbResult {
        self.inner.wl().db_close(self.name)
    }
}

/// An explicit transaction. Dropping an unfinished transaction aborts
/// it (best effort; failing that, the environment's close cleans up).
pub struct Transaction {
    inner: Pod<EnvInner>,
    pub(crate) id: u64,
    finished: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn commit(mut self) -> DbResult {
        self.finished = true;
        self.inner.wl().txn_commit(self.id)
    }

    pub fn abort(mut self) -> DbResult {
        self.finished = true;
        self.inner.wl().txn_abort(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Ok(mut env) = self.inner.try_write() {
                let _ = env.txn_abort(self.id);
            }
        }
    }
}

/// A database cursor presenting the merged ordered view of committed
/// B+tree state and the pending transactional overlay.
pub struct Cursor {
    inner: Pod<EnvInner>,
    db: u16,
    pub(crate) id: CursorId,
    closed: bool,
}

impl Cursor {
    pub fn try_clone(&self) -> BurrowResult<Cursor> {
        let id = self.inner.wl().cursor_clone(self.db, self.id)?;
        Ok(Cursor {
            inner: self.inner.clone(),
            db: self.db,
            id,
            closed: false,
        })
    }

    pub fn find(&self, key: &[u8], flags: FindFlags) -> BurrowResult<Bytes> {
        self.inner.wl().cursor_find(self.db, self.id, key, flags)
    }

    pub fn insert(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> DbResult {
        self.inner
            .wl()
            .cursor_insert(self.db, self.id, key, record, flags)
    }

    pub fn erase(&self) -> DbResult {
        self.inner.wl().cursor_erase(self.db, self.id)
    }

    pub fn overwrite(&self, record: &[u8]) -> DbResult {
        self.inner.wl().cursor_overwrite(self.db, self.id, record)
    }

    pub fn move_to(&self, flags: MoveFlags) -> BurrowResult<(Bytes, Bytes)> {
        self.inner.wl().cursor_move(self.db, self.id, flags)
    }

    pub fn first(&self) -> BurrowResult<(Bytes, Bytes)> {
        self.move_to(MoveFlags::FIRST)
    }

    pub fn last(&self) -> BurrowResult<(Bytes, Bytes)> {
        self.move_to(MoveFlags::LAST)
    }

    pub fn next(&self) -> BurrowResult<(Bytes, Bytes)> {
        self.move_to(MoveFlags::NEXT)
    }

    pub fn previous(&self) -> BurrowResult<(Bytes, Bytes)> {
        self.move_to(MoveFlags::PREVIOUS)
    }

    /// The key and record under the cursor, without moving it.
    pub fn current(&self) -> BurrowResult<(Bytes, Bytes)> {
        self.inner.wl().cursor_current(self.db, self.id)
    }

    pub fn duplicate_count(&self) -> BurrowResult<u32> {
        self.inner.wl().cursor_dup_count(self.db, self.id)
    }

    /// 1-based position within the current key's duplicate list.
    pub fn duplicate_position(&self) -> BurrowResult<u32> {
        self.inner.wl().cursor_dup_position(self.db, self.id)
    }

    pub fn record_size(&self) -> BurrowResult<u64> {
        self.inner.wl().cursor_record_size(self.db, self.id)
    }

    /// Whether the cursor currently reads from a pending (not yet
    /// flushed) transactional operation instead of the B+tree.
    pub fn is_coupled_to_pending_op(&self) -> BurrowResult<bool> {
        self.inner.rl().cursor_is_pending(self.db, self.id)
    }

    pub fn close(mut self) -> DbResult {
        self.closed = true;
        self.inner.wl().cursor_close(self.db, self.id)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.closed {
            if let Ok(mut env) = self.inner.try_write() {
                let _ = env.cursor_close(self.db, self.id);
            }
        }
    }
}
