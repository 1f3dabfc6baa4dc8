//! An embeddable, transactional, ordered key-value storage engine.
//!
//! One `Environment` file holds many named databases. Databases support
//! ordered traversal through cursors, duplicate keys, point and
//! approximate lookups, and multi-versioned read/write transactions with
//! crash-consistent recovery.
//!
//! ```no_run
//! use burrow::{DbParams, EnvConfig, EnvFlags, Environment, InsertFlags};
//!
//! let env = Environment::create(
//!     "app.db",
//!     EnvFlags::ENABLE_TRANSACTIONS,
//!     EnvConfig::default(),
//! )?;
//! let db = env.create_db(1, DbParams::default())?;
//!
//! let txn = env.begin_txn(None, Default::default())?;
//! db.insert(Some(&txn), b"hello", b"world", InsertFlags::empty())?;
//! txn.commit()?;
//!
//! assert_eq!(&db.find(None, b"hello")?[..], b"world");
//! # Ok::<(), burrow::BurrowError>(())
//! ```

mod blob;
mod btree;
mod cursor;
mod db;
mod env;
mod error;
mod flags;
mod io;
mod journal;
mod key;
mod page;
mod page_store;
mod record;
mod txn;
mod types;
mod utils;

pub use env::{Cursor, Database, DbParams, EnvConfig, Environment, Metrics, Transaction};
pub use error::{BurrowError, BurrowResult, DbResult, ErrorKind};
pub use flags::{CloseFlags, DbFlags, EnvFlags, FindFlags, InsertFlags, MoveFlags, TxnFlags};
pub use key::{ApproxMatch, KeyType, KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED};

pub use utils::init_log;
