// each test binary uses a different subset of these helpers
#![allow(dead_code)]

use burrow::{DbFlags, DbParams, EnvConfig, EnvFlags, Environment};
use tempfile::TempDir;

pub fn setup() -> TempDir {
    burrow::init_log();
    tempfile::tempdir().unwrap()
}

/// A transactional environment with one duplicates-enabled database.
pub fn txn_env(dir: &TempDir) -> (Environment, burrow::Database) {
    let env = Environment::create(
        dir.path().join("test.db"),
        EnvFlags::ENABLE_TRANSACTIONS,
        EnvConfig::default(),
    )
    .unwrap();
    let db = env
        .create_db(
            1,
            DbParams {
                flags: DbFlags::ENABLE_DUPLICATES,
                ..DbParams::default()
            },
        )
        .unwrap();
    (env, db)
}

/// A plain (non-transactional) environment with one duplicates-enabled
/// database; writes go straight to the B+tree.
pub fn plain_env(dir: &TempDir) -> (Environment, burrow::Database) {
    let env = Environment::create(
        dir.path().join("test.db"),
        EnvFlags::empty(),
        EnvConfig::default(),
    )
    .unwrap();
    let db = env
        .create_db(
            1,
            DbParams {
                flags: DbFlags::ENABLE_DUPLICATES,
                ..DbParams::default()
            },
        )
        .unwrap();
    (env, db)
}

/// The numeric string keys of the bulk scenarios: "00000\0", "00001\0", …
pub fn numkey(i: u32) -> Vec<u8> {
    let mut key = format!("{:05}", i).into_bytes();
    key.push(0);
    key
}
