mod common;

use std::fs;

use burrow::{
    DbFlags, DbParams, EnvConfig, EnvFlags, Environment, ErrorKind, InsertFlags, TxnFlags,
};
use common::{numkey, setup};

fn recoverable_flags() -> EnvFlags {
    EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::ENABLE_RECOVERY
}

/// Copy the environment's files mid-workload: the copy is exactly the
/// state a crash would leave behind.
fn snapshot_crash_state(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let original = dir.path().join("test.db");
    let copy = dir.path().join("crashed.db");
    fs::copy(&original, &copy).unwrap();
    fs::copy(
        dir.path().join("test.db.jrn"),
        dir.path().join("crashed.db.jrn"),
    )
    .unwrap();
    copy
}

// S8.1 invariant 8: reopening after a crash retains all transactions
// whose commit was journaled and discards the uncommitted rest.
#[test]
fn test_recovery_equivalence() {
    let dir = setup();
    let env = Environment::create(
        dir.path().join("test.db"),
        recoverable_flags(),
        EnvConfig::default(),
    )
    .unwrap();
    let db = env.create_db(1, DbParams::default()).unwrap();

    let committed = env.begin_txn(None, TxnFlags::empty()).unwrap();
    for i in 0..50u32 {
        db.insert(Some(&committed), &numkey(i), b"keep", InsertFlags::empty())
            .unwrap();
    }
    committed.commit().unwrap();

    let uncommitted = env.begin_txn(None, TxnFlags::empty()).unwrap();
    for i in 50..80u32 {
        db.insert(Some(&uncommitted), &numkey(i), b"drop", InsertFlags::empty())
            .unwrap();
    }

    // crash now: committed work sits in the journal, not in the pages
    let crashed = snapshot_crash_state(&dir);
    uncommitted.abort().unwrap();

    let recovered = Environment::open(
        &crashed,
        recoverable_flags() | EnvFlags::AUTO_RECOVERY,
        EnvConfig::default(),
    )
    .unwrap();
    let db = recovered.open_db(1).unwrap();

    for i in 0..50u32 {
        assert_eq!(&db.find(None, &numkey(i)).unwrap()[..], b"keep");
    }
    for i in 50..80u32 {
        assert_eq!(
            db.find(None, &numkey(i)).unwrap_err().kind(),
            ErrorKind::KeyNotFound
        );
    }
    db.check_integrity().unwrap();
}

// a dirty environment refuses to open without auto-recovery
#[test]
fn test_need_recovery_gate() {
    let dir = setup();
    let env = Environment::create(
        dir.path().join("test.db"),
        recoverable_flags(),
        EnvConfig::default(),
    )
    .unwrap();
    let db = env.create_db(1, DbParams::default()).unwrap();

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();
    txn.commit().unwrap();

    let crashed = snapshot_crash_state(&dir);

    let err = Environment::open(&crashed, recoverable_flags(), EnvConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NeedRecovery);

    // with auto-recovery the same file opens fine
    let recovered = Environment::open(
        &crashed,
        recoverable_flags() | EnvFlags::AUTO_RECOVERY,
        EnvConfig::default(),
    )
    .unwrap();
    let db = recovered.open_db(1).unwrap();
    assert_eq!(&db.find(None, b"k").unwrap()[..], b"v");
}

// a clean close leaves nothing to recover
#[test]
fn test_clean_close_then_reopen() {
    let dir = setup();
    let path = dir.path().join("test.db");
    {
        let env =
            Environment::create(&path, recoverable_flags(), EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbParams::default()).unwrap();
        for i in 0..200u32 {
            db.insert(None, &numkey(i), &i.to_le_bytes(), InsertFlags::empty())
                .unwrap();
        }
        db.close().unwrap();
        env.close(burrow::CloseFlags::empty()).unwrap();
    }

    let env = Environment::open(&path, recoverable_flags(), EnvConfig::default()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, false).unwrap(), 200);
    for i in (0..200u32).step_by(23) {
        assert_eq!(&db.find(None, &numkey(i)).unwrap()[..], &i.to_le_bytes()[..]);
    }
    db.check_integrity().unwrap();
}

// erases are journaled and replayed too
#[test]
fn test_recovery_replays_erases() {
    let dir = setup();
    let env = Environment::create(
        dir.path().join("test.db"),
        recoverable_flags(),
        EnvConfig::default(),
    )
    .unwrap();
    let db = env.create_db(1, DbParams::default()).unwrap();

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(Some(&txn), b"b", b"2", InsertFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.erase(Some(&txn), b"a").unwrap();
    txn.commit().unwrap();

    let crashed = snapshot_crash_state(&dir);
    let recovered = Environment::open(
        &crashed,
        recoverable_flags() | EnvFlags::AUTO_RECOVERY,
        EnvConfig::default(),
    )
    .unwrap();
    let db = recovered.open_db(1).unwrap();
    assert_eq!(db.find(None, b"a").unwrap_err().kind(), ErrorKind::KeyNotFound);
    assert_eq!(&db.find(None, b"b").unwrap()[..], b"2");
}

// the same environment file cannot be opened twice by one process
#[test]
fn test_environment_already_open() {
    let dir = setup();
    let path = dir.path().join("test.db");
    let env = Environment::create(&path, EnvFlags::empty(), EnvConfig::default()).unwrap();

    let err = Environment::open(&path, EnvFlags::empty(), EnvConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentAlreadyOpen);

    env.close(burrow::CloseFlags::empty()).unwrap();
    let env = Environment::open(&path, EnvFlags::empty(), EnvConfig::default()).unwrap();
    env.close(burrow::CloseFlags::empty()).unwrap();
}

// record-number databases restore their counter on reopen
#[test]
fn test_record_number_survives_reopen() {
    let dir = setup();
    let path = dir.path().join("test.db");
    {
        let env = Environment::create(&path, EnvFlags::empty(), EnvConfig::default()).unwrap();
        let db = env
            .create_db(
                1,
                DbParams {
                    flags: DbFlags::RECORD_NUMBER,
                    ..DbParams::default()
                },
            )
            .unwrap();
        for value in [&b"first"[..], b"second", b"third"] {
            db.insert(None, b"", value, InsertFlags::empty()).unwrap();
        }
        db.close().unwrap();
        env.close(burrow::CloseFlags::empty()).unwrap();
    }

    let env = Environment::open(&path, EnvFlags::empty(), EnvConfig::default()).unwrap();
    let db = env.open_db(1).unwrap();
    let key = db.insert_keyed(None, b"", b"fourth", InsertFlags::empty()).unwrap();
    assert_eq!(&key[..], &4u64.to_le_bytes()[..]);
    assert_eq!(&db.find(None, &2u64.to_le_bytes()).unwrap()[..], b"second");
}
