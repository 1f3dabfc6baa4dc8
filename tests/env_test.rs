mod common;

use burrow::{
    CloseFlags, DbParams, EnvConfig, EnvFlags, Environment, ErrorKind, FindFlags, InsertFlags,
    KeyType, TxnFlags,
};
use common::{numkey, setup, txn_env};

// an in-memory environment never touches the filesystem
#[test]
fn test_in_memory_environment() {
    let dir = setup();
    let env = Environment::create(
        dir.path().join("unused.db"),
        EnvFlags::IN_MEMORY | EnvFlags::ENABLE_TRANSACTIONS,
        EnvConfig::default(),
    )
    .unwrap();
    let db = env.create_db(1, DbParams::default()).unwrap();

    for i in 0..500u32 {
        db.insert(None, &numkey(i), b"mem", InsertFlags::empty()).unwrap();
    }
    env.flush().unwrap();
    assert_eq!(db.count(None, false).unwrap(), 500);
    assert_eq!(&db.find(None, &numkey(123)).unwrap()[..], b"mem");

    assert!(!dir.path().join("unused.db").exists());
    db.close().unwrap();
    env.close(CloseFlags::empty()).unwrap();
}

// a partial write replaces one slice of the record
#[test]
fn test_partial_record_write() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    db.insert(None, b"k", b"hello world", InsertFlags::empty()).unwrap();
    db.insert_partial(None, b"k", b"RUST!", 6).unwrap();
    assert_eq!(&db.find(None, b"k").unwrap()[..], b"hello RUST!");

    // extending past the end zero-pads the gap
    db.insert_partial(None, b"k", b"!", 14).unwrap();
    assert_eq!(&db.find(None, b"k").unwrap()[..], b"hello RUST!\0\0\0!");

    // partial writes are incompatible with explicit transactions
    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    let err = db.insert_partial(Some(&txn), b"k", b"x", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    txn.abort().unwrap();
}

#[test]
fn test_database_management() {
    let dir = setup();
    let env = Environment::create(
        dir.path().join("test.db"),
        EnvFlags::empty(),
        EnvConfig::default(),
    )
    .unwrap();

    let db1 = env.create_db(1, DbParams::default()).unwrap();
    let db3 = env.create_db(3, DbParams::default()).unwrap();
    db1.insert(None, b"k", b"one", InsertFlags::empty()).unwrap();
    db3.insert(None, b"k", b"three", InsertFlags::empty()).unwrap();
    assert_eq!(env.database_names(), vec![1, 3]);

    // names clash
    assert_eq!(
        env.create_db(1, DbParams::default()).unwrap_err().kind(),
        ErrorKind::DatabaseAlreadyExists
    );

    // rename requires the database to be closed
    assert_eq!(
        env.rename_db(1, 2).unwrap_err().kind(),
        ErrorKind::DatabaseAlreadyOpen
    );
    db1.close().unwrap();
    env.rename_db(1, 2).unwrap();
    assert_eq!(env.database_names(), vec![2, 3]);

    let db2 = env.open_db(2).unwrap();
    assert_eq!(&db2.find(None, b"k").unwrap()[..], b"one");
    db2.close().unwrap();

    // erase frees the name and the pages
    env.erase_db(2).unwrap();
    assert_eq!(env.database_names(), vec![3]);
    assert_eq!(
        env.open_db(2).unwrap_err().kind(),
        ErrorKind::DatabaseNotFound
    );

    db3.close().unwrap();
    env.close(CloseFlags::empty()).unwrap();
}

#[test]
fn test_typed_keys_sort_numerically() {
    let dir = setup();
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
                key_type: KeyType::U32,
                ..DbParams::default()
            },
        )
        .unwrap();

    // lexicographically, 256 would sort before 9
    for value in [9u32, 256, 1, 70000] {
        db.insert(None, &value.to_le_bytes(), b"r", InsertFlags::empty()).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    let mut seen = Vec::new();
    let mut first = true;
    loop {
        let step = if first { cursor.first() } else { cursor.next() };
        first = false;
        match step {
            Ok((key, _)) => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&key);
                seen.push(u32::from_le_bytes(raw));
            }
            Err(_) => break,
        }
    }
    assert_eq!(seen, vec![1, 9, 256, 70000]);
    cursor.close().unwrap();

    // fixed-width keys reject other sizes
    let err = db.insert(None, b"abc", b"r", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKeySize);
}

// the count merges the pending overlay over the tree
#[test]
fn test_count_sees_overlay() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    for i in 0..10u32 {
        db.insert(None, &numkey(i), b"r", InsertFlags::empty()).unwrap();
    }
    env.flush().unwrap();

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), &numkey(100), b"new", InsertFlags::empty()).unwrap();
    db.erase(Some(&txn), &numkey(0)).unwrap();

    assert_eq!(db.count(Some(&txn), false).unwrap(), 10);
    // the uncommitted transaction is invisible outside
    assert_eq!(db.count(None, false).unwrap(), 10);

    txn.commit().unwrap();
    env.flush().unwrap();
    assert_eq!(db.count(None, false).unwrap(), 10);
    assert_eq!(
        db.find(None, &numkey(0)).unwrap_err().kind(),
        ErrorKind::KeyNotFound
    );
}

#[test]
fn test_metrics_counters() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    txn.abort().unwrap();

    let metrics = env.metrics();
    assert!(metrics.txns_begun >= 2);
    assert_eq!(metrics.txns_committed, 1);
    assert_eq!(metrics.txns_aborted, 1);
    assert!(metrics.highest_lsn > 0);
    assert!(metrics.pages_fetched > 0);
}

// closing out of order is rejected; auto-cleanup closes dependents in
// reverse dependency order
#[test]
fn test_close_discipline() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
    let cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::EXACT).unwrap();

    assert_eq!(
        env.close(CloseFlags::empty()).unwrap_err().kind(),
        ErrorKind::CursorStillOpen
    );
    assert_eq!(
        db.close().unwrap_err().kind(),
        ErrorKind::CursorStillOpen
    );

    env.close(CloseFlags::AUTO_CLEANUP | CloseFlags::AUTO_ABORT).unwrap();
}

#[test]
fn test_close_with_pending_txn() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();

    assert_eq!(
        db.close().unwrap_err().kind(),
        ErrorKind::TxnStillOpen
    );
    assert_eq!(
        env.close(CloseFlags::empty()).unwrap_err().kind(),
        ErrorKind::TxnStillOpen
    );
    txn.commit().unwrap();
    db.close().unwrap();
    env.close(CloseFlags::empty()).unwrap();
}

#[test]
fn test_invalid_page_size_rejected() {
    let dir = setup();
    let err = Environment::create(
        dir.path().join("bad.db"),
        EnvFlags::empty(),
        EnvConfig {
            page_size: 3000,
            ..EnvConfig::default()
        },
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPageSize);
}

#[test]
fn test_record_size_constraint() {
    let dir = setup();
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
                record_size: 4,
                ..DbParams::default()
            },
        )
        .unwrap();

    db.insert(None, b"k", b"1234", InsertFlags::empty()).unwrap();
    let err = db.insert(None, b"j", b"12345", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRecordSize);
}
