mod common;

use burrow::{ErrorKind, FindFlags, InsertFlags, TxnFlags};
use common::{setup, txn_env};

// S3: an active transaction's pending key conflicts with other
// transactions until it resolves.
#[test]
fn test_conflict_detection() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    let t1 = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&t1), b"k", b"v1", InsertFlags::empty()).unwrap();

    let t2 = env.begin_txn(None, TxnFlags::empty()).unwrap();
    let err = db.find(Some(&t2), b"k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TxnConflict);

    t1.abort().unwrap();
    let err = db.find(Some(&t2), b"k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    t2.abort().unwrap();
}

// S4: an erase is visible inside its transaction immediately, outside
// only after commit and flush.
#[test]
fn test_erase_in_txn_visibility() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.erase(Some(&txn), b"k").unwrap();

    let err = db.find(Some(&txn), b"k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    assert_eq!(&db.find(None, b"k").unwrap()[..], b"v");

    txn.commit().unwrap();
    env.flush().unwrap();
    let err = db.find(None, b"k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

// S6: approximate matching skips a key erased inside the transaction
// and reports the neighbour as approximate.
#[test]
fn test_approximate_match_with_erased_exact_key() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    for key in [b"k1", b"k2", b"k3"] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.erase(Some(&txn), b"k2").unwrap();

    let (key, record, approx) = db.find_approx(Some(&txn), b"k2", FindFlags::LEQ).unwrap();
    assert_eq!(&key[..], b"k1");
    assert_eq!(&record[..], b"k1");
    assert!(approx.is_approximate());

    let (key, _, approx) = db.find_approx(Some(&txn), b"k2", FindFlags::GEQ).unwrap();
    assert_eq!(&key[..], b"k3");
    assert!(approx.is_approximate());
    txn.abort().unwrap();
}

// S7: flushing a committed transaction re-couples its cursors onto the
// resulting B+tree positions.
#[test]
fn test_flush_recouples_cursors() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    cursor.find(b"k", FindFlags::EXACT).unwrap();
    assert!(cursor.is_coupled_to_pending_op().unwrap());

    txn.commit().unwrap();
    env.flush().unwrap();

    assert!(!cursor.is_coupled_to_pending_op().unwrap());
    let (key, record) = cursor.current().unwrap();
    assert_eq!(&key[..], b"k");
    assert_eq!(&record[..], b"v");
    cursor.close().unwrap();
}

// visibility consistency: two reads at different moments with no
// intervening write return the same result
#[test]
fn test_repeatable_reads_within_txn() {
    let dir = setup();
    let (env, db) = txn_env(&dir);
    db.insert(None, b"stable", b"1", InsertFlags::empty()).unwrap();

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    let first = db.find(Some(&txn), b"stable").unwrap();

    // another transaction overwrites the key but aborts; its pending
    // state never becomes visible to the reader
    let other = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&other), b"stable", b"2", InsertFlags::OVERWRITE)
        .unwrap();
    other.abort().unwrap();

    let second = db.find(Some(&txn), b"stable").unwrap();
    assert_eq!(first, second);
    assert_eq!(&second[..], b"1");
    txn.abort().unwrap();
}

#[test]
fn test_abort_discards_pending_writes() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"gone", b"x", InsertFlags::empty()).unwrap();
    txn.abort().unwrap();

    assert_eq!(db.find(None, b"gone").unwrap_err().kind(), ErrorKind::KeyNotFound);

    // the key is free for the next transaction
    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"gone", b"y", InsertFlags::empty()).unwrap();
    txn.commit().unwrap();
    assert_eq!(&db.find(None, b"gone").unwrap()[..], b"y");
}

#[test]
fn test_insert_conflicts() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    let t1 = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&t1), b"k", b"v", InsertFlags::empty()).unwrap();

    // an insert of the same key by another transaction conflicts
    let t2 = env.begin_txn(None, TxnFlags::empty()).unwrap();
    let err = db
        .insert(Some(&t2), b"k", b"w", InsertFlags::empty())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TxnConflict);

    t1.commit().unwrap();

    // now the key exists; a plain insert reports the duplicate
    let err = db
        .insert(Some(&t2), b"k", b"w", InsertFlags::empty())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateKey);

    // overwrite is allowed
    db.insert(Some(&t2), b"k", b"w", InsertFlags::OVERWRITE).unwrap();
    t2.commit().unwrap();
    assert_eq!(&db.find(None, b"k").unwrap()[..], b"w");
}

#[test]
fn test_duplicate_txn_names_rejected() {
    let dir = setup();
    let (env, _db) = txn_env(&dir);

    let t1 = env.begin_txn(Some("loader"), TxnFlags::empty()).unwrap();
    let err = env.begin_txn(Some("loader"), TxnFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    t1.abort().unwrap();

    // the name is free again once the transaction is flushed away
    let t2 = env.begin_txn(Some("reloader"), TxnFlags::empty()).unwrap();
    t2.commit().unwrap();
}

// lsn monotonicity, observed through the metrics surface
#[test]
fn test_lsn_monotonicity() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    let mut last = env.metrics().highest_lsn;
    for i in 0..10u32 {
        db.insert(None, &common::numkey(i), b"r", InsertFlags::empty()).unwrap();
        let now = env.metrics().highest_lsn;
        assert!(now > last);
        last = now;
    }
}

// the overlay and the tree agree after a flush: same data before and
// after the queue drains
#[test]
fn test_flush_equivalence() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    for i in 0..100u32 {
        db.insert(None, &common::numkey(i), &i.to_le_bytes(), InsertFlags::empty()).unwrap();
    }
    for i in (0..100u32).step_by(3) {
        db.erase(None, &common::numkey(i)).unwrap();
    }

    let before: Vec<_> = collect_all(&db);
    env.flush().unwrap();
    let after: Vec<_> = collect_all(&db);
    assert_eq!(before, after);
    db.check_integrity().unwrap();
}

fn collect_all(db: &burrow::Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    let cursor = db.cursor(None).unwrap();
    let mut out = Vec::new();
    let mut first = true;
    loop {
        let step = if first { cursor.first() } else { cursor.next() };
        first = false;
        match step {
            Ok((k, r)) => out.push((k.to_vec(), r.to_vec())),
            Err(_) => break,
        }
    }
    cursor.close().unwrap();
    out
}
