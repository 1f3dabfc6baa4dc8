mod common;

use burrow::{ErrorKind, FindFlags, InsertFlags, MoveFlags, TxnFlags};
use common::{plain_env, setup, txn_env};

// S2: duplicates pending in a transaction append after the committed
// ones; one cursor walks the merged list in order.
#[test]
fn test_duplicate_merge_across_layers() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    for record in [&b"r1.1"[..], b"r1.2", b"r1.3"] {
        db.insert(None, b"k1", record, InsertFlags::DUPLICATE).unwrap();
    }

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    for record in [&b"r1.4"[..], b"r1.5"] {
        db.insert(Some(&txn), b"k1", record, InsertFlags::DUPLICATE).unwrap();
    }

    let cursor = db.cursor(Some(&txn)).unwrap();
    let expected: [&[u8]; 5] = [b"r1.1", b"r1.2", b"r1.3", b"r1.4", b"r1.5"];
    for (i, want) in expected.iter().enumerate() {
        let step = if i == 0 { cursor.first() } else { cursor.next() };
        let (key, record) = step.unwrap();
        assert_eq!(&key[..], b"k1");
        assert_eq!(&record[..], *want);
        if i == 0 {
            assert_eq!(cursor.duplicate_count().unwrap(), 5);
        }
    }
    assert_eq!(cursor.next().unwrap_err().kind(), ErrorKind::KeyNotFound);
    cursor.close().unwrap();
    txn.commit().unwrap();
}

// the five insertion modes, on the physical duplicate list
#[test]
fn test_duplicate_insert_modes() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    db.insert(None, b"k", b"A", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::EXACT).unwrap();

    // append: [A B], cursor on B
    cursor.insert(b"k", b"B", InsertFlags::DUPLICATE).unwrap();
    assert_eq!(cursor.duplicate_position().unwrap(), 2);

    // before the current duplicate: [A C B], cursor on C
    cursor
        .insert(b"k", b"C", InsertFlags::DUPLICATE_INSERT_BEFORE)
        .unwrap();
    assert_eq!(cursor.duplicate_position().unwrap(), 2);

    // prepend: [D A C B]
    cursor
        .insert(b"k", b"D", InsertFlags::DUPLICATE_INSERT_FIRST)
        .unwrap();
    assert_eq!(cursor.duplicate_position().unwrap(), 1);

    // after the current duplicate: [D E A C B]
    cursor
        .insert(b"k", b"E", InsertFlags::DUPLICATE_INSERT_AFTER)
        .unwrap();
    assert_eq!(cursor.duplicate_position().unwrap(), 2);

    assert_eq!(cursor.duplicate_count().unwrap(), 5);

    let expected: [&[u8]; 5] = [b"D", b"E", b"A", b"C", b"B"];
    for (i, want) in expected.iter().enumerate() {
        let step = if i == 0 { cursor.first() } else { cursor.next() };
        let (_, record) = step.unwrap();
        assert_eq!(&record[..], *want);
    }
    cursor.close().unwrap();
}

// duplicate count law: inserts minus erases, across both layers
#[test]
fn test_duplicate_count_law() {
    let dir = setup();
    let (env, db) = txn_env(&dir);

    for record in [&b"a"[..], b"b", b"c"] {
        db.insert(None, b"k", record, InsertFlags::DUPLICATE).unwrap();
    }
    env.flush().unwrap(); // move them into the B+tree

    let txn = env.begin_txn(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"d", InsertFlags::DUPLICATE).unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    cursor.find(b"k", FindFlags::EXACT).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 4);

    // erase one duplicate through the cursor
    cursor.next().unwrap();
    assert_eq!(cursor.duplicate_position().unwrap(), 2);
    cursor.erase().unwrap();

    cursor.find(b"k", FindFlags::EXACT).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 3);
    cursor.close().unwrap();
    txn.commit().unwrap();
}

// erasing the key drops the whole duplicate list
#[test]
fn test_erase_drops_all_duplicates() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    for record in [&b"a"[..], b"b", b"c"] {
        db.insert(None, b"k", record, InsertFlags::DUPLICATE).unwrap();
    }
    assert_eq!(db.count(None, false).unwrap(), 3);
    assert_eq!(db.count(None, true).unwrap(), 1);

    db.erase(None, b"k").unwrap();
    assert_eq!(db.find(None, b"k").unwrap_err().kind(), ErrorKind::KeyNotFound);
    assert_eq!(db.count(None, false).unwrap(), 0);
}

// SKIP_DUPLICATES visits each key once, ONLY_DUPLICATES stays on one key
#[test]
fn test_skip_and_only_duplicates() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    for record in [&b"1"[..], b"2", b"3"] {
        db.insert(None, b"a", record, InsertFlags::DUPLICATE).unwrap();
    }
    db.insert(None, b"b", b"4", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    let (key, _) = cursor.first().unwrap();
    assert_eq!(&key[..], b"a");
    let (key, _) = cursor
        .move_to(MoveFlags::NEXT | MoveFlags::SKIP_DUPLICATES)
        .unwrap();
    assert_eq!(&key[..], b"b");
    cursor.close().unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.first().unwrap();
    let (_, record) = cursor
        .move_to(MoveFlags::NEXT | MoveFlags::ONLY_DUPLICATES)
        .unwrap();
    assert_eq!(&record[..], b"2");
    cursor
        .move_to(MoveFlags::NEXT | MoveFlags::ONLY_DUPLICATES)
        .unwrap();
    // the duplicate list is exhausted; the cursor refuses to leave the key
    let err = cursor
        .move_to(MoveFlags::NEXT | MoveFlags::ONLY_DUPLICATES)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    cursor.close().unwrap();
}

// a sibling cursor keeps its duplicate when another cursor inserts
// before it
#[test]
fn test_sibling_cursor_reindexes_on_duplicate_insert() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    db.insert(None, b"k", b"A", InsertFlags::empty()).unwrap();
    db.insert(None, b"k", b"B", InsertFlags::DUPLICATE).unwrap();

    // park a sibling on the second duplicate
    let sibling = db.cursor(None).unwrap();
    sibling.first().unwrap();
    let (_, record) = sibling.next().unwrap();
    assert_eq!(&record[..], b"B");

    // another cursor prepends a duplicate
    let writer = db.cursor(None).unwrap();
    writer.find(b"k", FindFlags::EXACT).unwrap();
    writer
        .insert(b"k", b"Z", InsertFlags::DUPLICATE_INSERT_FIRST)
        .unwrap();
    writer.close().unwrap();

    // the sibling still reports B, now at position 3
    let (_, record) = sibling.current().unwrap();
    assert_eq!(&record[..], b"B");
    assert_eq!(sibling.duplicate_position().unwrap(), 3);
    sibling.close().unwrap();
}

// duplicates work when the records are too large to stay inline
#[test]
fn test_blob_backed_duplicates() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    let big_a = vec![b'a'; 500];
    let big_b = vec![b'b'; 9000];
    db.insert(None, b"k", &big_a, InsertFlags::DUPLICATE).unwrap();
    db.insert(None, b"k", &big_b, InsertFlags::DUPLICATE).unwrap();

    let cursor = db.cursor(None).unwrap();
    let (_, first) = cursor.first().unwrap();
    assert_eq!(first.len(), 500);
    let (_, second) = cursor.next().unwrap();
    assert_eq!(second.len(), 9000);
    assert_eq!(cursor.record_size().unwrap(), 9000);
    cursor.close().unwrap();
}
