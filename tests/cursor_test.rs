mod common;

use burrow::{ErrorKind, FindFlags, InsertFlags, MoveFlags};
use common::{numkey, plain_env, setup, txn_env};

// Bulk insert with page splits: cloned cursors parked on every 1000th
// key must keep reporting their original pair after thousands of splits
// shuffled the pages underneath them.
#[test]
fn test_cursors_survive_splits() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    let mut parked = Vec::new();
    for i in 0..20_000u32 {
        let key = numkey(i);
        db.insert(None, &key, b"xxxxx", InsertFlags::empty()).unwrap();
        if i % 1000 == 0 {
            let cursor = db.cursor(None).unwrap();
            cursor.find(&key, FindFlags::EXACT).unwrap();
            parked.push((key, cursor.try_clone().unwrap()));
            cursor.close().unwrap();
        }
    }

    db.check_integrity().unwrap();

    for (key, cursor) in parked {
        let (k, r) = cursor.current().unwrap();
        assert_eq!(&k[..], &key[..]);
        assert_eq!(&r[..], b"xxxxx");
        cursor.close().unwrap();
    }
}

// S5: a cursor asked to reverse direction emits every key exactly once
// in the new direction.
#[test]
fn test_direction_reversal() {
    let dir = setup();
    let (_env, db) = txn_env(&dir);

    for key in [b"a", b"b", b"c", b"d", b"e"] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    let expected: [(&[u8], MoveFlags); 6] = [
        (b"a", MoveFlags::FIRST),
        (b"b", MoveFlags::NEXT),
        (b"c", MoveFlags::NEXT),
        (b"b", MoveFlags::PREVIOUS),
        (b"c", MoveFlags::NEXT),
        (b"d", MoveFlags::NEXT),
    ];
    for (want, flags) in expected {
        let (key, record) = cursor.move_to(flags).unwrap();
        assert_eq!(&key[..], want);
        assert_eq!(&record[..], want);
    }
    cursor.close().unwrap();
}

// order preservation under a random insertion order
#[test]
fn test_forward_iteration_is_sorted() {
    use rand::seq::SliceRandom;

    let dir = setup();
    let (_env, db) = plain_env(&dir);

    let mut keys: Vec<u32> = (0..2000).collect();
    keys.shuffle(&mut rand::thread_rng());
    for i in &keys {
        db.insert(None, &numkey(*i), b"r", InsertFlags::empty()).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    let mut seen = 0u32;
    let mut last = Vec::new();
    loop {
        let step = if seen == 0 {
            cursor.first()
        } else {
            cursor.next()
        };
        match step {
            Ok((key, _)) => {
                if seen > 0 {
                    assert!(key.as_ref() > last.as_slice());
                }
                last = key.to_vec();
                seen += 1;
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::KeyNotFound);
                break;
            }
        }
    }
    assert_eq!(seen, 2000);
    cursor.close().unwrap();
}

// erase-driven merges: shrink the tree back down and check the chain
#[test]
fn test_erase_rebalances_tree() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    for i in 0..5000u32 {
        db.insert(None, &numkey(i), b"payload", InsertFlags::empty()).unwrap();
    }
    // drop every key not divisible by 17
    for i in 0..5000u32 {
        if i % 17 != 0 {
            db.erase(None, &numkey(i)).unwrap();
        }
    }
    db.check_integrity().unwrap();
    assert_eq!(db.count(None, false).unwrap(), (0..5000).filter(|i| i % 17 == 0).count() as u64);

    let cursor = db.cursor(None).unwrap();
    let (first, _) = cursor.first().unwrap();
    assert_eq!(&first[..], &numkey(0)[..]);
    cursor.close().unwrap();
}

// approximate matching on the btree path
#[test]
fn test_approximate_find() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);

    for key in [&b"bb"[..], &b"dd"[..], &b"ff"[..]] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let (key, _, approx) = db.find_approx(None, b"cc", FindFlags::LEQ).unwrap();
    assert_eq!(&key[..], b"bb");
    assert!(approx.is_approximate());

    let (key, _, approx) = db.find_approx(None, b"cc", FindFlags::GEQ).unwrap();
    assert_eq!(&key[..], b"dd");
    assert!(approx.is_approximate());

    let (key, _, approx) = db.find_approx(None, b"dd", FindFlags::LEQ).unwrap();
    assert_eq!(&key[..], b"dd");
    assert!(!approx.is_approximate());

    let (key, _, _) = db.find_approx(None, b"dd", FindFlags::LT).unwrap();
    assert_eq!(&key[..], b"bb");

    let (key, _, _) = db.find_approx(None, b"dd", FindFlags::GT).unwrap();
    assert_eq!(&key[..], b"ff");

    let err = db.find_approx(None, b"bb", FindFlags::LT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

// a nil cursor re-enters at the near edge on first use and at the far
// edge after running off the end
#[test]
fn test_nil_cursor_reentry() {
    let dir = setup();
    let (_env, db) = txn_env(&dir);
    for key in [b"a", b"b"] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    // never used: NEXT acts as FIRST
    let (key, _) = cursor.next().unwrap();
    assert_eq!(&key[..], b"a");
    cursor.next().unwrap();
    assert_eq!(cursor.next().unwrap_err().kind(), ErrorKind::KeyNotFound);
    // exhausted: NEXT re-enters at LAST
    let (key, _) = cursor.next().unwrap();
    assert_eq!(&key[..], b"b");
    cursor.close().unwrap();
}

#[test]
fn test_cursor_overwrite() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);
    db.insert(None, b"k", b"old", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::EXACT).unwrap();
    cursor.overwrite(b"new").unwrap();
    let (_, record) = cursor.current().unwrap();
    assert_eq!(&record[..], b"new");
    cursor.close().unwrap();

    assert_eq!(&db.find(None, b"k").unwrap()[..], b"new");
}

#[test]
fn test_cursor_erase_nils_cursor() {
    let dir = setup();
    let (_env, db) = plain_env(&dir);
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::EXACT).unwrap();
    cursor.erase().unwrap();
    assert_eq!(cursor.current().unwrap_err().kind(), ErrorKind::CursorIsNil);
    cursor.close().unwrap();

    assert_eq!(db.find(None, b"k").unwrap_err().kind(), ErrorKind::KeyNotFound);
}
