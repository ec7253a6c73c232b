//! End-to-end scenarios exercising more than one subsystem at a time:
//! commit durability, tree ordering under growth, bulk grafting, and the
//! replication log's commit-wait and gap-detection behavior.

use std::sync::Arc;

use latchtree::pagearray::PageArray;
use latchtree::{BTree, FileArray, MemArray, PageDb, TermLog};

fn fresh_db() -> Arc<PageDb> {
    let array: Arc<dyn PageArray> = Arc::new(MemArray::new(4096));
    Arc::new(PageDb::open(array, true).unwrap())
}

fn fresh_tree(id: u8, db: &Arc<PageDb>) -> BTree {
    let cache = Arc::new(latchtree::btree::PageCache::new(db.clone(), 256));
    BTree::create(id, Some(format!("tree-{id}")), db.clone(), cache).unwrap()
}

/// S1: a freshly created database has a valid, verifiable commit and the
/// page count tracked by the free-list manager matches what was allocated.
#[test]
fn fresh_database_commits_and_verifies() {
    let db = fresh_db();
    assert_eq!(db.commit_number(), 0);

    let tree = fresh_tree(1, &db);
    for i in 0..20u32 {
        let k = format!("key{i:03}");
        tree.store(k.as_bytes(), Some(b"value")).unwrap();
    }
    db.commit(&mut ()).unwrap();

    let mut observer = latchtree::btree::NullObserver;
    assert!(tree.verify(&mut observer).unwrap());
    assert!(db.total_page_count() > 0);
}

/// S2: store, then delete, then load returns None; re-storing the same key
/// after a delete works as a fresh insert.
#[test]
fn store_delete_reload_round_trip() {
    let db = fresh_db();
    let tree = fresh_tree(1, &db);

    tree.store(b"a", Some(b"first")).unwrap();
    assert_eq!(tree.load(b"a").unwrap(), Some(b"first".to_vec()));

    tree.delete(b"a").unwrap();
    assert_eq!(tree.load(b"a").unwrap(), None);

    tree.store(b"a", Some(b"second")).unwrap();
    assert_eq!(tree.load(b"a").unwrap(), Some(b"second".to_vec()));
}

/// S3: grafting tree `{"a","b"}` into tree `{"c","d"}` preserves key
/// order, leaves the source empty, and clears extremity bits only at the
/// new internal boundary -- the outer leaves keep theirs.
#[test]
fn graft_preserves_order_and_empties_source() {
    let db = fresh_db();
    let dest = fresh_tree(1, &db);
    let source = fresh_tree(2, &db);

    dest.store(b"a", Some(b"v")).unwrap();
    dest.store(b"b", Some(b"v")).unwrap();
    source.store(b"c", Some(b"v")).unwrap();
    source.store(b"d", Some(b"v")).unwrap();

    let moved = latchtree::graft_temp_tree(&dest, &source, true).unwrap();
    assert_eq!(moved, 2);

    let mut cursor = dest.cursor();
    cursor.first().unwrap();
    let mut seen = Vec::new();
    while let Some(k) = cursor.key() {
        seen.push(String::from_utf8(k.to_vec()).unwrap());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec!["a", "b", "c", "d"]);

    let mut source_cursor = source.cursor();
    source_cursor.first().unwrap();
    assert_eq!(source_cursor.key(), None);

    let mut low = dest.cursor();
    low.find(b"a").unwrap();
    let low_leaf = low.leaf_page().unwrap();
    let mut high = dest.cursor();
    high.find(b"d").unwrap();
    let high_leaf = high.leaf_page().unwrap();

    assert_eq!(dest.extremity_bits(low_leaf).unwrap(), (true, false));
    assert_eq!(dest.extremity_bits(high_leaf).unwrap(), (false, true));
    assert_eq!(dest.extremity_bits(dest.root_id()).unwrap(), (true, true));
}

/// S4: a waiter blocked on `wait_for_commit` unblocks only once the
/// writer's data is both written and explicitly committed, and a reader
/// positioned at the start of the term sees the written bytes.
#[test]
fn term_log_wait_for_commit_unblocks_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(TermLog::open(dir.path()).unwrap());

    log.open_writer(0).write(b"hello").unwrap();
    let reader_log = log.clone();
    let waiter = std::thread::spawn(move || reader_log.wait_for_commit(5));

    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(!waiter.is_finished());

    log.commit(2).unwrap();
    log.commit(5).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), Some(5));

    let mut reader = log.open_reader(0);
    let mut buf = [0u8; 5];
    assert_eq!(reader.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
}

/// S5: out-of-order writes leave a gap that `check_for_missing_data`
/// reports, and the gap closes once the missing bytes are filled in.
#[test]
fn term_log_check_for_missing_data_reports_then_closes_gap() {
    let dir = tempfile::tempdir().unwrap();
    let log = TermLog::open(dir.path()).unwrap();

    log.open_writer(50).write(&[0u8; 100]).unwrap();

    let mut gaps = Vec::new();
    let bound = log.check_for_missing_data(0, |s, e| gaps.push((s, e)));
    assert_eq!(bound, 0);
    assert_eq!(gaps, vec![(0, 50)]);

    log.open_writer(0).write(&[0u8; 55]).unwrap();

    let mut gaps = Vec::new();
    let bound = log.check_for_missing_data(0, |s, e| gaps.push((s, e)));
    assert_eq!(bound, 150);
    assert!(gaps.is_empty());
}

/// S6: a snapshot taken mid-operation restores into a fresh array with the
/// same database id and an independently openable `PageDb`.
#[test]
fn snapshot_restores_into_fresh_array() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    let array: Arc<dyn PageArray> = Arc::new(FileArray::new(file, 4096));
    let db = Arc::new(PageDb::open(array.clone(), true).unwrap());

    let tree = fresh_tree(1, &db);
    for i in 0..30u32 {
        tree.store(format!("k{i:03}").as_bytes(), Some(b"payload")).unwrap();
    }
    db.commit(&mut ()).unwrap();

    let snapshot = db.begin_snapshot().unwrap();
    let dest_array: Arc<dyn PageArray> = Arc::new(MemArray::new(4096));
    let restored = PageDb::restore_from_snapshot(array.as_ref(), &snapshot, dest_array).unwrap();

    assert_eq!(restored.database_id(), db.database_id());
    assert_eq!(restored.total_page_count(), db.total_page_count());
}
