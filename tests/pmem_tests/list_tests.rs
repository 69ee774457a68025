//! Persistent List Tests
//!
//! Tests verify:
//! - Linking at the head and the resulting chain shape
//! - Back-references from strings to their entry
//! - Unlinking from head, middle and tail
//! - Detection of structural damage by `verify`
//! - Atomicity of a link interrupted at any step

use tierkv::error::TierError;
use tierkv::pmem::list::{self, KvEntry, ListRoot};
use tierkv::pmem::{Locator, PmemString, Pool};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup() -> (Pool, Locator) {
    let mut pool = Pool::volatile(1024 * 1024).unwrap();
    let root = pool.root(ListRoot::SIZE).unwrap();
    (pool, root)
}

fn push(pool: &mut Pool, root: Locator, key: &[u8], value: &[u8]) -> Locator {
    pool.transaction(|tx| {
        let k = PmemString::dup(tx, key)?;
        let v = PmemString::dup(tx, value)?;
        list::link(tx, root, k, v)
    })
    .unwrap()
}

fn keys_in_order(pool: &Pool, root: Locator) -> Vec<Vec<u8>> {
    list::walk(pool, root)
        .unwrap()
        .map(|item| {
            let (_, entry) = item.unwrap();
            PmemString::load(pool, entry.key).unwrap().data
        })
        .collect()
}

// =============================================================================
// Linking Tests
// =============================================================================

#[test]
fn test_empty_list() {
    let (pool, root) = setup();

    assert_eq!(list::count(&pool, root).unwrap(), 0);
    assert_eq!(list::walk(&pool, root).unwrap().count(), 0);

    let report = list::verify(&pool, root).unwrap();
    assert_eq!(report.count, 0);
    assert_eq!(report.reachable, 0);
}

#[test]
fn test_link_pushes_at_head() {
    let (mut pool, root) = setup();

    let a = push(&mut pool, root, b"a", b"1");
    let b = push(&mut pool, root, b"b", b"2");
    let c = push(&mut pool, root, b"c", b"3");

    assert_eq!(pool.get(root, ListRoot::HEAD).unwrap(), c);
    assert_eq!(list::count(&pool, root).unwrap(), 3);
    assert_eq!(keys_in_order(&pool, root), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);

    let entry_b = list::read_entry(&pool, b).unwrap();
    assert_eq!(entry_b.prev, c);
    assert_eq!(entry_b.next, a);
    assert!(list::read_entry(&pool, c).unwrap().prev.is_null());
    assert!(list::read_entry(&pool, a).unwrap().next.is_null());

    let report = list::verify(&pool, root).unwrap();
    assert_eq!(report.reachable, 3);
}

#[test]
fn test_link_stamps_back_references() {
    let (mut pool, root) = setup();
    let entry = push(&mut pool, root, b"key", b"value");

    let snapshot = list::read_entry(&pool, entry).unwrap();
    assert_eq!(PmemString::backref(&pool, snapshot.key).unwrap(), entry);
    assert_eq!(PmemString::backref(&pool, snapshot.value).unwrap(), entry);
    assert_eq!(PmemString::load(&pool, snapshot.value).unwrap().as_bytes(), b"value");
}

#[test]
fn test_read_entry_rejects_non_entries() {
    let (mut pool, root) = setup();
    let entry = push(&mut pool, root, b"key", b"value");
    let key = list::read_entry(&pool, entry).unwrap().key;

    let result = list::read_entry(&pool, key);
    assert!(matches!(result, Err(TierError::ListCorruption(_))));
}

// =============================================================================
// Unlinking Tests
// =============================================================================

fn unlink(pool: &mut Pool, root: Locator, entry: Locator) {
    pool.transaction(|tx| list::unlink(tx, root, entry)).unwrap();
}

#[test]
fn test_unlink_middle() {
    let (mut pool, root) = setup();
    push(&mut pool, root, b"a", b"1");
    let b = push(&mut pool, root, b"b", b"2");
    push(&mut pool, root, b"c", b"3");
    let allocations = pool.allocation_count();

    unlink(&mut pool, root, b);

    assert_eq!(keys_in_order(&pool, root), vec![b"c".to_vec(), b"a".to_vec()]);
    assert_eq!(list::verify(&pool, root).unwrap().count, 2);
    // Entry, key and value are all released
    assert_eq!(pool.allocation_count(), allocations - 3);
}

#[test]
fn test_unlink_head_and_tail() {
    let (mut pool, root) = setup();
    let a = push(&mut pool, root, b"a", b"1");
    push(&mut pool, root, b"b", b"2");
    let c = push(&mut pool, root, b"c", b"3");

    unlink(&mut pool, root, c);
    unlink(&mut pool, root, a);

    assert_eq!(keys_in_order(&pool, root), vec![b"b".to_vec()]);
    list::verify(&pool, root).unwrap();
}

#[test]
fn test_unlink_last_entry_empties_list() {
    let (mut pool, root) = setup();
    let a = push(&mut pool, root, b"a", b"1");

    unlink(&mut pool, root, a);

    assert!(pool.get(root, ListRoot::HEAD).unwrap().is_null());
    assert_eq!(list::count(&pool, root).unwrap(), 0);
    assert_eq!(pool.allocation_count(), 1); // the root
}

#[test]
fn test_unlink_orphan_without_predecessor_fails() {
    let (mut pool, root) = setup();
    let a = push(&mut pool, root, b"a", b"1");
    push(&mut pool, root, b"b", b"2");

    pool.transaction(|tx| tx.set(a, KvEntry::PREV, &Locator::NULL))
        .unwrap();

    let result = pool.transaction(|tx| list::unlink(tx, root, a));
    assert!(matches!(result, Err(TierError::ListCorruption(_))));
    assert_eq!(list::count(&pool, root).unwrap(), 2);
}

// =============================================================================
// Verification Tests
// =============================================================================

#[test]
fn test_verify_detects_count_mismatch() {
    let (mut pool, root) = setup();
    push(&mut pool, root, b"a", b"1");

    pool.transaction(|tx| tx.set(root, ListRoot::COUNT, &5)).unwrap();

    assert!(matches!(list::verify(&pool, root), Err(TierError::ListCorruption(_))));
}

#[test]
fn test_verify_detects_broken_prev_link() {
    let (mut pool, root) = setup();
    let a = push(&mut pool, root, b"a", b"1");
    push(&mut pool, root, b"b", b"2");

    pool.transaction(|tx| tx.set(a, KvEntry::PREV, &a)).unwrap();

    assert!(matches!(list::verify(&pool, root), Err(TierError::ListCorruption(_))));
}

#[test]
fn test_verify_detects_foreign_back_reference() {
    let (mut pool, root) = setup();
    let a = push(&mut pool, root, b"a", b"1");
    let b = push(&mut pool, root, b"b", b"2");
    let value_of_a = list::read_entry(&pool, a).unwrap().value;

    pool.transaction(|tx| PmemString::set_backref(tx, value_of_a, b))
        .unwrap();

    assert!(matches!(list::verify(&pool, root), Err(TierError::ListCorruption(_))));
}

#[test]
fn test_walk_stops_on_cycle() {
    let (mut pool, root) = setup();
    let a = push(&mut pool, root, b"a", b"1");
    let b = push(&mut pool, root, b"b", b"2");

    // b -> a -> b -> ...
    pool.transaction(|tx| tx.set(a, KvEntry::NEXT, &b)).unwrap();

    let items: Vec<_> = list::walk(&pool, root).unwrap().collect();
    assert!(items.len() <= pool.allocation_count() + 1);
    assert!(matches!(items.last(), Some(Err(TierError::ListCorruption(_)))));
}

// =============================================================================
// Atomicity Tests
// =============================================================================

#[test]
fn test_interrupted_link_leaves_list_intact() {
    for n in 0.. {
        let (mut pool, root) = setup();
        push(&mut pool, root, b"a", b"1");
        push(&mut pool, root, b"b", b"2");
        let allocations = pool.allocation_count();
        let used = pool.used_bytes();

        pool.inject_crash_after(n);
        let result = pool.transaction(|tx| {
            let k = PmemString::dup(tx, b"c")?;
            let v = PmemString::dup(tx, b"3")?;
            list::link(tx, root, k, v)
        });

        match result {
            Ok(_) => {
                assert!(n > 0);
                assert_eq!(list::verify(&pool, root).unwrap().count, 3);
                break;
            }
            Err(e) => {
                assert!(matches!(e, TierError::Crashed), "step {}: {}", n, e);
                pool.recover().unwrap();

                let report = list::verify(&pool, root).unwrap();
                assert_eq!(report.count, 2, "step {}", n);
                assert_eq!(pool.allocation_count(), allocations, "step {}", n);
                assert_eq!(pool.used_bytes(), used, "step {}", n);
                assert_eq!(keys_in_order(&pool, root), vec![b"b".to_vec(), b"a".to_vec()]);
            }
        }
    }
}

#[test]
fn test_interrupted_unlink_leaves_list_intact() {
    for n in 0.. {
        let (mut pool, root) = setup();
        push(&mut pool, root, b"a", b"1");
        let b = push(&mut pool, root, b"b", b"2");
        push(&mut pool, root, b"c", b"3");

        pool.inject_crash_after(n);
        match pool.transaction(|tx| list::unlink(tx, root, b)) {
            Ok(()) => {
                assert_eq!(keys_in_order(&pool, root), vec![b"c".to_vec(), b"a".to_vec()]);
                break;
            }
            Err(_) => {
                pool.recover().unwrap();
                assert_eq!(
                    keys_in_order(&pool, root),
                    vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()],
                    "step {}",
                    n
                );
                list::verify(&pool, root).unwrap();
            }
        }
    }
}
