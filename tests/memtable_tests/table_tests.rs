//! MemTable Tests
//!
//! Tests verify:
//! - Insert / find / remove
//! - Value replacement returning the previous value
//! - DRAM and PMEM byte accounting by tier
//! - String object encodings
//! - Concurrent readers

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tierkv::memtable::{Encoding, KeyTable, MemTable, StoredValue, StrObject};
use tierkv::pmem::Locator;
use tierkv::tiering::Tier;

// =============================================================================
// Helper Functions
// =============================================================================

fn loc(offset: u64) -> Locator {
    Locator { pool_id: 1, offset }
}

fn value(bytes: &'static [u8], tier: Tier, twin: u64) -> StoredValue {
    StoredValue {
        object: Arc::new(StrObject::encode(Bytes::from_static(bytes), tier)),
        twin: loc(twin),
    }
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_new_memtable_is_empty() {
    let table = MemTable::new();
    assert_eq!(table.entry_count(), 0);
    assert_eq!(table.dram_bytes(), 0);
    assert!(table.is_empty());
}

#[test]
fn test_insert_and_find() {
    let table = MemTable::new();

    assert!(table.insert_if_absent(Bytes::from_static(b"key1"), loc(64), value(b"value1", Tier::Dram, 128)));

    let entry = table.find(b"key1").unwrap();
    assert_eq!(entry.key, Bytes::from_static(b"key1"));
    assert_eq!(entry.entry, loc(64));
    assert_eq!(entry.value.twin, loc(128));
    assert_eq!(entry.value.object.bytes(), &Bytes::from_static(b"value1"));

    assert!(table.lookup(b"key1").is_some());
    assert!(table.find(b"missing").is_none());
}

#[test]
fn test_insert_if_absent_keeps_existing() {
    let table = MemTable::new();

    assert!(table.insert_if_absent(Bytes::from_static(b"k"), loc(64), value(b"first", Tier::Dram, 128)));
    assert!(!table.insert_if_absent(Bytes::from_static(b"k"), loc(256), value(b"second", Tier::Dram, 512)));

    let entry = table.find(b"k").unwrap();
    assert_eq!(entry.entry, loc(64));
    assert_eq!(entry.value.object.bytes(), &Bytes::from_static(b"first"));
    assert_eq!(table.entry_count(), 1);
}

#[test]
fn test_set_value_returns_previous() {
    let table = MemTable::new();
    table.insert_if_absent(Bytes::from_static(b"k"), loc(64), value(b"old", Tier::Dram, 128));

    let previous = table.set_value(b"k", value(b"new", Tier::Dram, 256)).unwrap();
    assert_eq!(previous.object.bytes(), &Bytes::from_static(b"old"));
    assert_eq!(previous.twin, loc(128));

    let entry = table.find(b"k").unwrap();
    assert_eq!(entry.value.twin, loc(256));
    // The entry back-reference does not move
    assert_eq!(entry.entry, loc(64));
}

#[test]
fn test_set_value_on_missing_key() {
    let table = MemTable::new();
    assert!(table.set_value(b"missing", value(b"v", Tier::Dram, 64)).is_none());
    assert_eq!(table.dram_bytes(), 0);
}

#[test]
fn test_remove() {
    let table = MemTable::new();
    table.insert_if_absent(Bytes::from_static(b"k"), loc(64), value(b"v", Tier::Dram, 128));

    let removed = table.remove(b"k").unwrap();
    assert_eq!(removed.entry, loc(64));
    table.release_value(removed.value);

    assert!(table.find(b"k").is_none());
    assert!(table.remove(b"k").is_none());
    assert_eq!(table.dram_bytes(), 0);
}

#[test]
fn test_keys_and_clear() {
    let table = MemTable::new();
    for (i, key) in [&b"a"[..], b"b", b"c"].into_iter().enumerate() {
        table.insert_if_absent(Bytes::copy_from_slice(key), loc(64 * (i as u64 + 1)), value(b"v", Tier::Dram, 1024));
    }

    let mut keys = table.keys();
    keys.sort();
    assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]);

    table.clear();
    assert!(table.is_empty());
    assert_eq!(table.dram_bytes(), 0);
}

// =============================================================================
// Tier Accounting Tests
// =============================================================================

#[test]
fn test_dram_bytes_count_keys_and_dram_values() {
    let table = MemTable::new();

    table.insert_if_absent(Bytes::from_static(b"key"), loc(64), value(b"dram-value", Tier::Dram, 128));
    assert_eq!(table.dram_bytes(), 3 + 10);

    table.insert_if_absent(Bytes::from_static(b"big"), loc(256), value(b"pmem-value", Tier::Pmem, 512));
    // Only the key is charged for a PMEM value
    assert_eq!(table.dram_bytes(), 3 + 10 + 3);
    assert_eq!(table.pmem_bytes(), 10);
}

#[test]
fn test_pmem_bytes_follow_tier_changes() {
    let table = MemTable::new();
    table.insert_if_absent(Bytes::from_static(b"key"), loc(64), value(b"pmem-value", Tier::Pmem, 128));

    // A DRAM replacement moves the payload charge across tiers
    let previous = table.set_value(b"key", value(b"dram", Tier::Dram, 256)).unwrap();
    table.release_value(previous);
    assert_eq!(table.pmem_bytes(), 0);
    assert_eq!(table.dram_bytes(), 3 + 4);

    let previous = table.set_value(b"key", value(b"pmem-again", Tier::Pmem, 512)).unwrap();
    table.release_value(previous);
    assert_eq!(table.pmem_bytes(), 10);

    let removed = table.remove(b"key").unwrap();
    table.release_value(removed.value);
    assert_eq!(table.pmem_bytes(), 0);
    assert_eq!(table.dram_bytes(), 0);

    table.insert_if_absent(Bytes::from_static(b"k"), loc(64), value(b"v", Tier::Pmem, 128));
    table.clear();
    assert_eq!(table.pmem_bytes(), 0);
}

#[test]
fn test_replacement_moves_charge() {
    let table = MemTable::new();
    table.insert_if_absent(Bytes::from_static(b"key"), loc(64), value(b"0123456789", Tier::Dram, 128));

    let previous = table.set_value(b"key", value(b"xy", Tier::Dram, 256)).unwrap();
    // Both values are charged until the old one is released
    assert_eq!(table.dram_bytes(), 3 + 10 + 2);

    table.release_value(previous);
    assert_eq!(table.dram_bytes(), 3 + 2);
}

#[test]
fn test_release_never_underflows() {
    let table = MemTable::new();
    table.release_value(value(b"never-charged", Tier::Dram, 64));
    assert_eq!(table.dram_bytes(), 0);
}

// =============================================================================
// String Object Tests
// =============================================================================

#[test]
fn test_integer_detection() {
    assert_eq!(StrObject::encode(Bytes::from_static(b"12345"), Tier::Dram).encoding(), Encoding::Int(12345));
    assert_eq!(StrObject::encode(Bytes::from_static(b"-7"), Tier::Dram).encoding(), Encoding::Int(-7));
    assert_eq!(
        StrObject::encode(Bytes::from_static(b"-9223372036854775808"), Tier::Dram).encoding(),
        Encoding::Int(i64::MIN)
    );
}

#[test]
fn test_non_canonical_numbers_stay_raw() {
    for text in [&b"007"[..], b"+7", b" 7", b"7 ", b"", b"9223372036854775808", b"1e3"] {
        let object = StrObject::encode(Bytes::copy_from_slice(text), Tier::Dram);
        assert_eq!(object.encoding(), Encoding::Raw, "{:?}", text);
    }
}

#[test]
fn test_from_int_renders_decimal() {
    let object = StrObject::from_int(-42, Tier::Pmem);
    assert_eq!(object.bytes(), &Bytes::from_static(b"-42"));
    assert_eq!(object.encoding(), Encoding::Int(-42));
    assert_eq!(object.tier(), Tier::Pmem);
    assert_eq!(object.dram_charge(), 0);
    assert_eq!(object.pmem_charge(), 3);
}

#[test]
fn test_raw_skips_detection() {
    let object = StrObject::raw(Bytes::from_static(b"123"), Tier::Dram);
    assert_eq!(object.encoding(), Encoding::Raw);
    assert_eq!(object.len(), 3);
    assert!(!object.is_empty());
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_readers() {
    let table = Arc::new(MemTable::new());
    for i in 0..100u64 {
        table.insert_if_absent(
            Bytes::from(format!("key{}", i)),
            loc(64 * (i + 1)),
            value(b"v", Tier::Dram, 8192 + i),
        );
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..100u64 {
                    let entry = table.find(format!("key{}", i).as_bytes()).unwrap();
                    assert_eq!(entry.entry, loc(64 * (i + 1)));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
