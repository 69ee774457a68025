//! MemTable implementation
//!
//! HashMap-based table with RwLock for concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::pmem::Locator;

use super::{KeyTable, StoredValue, TableEntry};

#[derive(Debug, Clone)]
struct Slot {
    entry: Locator,
    value: StoredValue,
}

/// In-memory key space
///
/// ## Concurrency:
/// - `data`: Protected by RwLock (many concurrent readers, exclusive writer)
/// - `dram_bytes`, `pmem_bytes`: Atomic counters read by the tiering controller
pub struct MemTable {
    data: RwLock<HashMap<Bytes, Slot>>,

    /// Key bytes plus payload bytes of DRAM-routed values
    dram_bytes: AtomicUsize,

    /// Payload bytes of PMEM-routed values
    pmem_bytes: AtomicUsize,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            dram_bytes: AtomicUsize::new(0),
            pmem_bytes: AtomicUsize::new(0),
        }
    }

    /// Number of keys
    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Bytes currently charged to DRAM
    pub fn dram_bytes(&self) -> usize {
        self.dram_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently charged to PMEM
    pub fn pmem_bytes(&self) -> usize {
        self.pmem_bytes.load(Ordering::Relaxed)
    }

    /// All keys, in no particular order
    pub fn keys(&self) -> Vec<Bytes> {
        self.data.read().keys().cloned().collect()
    }

    /// Drop every key (used before rebuilding from the persistent list)
    pub fn clear(&self) {
        let mut data = self.data.write();
        data.clear();
        self.dram_bytes.store(0, Ordering::Relaxed);
        self.pmem_bytes.store(0, Ordering::Relaxed);
    }

    fn charge(&self, dram: usize, pmem: usize) {
        self.dram_bytes.fetch_add(dram, Ordering::Relaxed);
        self.pmem_bytes.fetch_add(pmem, Ordering::Relaxed);
    }

    fn discharge(&self, dram: usize, pmem: usize) {
        // Saturating: a discharge can never take a counter below zero
        for (counter, bytes) in [(&self.dram_bytes, dram), (&self.pmem_bytes, pmem)] {
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
        }
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyTable for MemTable {
    fn lookup(&self, key: &[u8]) -> Option<TableEntry> {
        self.find(key)
    }

    fn insert_if_absent(&self, key: Bytes, entry: Locator, value: StoredValue) -> bool {
        let mut data = self.data.write();
        if data.contains_key(&key) {
            return false;
        }

        self.charge(
            key.len() + value.object.dram_charge(),
            value.object.pmem_charge(),
        );
        data.insert(key, Slot { entry, value });
        true
    }

    fn find(&self, key: &[u8]) -> Option<TableEntry> {
        let data = self.data.read();
        data.get_key_value(key).map(|(k, slot)| TableEntry {
            key: k.clone(),
            entry: slot.entry,
            value: slot.value.clone(),
        })
    }

    fn set_value(&self, key: &[u8], value: StoredValue) -> Option<StoredValue> {
        let mut data = self.data.write();
        let slot = data.get_mut(key)?;

        self.charge(value.object.dram_charge(), value.object.pmem_charge());
        Some(std::mem::replace(&mut slot.value, value))
    }

    fn release_value(&self, value: StoredValue) {
        self.discharge(value.object.dram_charge(), value.object.pmem_charge());
        drop(value);
    }

    fn remove(&self, key: &[u8]) -> Option<TableEntry> {
        let mut data = self.data.write();
        let (key, slot) = data.remove_entry(key)?;

        self.discharge(key.len(), 0);
        Some(TableEntry {
            key,
            entry: slot.entry,
            value: slot.value,
        })
    }
}
