//! Transactional Upsert
//!
//! Persists "set key to value" events so that the in-memory table and the
//! persistent list always agree.
//!
//! ## State Machine
//! ```text
//!              lookup(key)
//!            ┌─────┴──────┐
//!         absent        present
//!            │             │
//!   ┌────────▼───────┐ ┌───▼──────────────────────────┐
//!   │ TX: dup key    │ │ TX: dup value (unless alias) │
//!   │     dup value  │ │     add+set entry.value      │
//!   │     link entry │ │     free old twin            │
//!   └────────┬───────┘ └───┬──────────────────────────┘
//!            ▼             ▼
//!     insert into      set new value,
//!     table            then release old
//! ```
//!
//! In-memory changes are applied only after the transaction committed, so
//! an aborted or crashed transaction leaves both views untouched.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::memtable::{KeyTable, StoredValue, StrObject, TableEntry};
use crate::pmem::list::{self, KvEntry};
use crate::pmem::{Locator, PmemString, Pool, Transaction};

/// Which path a set took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// A new persistent entry was linked
    Added,
    /// The value of an existing entry was swapped
    Overwritten,
}

/// Persist the payload of a volatile string object
///
/// Integer-encoded objects are stored as their decimal text.
pub fn persist_value(tx: &mut Transaction<'_>, object: &StrObject) -> Result<Locator> {
    PmemString::dup(tx, object.bytes())
}

/// Upsert driver bound to a table and a list root
pub struct Upsert<'a, T: KeyTable> {
    table: &'a T,
    root: Locator,
}

impl<'a, T: KeyTable> Upsert<'a, T> {
    pub fn new(table: &'a T, root: Locator) -> Self {
        Self { table, root }
    }

    /// Set `key` to `value`, creating or updating its persistent entry
    pub fn set(&self, pool: &mut Pool, key: &[u8], value: Arc<StrObject>) -> Result<SetOutcome> {
        // Step 1: Lookup routes between the add and overwrite paths
        match self.table.lookup(key) {
            None => {
                self.add(pool, key, value)?;
                Ok(SetOutcome::Added)
            }
            Some(existing) => {
                self.replace(pool, existing, value)?;
                Ok(SetOutcome::Overwritten)
            }
        }
    }

    /// Add path: persist a brand-new key
    pub fn add(&self, pool: &mut Pool, key: &[u8], value: Arc<StrObject>) -> Result<Locator> {
        let (entry, twin) = pool.transaction(|tx| {
            let key_twin = PmemString::dup(tx, key)?;
            let value_twin = persist_value(tx, &value)?;
            let entry = list::link(tx, self.root, key_twin, value_twin)?;
            Ok((entry, value_twin))
        })?;

        let inserted = self.table.insert_if_absent(
            Bytes::copy_from_slice(key),
            entry,
            StoredValue { object: value, twin },
        );
        assert!(inserted, "add path taken for a key already in the in-memory table");

        tracing::debug!("Added key ({} bytes) as entry {}", key.len(), entry);
        Ok(entry)
    }

    /// Overwrite path for a key that must already be in the table
    ///
    /// # Panics
    /// If the key is missing from the in-memory table: callers only take
    /// this path after a successful lookup.
    pub fn overwrite(&self, pool: &mut Pool, key: &[u8], value: Arc<StrObject>) -> Result<()> {
        let Some(existing) = self.table.find(key) else {
            panic!("overwrite of a key missing from the in-memory table");
        };
        self.replace(pool, existing, value)
    }

    fn replace(&self, pool: &mut Pool, existing: TableEntry, value: Arc<StrObject>) -> Result<()> {
        assert!(
            !existing.entry.is_null(),
            "in-memory key has no back-reference to a persistent entry"
        );

        let entry = existing.entry;
        let old_twin = existing.value.twin;
        let aliased = Arc::ptr_eq(&existing.value.object, &value);

        let new_twin = pool.transaction(|tx| {
            // Reusing the old twin when old and new value are the same object
            // keeps it from being freed underneath the entry.
            let new_twin = if aliased { old_twin } else { persist_value(tx, &value)? };

            tx.set(entry, KvEntry::VALUE, &new_twin)?;

            if new_twin != old_twin {
                PmemString::set_backref(tx, new_twin, entry)?;
                if !old_twin.is_null() {
                    tx.free(old_twin)?;
                }
            }
            Ok(new_twin)
        })?;

        // Set first, release second: the two may be the same object
        let previous = self
            .table
            .set_value(&existing.key, StoredValue { object: value, twin: new_twin });
        if let Some(previous) = previous {
            self.table.release_value(previous);
        }

        tracing::debug!("Overwrote value of entry {} ({} -> {})", entry, old_twin, new_twin);
        Ok(())
    }

    /// Delete path: unlink the key's entry, then drop it from the table
    ///
    /// Returns whether the key existed.
    pub fn delete(&self, pool: &mut Pool, key: &[u8]) -> Result<bool> {
        let Some(existing) = self.table.find(key) else {
            return Ok(false);
        };

        pool.transaction(|tx| list::unlink(tx, self.root, existing.entry))?;

        if let Some(removed) = self.table.remove(key) {
            self.table.release_value(removed.value);
        }

        tracing::debug!("Deleted entry {}", existing.entry);
        Ok(true)
    }
}
