//! Persistent Entry List
//!
//! Doubly linked list of every live key/value entry, anchored at the pool
//! root. Recovery rebuilds the in-memory table by walking it.
//!
//! ## Shape
//! ```text
//!  ListRoot { head, count }
//!     │
//!     ▼
//!  KvEntry ◄──► KvEntry ◄──► KvEntry ──► null
//!  prev=null
//! ```
//!
//! New entries are pushed at the head. Every link update registers the field
//! it touches before writing it, so an interrupted transaction leaves the
//! previous chain intact after undo replay.

use crate::error::{Result, TierError};

use super::string::PmemString;
use super::tx::Transaction;
use super::{Field, Locator, PmemCodec, Pool, TypeTag};

// =============================================================================
// Record Layouts
// =============================================================================

/// Persistent key/value entry (64 bytes)
pub struct KvEntry;

impl KvEntry {
    pub const KEY: Field<Locator> = Field::at(0);
    pub const VALUE: Field<Locator> = Field::at(16);
    pub const NEXT: Field<Locator> = Field::at(32);
    pub const PREV: Field<Locator> = Field::at(48);

    pub const SIZE: usize = 64;
}

/// List anchor stored in the pool root (24 bytes)
pub struct ListRoot;

impl ListRoot {
    pub const HEAD: Field<Locator> = Field::at(0);
    pub const COUNT: Field<u64> = Field::at(16);

    pub const SIZE: usize = 24;
}

/// Decoded copy of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub key: Locator,
    pub value: Locator,
    pub next: Locator,
    pub prev: Locator,
}

/// Result of a full list verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListReport {
    /// Count stored in the root
    pub count: u64,

    /// Entries reached by following forward links
    pub reachable: u64,
}

// =============================================================================
// Linking
// =============================================================================

/// Push a new entry referencing `key` and `value` at the head of the list
///
/// Both strings get their back-reference stamped with the new entry.
pub fn link(tx: &mut Transaction<'_>, root: Locator, key: Locator, value: Locator) -> Result<Locator> {
    let head = tx.get(root, ListRoot::HEAD)?;

    let logged = tx.zalloc(KvEntry::SIZE, TypeTag::KeyValuePair)?;
    let entry = logged.locator();

    // Fresh allocation: covered by the undo log already
    tx.set(entry, KvEntry::KEY, &key)?;
    tx.set(entry, KvEntry::VALUE, &value)?;
    tx.set(entry, KvEntry::NEXT, &head)?;
    tx.set(entry, KvEntry::PREV, &Locator::NULL)?;

    if !head.is_null() {
        tx.set(head, KvEntry::PREV, &entry)?;
    }

    PmemString::set_backref(tx, key, entry)?;
    PmemString::set_backref(tx, value, entry)?;

    let count = tx.get(root, ListRoot::COUNT)?;
    let root_range = tx.add_range(root, 0, ListRoot::SIZE)?;
    let mut buf = [0u8; ListRoot::SIZE];
    encode_root(&entry, count + 1, &mut buf);
    tx.write(&root_range, 0, &buf)?;

    tracing::trace!("Linked entry {} (count {})", entry, count + 1);
    Ok(entry)
}

/// Remove `entry` from the list and free it together with its strings
pub fn unlink(tx: &mut Transaction<'_>, root: Locator, entry: Locator) -> Result<()> {
    let snapshot = read_entry(tx.pool(), entry)?;

    if snapshot.prev.is_null() {
        if tx.get(root, ListRoot::HEAD)? != entry {
            return Err(TierError::ListCorruption(format!(
                "entry {} has no predecessor but is not the head",
                entry
            )));
        }
        tx.set(root, ListRoot::HEAD, &snapshot.next)?;
    } else {
        tx.set(snapshot.prev, KvEntry::NEXT, &snapshot.next)?;
    }

    if !snapshot.next.is_null() {
        tx.set(snapshot.next, KvEntry::PREV, &snapshot.prev)?;
    }

    let count = tx.get(root, ListRoot::COUNT)?;
    if count == 0 {
        return Err(TierError::ListCorruption(
            "unlink from a list whose count is zero".to_string(),
        ));
    }
    tx.set(root, ListRoot::COUNT, &(count - 1))?;

    if !snapshot.key.is_null() {
        tx.free(snapshot.key)?;
    }
    if !snapshot.value.is_null() {
        tx.free(snapshot.value)?;
    }
    tx.free(entry)?;

    tracing::trace!("Unlinked entry {} (count {})", entry, count - 1);
    Ok(())
}

fn encode_root(head: &Locator, count: u64, out: &mut [u8]) {
    head.encode(&mut out[ListRoot::HEAD.offset()..]);
    count.encode(&mut out[ListRoot::COUNT.offset()..]);
}

// =============================================================================
// Reading
// =============================================================================

/// Decode the entry at `loc`
pub fn read_entry(pool: &Pool, loc: Locator) -> Result<EntrySnapshot> {
    if pool.type_of(loc)? != TypeTag::KeyValuePair {
        return Err(TierError::ListCorruption(format!("{} is not a list entry", loc)));
    }

    Ok(EntrySnapshot {
        key: pool.get(loc, KvEntry::KEY)?,
        value: pool.get(loc, KvEntry::VALUE)?,
        next: pool.get(loc, KvEntry::NEXT)?,
        prev: pool.get(loc, KvEntry::PREV)?,
    })
}

/// Number of entries recorded in the root
pub fn count(pool: &Pool, root: Locator) -> Result<u64> {
    pool.get(root, ListRoot::COUNT)
}

/// Iterate entries from the head following forward links
pub fn walk(pool: &Pool, root: Locator) -> Result<Walk<'_>> {
    let head = pool.get(root, ListRoot::HEAD)?;
    Ok(Walk {
        pool,
        next: head,
        remaining: pool.allocation_count(),
    })
}

/// Iterator returned by [`walk`]
///
/// A list can never hold more entries than the pool has allocations, so the
/// walk stops with an error instead of spinning on a cycle.
pub struct Walk<'a> {
    pool: &'a Pool,
    next: Locator,
    remaining: usize,
}

impl Iterator for Walk<'_> {
    type Item = Result<(Locator, EntrySnapshot)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        if self.remaining == 0 {
            let at = self.next;
            self.next = Locator::NULL;
            return Some(Err(TierError::ListCorruption(format!(
                "cycle detected at entry {}",
                at
            ))));
        }
        self.remaining -= 1;

        let loc = self.next;
        match read_entry(self.pool, loc) {
            Ok(entry) => {
                self.next = entry.next;
                Some(Ok((loc, entry)))
            }
            Err(e) => {
                self.next = Locator::NULL;
                Some(Err(e))
            }
        }
    }
}

/// Check every structural invariant of the list
///
/// - the head has no predecessor
/// - `prev(next(x)) == x` for every entry
/// - the key and value strings point back at their entry
/// - the root count equals the number of reachable entries
pub fn verify(pool: &Pool, root: Locator) -> Result<ListReport> {
    let stored = count(pool, root)?;
    let mut reachable = 0u64;
    let mut expected_prev = Locator::NULL;

    for item in walk(pool, root)? {
        let (loc, entry) = item?;

        if entry.prev != expected_prev {
            return Err(TierError::ListCorruption(format!(
                "entry {} links back to {}, expected {}",
                loc, entry.prev, expected_prev
            )));
        }
        if entry.key.is_null() || entry.value.is_null() {
            return Err(TierError::ListCorruption(format!(
                "entry {} is missing its key or value",
                loc
            )));
        }
        for (what, string) in [("key", entry.key), ("value", entry.value)] {
            let owner = PmemString::backref(pool, string)?;
            if owner != loc {
                return Err(TierError::ListCorruption(format!(
                    "{} of entry {} is owned by {}",
                    what, loc, owner
                )));
            }
        }

        reachable += 1;
        expected_prev = loc;
    }

    if reachable != stored {
        return Err(TierError::ListCorruption(format!(
            "root count is {} but {} entries are reachable",
            stored, reachable
        )));
    }

    Ok(ListReport { count: stored, reachable })
}
