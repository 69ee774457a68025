//! Pool Transactions
//!
//! Undo-logged mutation of persistent objects.
//!
//! ## Rules
//! - Every range is snapshotted (`add_range`/`add_field`) before its first
//!   write; the snapshot call hands out the `Logged` token `write` requires.
//! - Fresh allocations are covered by construction: rollback releases them.
//! - Frees are deferred until commit and forgotten on abort.
//! - Dropping an unfinished transaction aborts it, unless the pool crashed,
//!   in which case the undo log stays behind for `Pool::recover`.

use crate::error::{Result, TierError};

use super::pool::{Pool, UndoRecord};
use super::{Field, Locator, PmemCodec, TypeTag};

/// Write permission for a range registered in a specific transaction
#[derive(Debug)]
pub struct Logged {
    tx_id: u64,
    object: Locator,
    start: usize,
    len: usize,
}

impl Logged {
    /// Object the range belongs to
    pub fn locator(&self) -> Locator {
        self.object
    }

    /// Offset of the range within its object
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An open transaction on a `Pool`
pub struct Transaction<'p> {
    pool: &'p mut Pool,
    id: u64,

    /// Heap ranges `[start, end)` already covered by the undo log
    covered: Vec<(u64, u64)>,

    /// Blocks to release on commit
    frees: Vec<u64>,

    finished: bool,
}

impl<'p> Transaction<'p> {
    pub(super) fn new(pool: &'p mut Pool, id: u64) -> Self {
        tracing::trace!("Transaction {} started", id);
        Self {
            pool,
            id,
            covered: Vec::new(),
            frees: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read-only view of the pool
    pub fn pool(&self) -> &Pool {
        &*self.pool
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a zero-filled object; the whole object is writable
    pub fn zalloc(&mut self, size: usize, tag: TypeTag) -> Result<Logged> {
        self.pool.step()?;

        let offset = self.pool.allocate(size, tag)?;
        self.pool.push_undo(UndoRecord::Alloc { offset })?;
        self.covered.push((offset, offset + size as u64));

        let object = self.pool.locator(offset);
        tracing::trace!("tx {}: zalloc {} bytes ({:?}) at {}", self.id, size, tag, object);

        Ok(Logged { tx_id: self.id, object, start: 0, len: size })
    }

    /// Release an object when the transaction commits
    pub fn free(&mut self, loc: Locator) -> Result<()> {
        let offset = self.pool.validate(loc)?;
        if self.frees.contains(&offset) {
            return Err(TierError::TransactionState(format!(
                "object {} freed twice in transaction {}",
                loc, self.id
            )));
        }

        self.pool.step()?;
        self.frees.push(offset);
        Ok(())
    }

    // =========================================================================
    // Undo Registration
    // =========================================================================

    /// Register `[start, start + len)` of `loc` for undo logging
    pub fn add_range(&mut self, loc: Locator, start: usize, len: usize) -> Result<Logged> {
        let offset = self.pool.check(loc, start, len)? as u64;
        let end = offset + len as u64;

        let already = self
            .covered
            .iter()
            .any(|&(lo, hi)| lo <= offset && end <= hi);

        if !already {
            self.pool.step()?;
            let before = self.pool.read(loc, start, len)?.to_vec();
            self.pool.push_undo(UndoRecord::Range { offset, before })?;
            self.covered.push((offset, end));
        }

        Ok(Logged { tx_id: self.id, object: loc, start, len })
    }

    /// Register a typed field of `loc` for undo logging
    pub fn add_field<T: PmemCodec>(&mut self, loc: Locator, field: Field<T>) -> Result<Logged> {
        self.add_range(loc, field.offset(), T::SIZE)
    }

    // =========================================================================
    // Writes & Reads
    // =========================================================================

    /// Write `bytes` at `offset` within a logged range
    pub fn write(&mut self, logged: &Logged, offset: usize, bytes: &[u8]) -> Result<()> {
        if logged.tx_id != self.id {
            return Err(TierError::TransactionState(format!(
                "range logged by transaction {} used in transaction {}",
                logged.tx_id, self.id
            )));
        }
        if offset.checked_add(bytes.len()).map_or(true, |end| end > logged.len) {
            return Err(TierError::OutOfRange {
                offset,
                len: bytes.len(),
                range: logged.len,
            });
        }

        let start = self.pool.check(logged.object, logged.start + offset, bytes.len())?;
        self.pool.step()?;
        self.pool.heap_mut()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Register and write a typed field
    pub fn set<T: PmemCodec>(&mut self, loc: Locator, field: Field<T>, value: &T) -> Result<()> {
        let logged = self.add_field(loc, field)?;
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        tracing::trace!("tx {}: set {}+{}", self.id, loc, field.offset());
        self.write(&logged, 0, &buf)
    }

    pub fn get<T: PmemCodec>(&self, loc: Locator, field: Field<T>) -> Result<T> {
        self.pool.get(loc, field)
    }

    pub fn read(&self, loc: Locator, start: usize, len: usize) -> Result<&[u8]> {
        self.pool.read(loc, start, len)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Make every write of this transaction permanent
    pub fn commit(mut self) -> Result<()> {
        self.pool.step()?;

        for offset in std::mem::take(&mut self.frees) {
            self.pool.release(offset)?;
        }
        self.pool.discard_undo();
        self.finished = true;

        tracing::debug!("Transaction {} committed", self.id);
        Ok(())
    }

    /// Roll back every write of this transaction
    pub fn abort(mut self) -> Result<()> {
        if self.pool.is_crashed() {
            return Err(TierError::Crashed);
        }

        self.finished = true;
        self.pool.rollback()?;
        tracing::debug!("Transaction {} aborted", self.id);
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished || self.pool.is_crashed() {
            return;
        }
        if let Err(e) = self.pool.rollback() {
            tracing::error!("Rollback of transaction {} failed: {}", self.id, e);
        }
    }
}
