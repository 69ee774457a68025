//! Persistent Pool
//!
//! In-process model of a transactional, crash-consistent memory pool.
//!
//! ## Responsibilities
//! - Zero-initialised allocation and release (first-fit, coalescing)
//! - Root object management
//! - Undo log storage and recovery replay
//! - Locator ↔ address translation
//! - Optional image file with CRC32 integrity check
//! - Crash injection for atomicity testing
//!
//! ## Image File Format
//! ```text
//! ┌───────────┬─────────────┬─────────┬─────────┬──────────────────┐
//! │ Magic (8) │ Version (4) │ CRC (4) │ Len (8) │ bincode payload  │
//! └───────────┴─────────────┴─────────┴─────────┴──────────────────┘
//! ```
//!
//! The heap, the allocation table and the undo log are all part of the
//! persisted state: a simulated crash loses only what lives outside `Pool`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TierError};

use super::tx::Transaction;
use super::{Field, Locator, PmemCodec, TypeTag};

/// First usable heap offset. Everything below is reserved so that offset 0
/// can act as the null locator.
pub const HEAP_START: u64 = 64;

/// Allocation granularity (every block starts 8-byte aligned)
const ALIGN: u64 = 8;

const POOL_MAGIC: &[u8; 8] = b"TIERKVPL";
const POOL_VERSION: u32 = 1;
const IMAGE_HEADER_SIZE: usize = 24;

/// Allocation table entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(super) struct Block {
    /// Requested size
    pub(super) size: u64,
    /// Reserved size (size rounded up to ALIGN)
    pub(super) span: u64,
    pub(super) tag: TypeTag,
}

/// One undo log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) enum UndoRecord {
    /// Bytes snapshotted before the first write to a registered range
    Range { offset: u64, before: Vec<u8> },
    /// Block allocated by the running transaction
    Alloc { offset: u64 },
}

/// Everything that survives a crash
#[derive(Debug, Serialize, Deserialize)]
struct PoolState {
    id: u64,
    heap: Vec<u8>,
    blocks: BTreeMap<u64, Block>,
    free: BTreeMap<u64, u64>,
    root: u64,
    used: u64,
    /// Some(..) while a transaction is open (or was open when we crashed)
    undo: Option<Vec<UndoRecord>>,
}

/// Outcome of an undo log replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Whether an interrupted transaction was found
    pub rolled_back: bool,

    /// Number of registered ranges restored to their snapshot
    pub ranges_restored: usize,

    /// Number of transactional allocations released
    pub allocations_released: usize,
}

/// Transactional persistent memory pool
pub struct Pool {
    state: PoolState,

    /// Image file, if the pool is file-backed
    path: Option<PathBuf>,

    /// Remaining mutations before a simulated crash
    failpoint: Option<usize>,

    /// Set once a simulated crash fired; cleared by `recover`
    crashed: bool,
}

/// Transaction ids are unique across all pool instances in the process
static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

impl Pool {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a pool that lives only in this process
    pub fn volatile(size: usize) -> Result<Self> {
        let state = PoolState::new(size)?;
        tracing::debug!("Created volatile pool {:x} ({} bytes)", state.id, size);
        Ok(Self::from_state(state, None))
    }

    /// Create a new file-backed pool. Fails if the file already exists.
    pub fn create(path: &Path, size: usize) -> Result<Self> {
        let state = PoolState::new(size)?;
        let pool = Self::from_state(state, Some(path.to_path_buf()));

        // create_new: never clobber an existing pool image
        OpenOptions::new().write(true).create_new(true).open(path)?;
        pool.sync()?;

        tracing::info!("Created pool {:x} at {} ({} bytes)", pool.id(), path.display(), size);
        Ok(pool)
    }

    /// Open an existing pool image, replaying any interrupted transaction
    pub fn open(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let state = decode_image(&bytes)?;
        let mut pool = Self::from_state(state, Some(path.to_path_buf()));

        if pool.state.undo.is_some() {
            let report = pool.recover()?;
            tracing::warn!(
                "Pool {} had an interrupted transaction: {} ranges restored, {} allocations released",
                path.display(),
                report.ranges_restored,
                report.allocations_released
            );
            pool.sync()?;
        }

        tracing::info!(
            "Opened pool {:x} at {} ({} of {} bytes used)",
            pool.id(),
            path.display(),
            pool.used_bytes(),
            pool.capacity()
        );
        Ok(pool)
    }

    /// Write the pool image to its file (no-op for volatile pools)
    ///
    /// The image is written to a sibling temp file and renamed into place.
    pub fn sync(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let payload = bincode::serialize(&self.state)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let tmp_path = image_tmp_path(path);
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(POOL_MAGIC)?;
            file.write_all(&POOL_VERSION.to_le_bytes())?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&(payload.len() as u64).to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    fn from_state(state: PoolState, path: Option<PathBuf>) -> Self {
        Self {
            state,
            path,
            failpoint: None,
            crashed: false,
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a transaction
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        if self.crashed {
            return Err(TierError::Crashed);
        }
        if self.state.undo.is_some() {
            return Err(TierError::RecoveryRequired);
        }

        self.state.undo = Some(Vec::new());
        let id = NEXT_TX_ID.fetch_add(1, Ordering::Relaxed);

        Ok(Transaction::new(self, id))
    }

    /// Run `body` inside a transaction
    ///
    /// Commits when the body returns `Ok`; otherwise the transaction is rolled
    /// back and the body's error is returned unchanged.
    pub fn transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut tx = self.begin()?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!("Transaction {} aborted: {}", tx.id(), e);
                // Drop rolls back (or, after a crash, leaves the log for recovery)
                drop(tx);
                Err(e)
            }
        }
    }

    /// Replay the undo log of an interrupted transaction
    ///
    /// Restores every registered range to its snapshot and releases blocks
    /// allocated by that transaction, newest first.
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        self.crashed = false;
        self.failpoint = None;

        let report = self.rollback()?;
        if report.rolled_back {
            tracing::warn!(
                "Recovered pool {:x}: {} ranges restored, {} allocations released",
                self.id(),
                report.ranges_restored,
                report.allocations_released
            );
        }
        Ok(report)
    }

    pub(super) fn rollback(&mut self) -> Result<RecoveryReport> {
        let Some(records) = self.state.undo.take() else {
            return Ok(RecoveryReport::default());
        };

        let mut report = RecoveryReport { rolled_back: true, ..Default::default() };
        for record in records.into_iter().rev() {
            match record {
                UndoRecord::Range { offset, before } => {
                    let start = offset as usize;
                    self.state.heap[start..start + before.len()].copy_from_slice(&before);
                    report.ranges_restored += 1;
                }
                UndoRecord::Alloc { offset } => {
                    self.release(offset)?;
                    report.allocations_released += 1;
                }
            }
        }
        Ok(report)
    }

    // =========================================================================
    // Crash Injection
    // =========================================================================

    /// Simulate power loss on the `n`-th next persistent mutation
    ///
    /// `n` mutations succeed; the one after fails with `Crashed` and the pool
    /// refuses further mutations until `recover` runs.
    pub fn inject_crash_after(&mut self, n: usize) {
        self.failpoint = Some(n);
    }

    /// Remove a pending failpoint
    pub fn clear_failpoint(&mut self) {
        self.failpoint = None;
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// Whether an undo log is present (a transaction is open or was interrupted)
    pub fn has_pending_undo(&self) -> bool {
        self.state.undo.is_some()
    }

    /// Account for one persistent mutation, firing the failpoint if armed
    pub(super) fn step(&mut self) -> Result<()> {
        if self.crashed {
            return Err(TierError::Crashed);
        }
        if let Some(remaining) = self.failpoint {
            if remaining == 0 {
                self.crashed = true;
                self.failpoint = None;
                tracing::warn!("Injected crash in pool {:x}", self.state.id);
                return Err(TierError::Crashed);
            }
            self.failpoint = Some(remaining - 1);
        }
        Ok(())
    }

    // =========================================================================
    // Root Object
    // =========================================================================

    /// Locator of the root object, allocating it zero-filled on first use
    pub fn root(&mut self, size: usize) -> Result<Locator> {
        if self.state.root != 0 {
            let block = self.block(self.state.root)?;
            if (block.size as usize) < size {
                return Err(TierError::PoolCorruption(format!(
                    "root object is {} bytes, expected at least {}",
                    block.size, size
                )));
            }
            return Ok(self.locator(self.state.root));
        }

        self.step()?;
        let offset = self.allocate(size, TypeTag::Root)?;
        self.state.root = offset;
        self.sync()?;

        Ok(self.locator(offset))
    }

    // =========================================================================
    // Reads & Translation
    // =========================================================================

    /// Read `len` bytes at `start` within the object `loc`
    pub fn read(&self, loc: Locator, start: usize, len: usize) -> Result<&[u8]> {
        let offset = self.check(loc, start, len)?;
        Ok(&self.state.heap[offset..offset + len])
    }

    /// Read a typed field of the object `loc`
    pub fn get<T: PmemCodec>(&self, loc: Locator, field: Field<T>) -> Result<T> {
        let bytes = self.read(loc, field.offset(), T::SIZE)?;
        Ok(T::decode(bytes))
    }

    /// Requested size of the object `loc`
    pub fn usable_size(&self, loc: Locator) -> Result<usize> {
        let offset = self.validate(loc)?;
        Ok(self.block(offset)?.size as usize)
    }

    /// Type tag the object `loc` was allocated with
    pub fn type_of(&self, loc: Locator) -> Result<TypeTag> {
        let offset = self.validate(loc)?;
        Ok(self.block(offset)?.tag)
    }

    /// Process address of the object `loc` (valid while the pool is open)
    pub fn direct(&self, loc: Locator) -> Result<usize> {
        let offset = self.validate(loc)?;
        Ok(self.state.heap.as_ptr() as usize + offset as usize)
    }

    /// Locator of the object starting at process address `addr`
    pub fn locator_of(&self, addr: usize) -> Result<Locator> {
        let base = self.state.heap.as_ptr() as usize;
        if addr < base + HEAP_START as usize || addr >= base + self.state.heap.len() {
            return Err(TierError::InvalidLocator(format!(
                "address {:#x} is outside pool {:x}",
                addr, self.state.id
            )));
        }

        let offset = (addr - base) as u64;
        self.block(offset)?;
        Ok(self.locator(offset))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn capacity(&self) -> usize {
        self.state.heap.len()
    }

    /// Bytes currently reserved by live allocations
    pub fn used_bytes(&self) -> usize {
        self.state.used as usize
    }

    /// Number of live allocations (root included)
    pub fn allocation_count(&self) -> usize {
        self.state.blocks.len()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // =========================================================================
    // Allocator Internals (used by Transaction)
    // =========================================================================

    pub(super) fn locator(&self, offset: u64) -> Locator {
        Locator { pool_id: self.state.id, offset }
    }

    pub(super) fn push_undo(&mut self, record: UndoRecord) -> Result<()> {
        match self.state.undo.as_mut() {
            Some(log) => {
                log.push(record);
                Ok(())
            }
            None => Err(TierError::TransactionState(
                "no transaction is open".to_string(),
            )),
        }
    }

    /// Drop the undo log of a committed transaction
    pub(super) fn discard_undo(&mut self) {
        self.state.undo = None;
    }

    pub(super) fn heap_mut(&mut self) -> &mut [u8] {
        &mut self.state.heap
    }

    /// Validate that `loc` names a live block of this pool
    pub(super) fn validate(&self, loc: Locator) -> Result<u64> {
        if loc.is_null() {
            return Err(TierError::InvalidLocator("null locator".to_string()));
        }
        if loc.pool_id != self.state.id {
            return Err(TierError::InvalidLocator(format!(
                "locator {} belongs to another pool (this is {:x})",
                loc, self.state.id
            )));
        }
        self.block(loc.offset)?;
        Ok(loc.offset)
    }

    /// Validate `[start, start + len)` within `loc`, returning the heap offset
    pub(super) fn check(&self, loc: Locator, start: usize, len: usize) -> Result<usize> {
        let offset = self.validate(loc)?;
        let block = self.block(offset)?;
        let Some(end) = start.checked_add(len) else {
            return Err(TierError::OutOfRange {
                offset: start,
                len,
                range: block.size as usize,
            });
        };
        if end > block.size as usize {
            return Err(TierError::InvalidLocator(format!(
                "range +{}..+{} exceeds object {} of {} bytes",
                start,
                end,
                loc,
                block.size
            )));
        }
        Ok(offset as usize + start)
    }

    pub(super) fn block(&self, offset: u64) -> Result<Block> {
        self.state.blocks.get(&offset).copied().ok_or_else(|| {
            TierError::InvalidLocator(format!("no live object at offset {:#x}", offset))
        })
    }

    /// First-fit allocation of a zero-filled block
    pub(super) fn allocate(&mut self, size: usize, tag: TypeTag) -> Result<u64> {
        let span = align_up(size.max(1) as u64);

        let found = self
            .state
            .free
            .iter()
            .find(|(_, len)| **len >= span)
            .map(|(&offset, &len)| (offset, len));

        let Some((offset, len)) = found else {
            return Err(TierError::OutOfMemory {
                requested: size,
                available: self.state.free.values().sum::<u64>() as usize,
            });
        };

        self.state.free.remove(&offset);
        if len > span {
            self.state.free.insert(offset + span, len - span);
        }

        let start = offset as usize;
        self.state.heap[start..start + span as usize].fill(0);
        self.state.blocks.insert(offset, Block { size: size as u64, span, tag });
        self.state.used += span;

        Ok(offset)
    }

    /// Return a block to the free map, merging with adjacent free ranges
    pub(super) fn release(&mut self, offset: u64) -> Result<()> {
        let block = self.state.blocks.remove(&offset).ok_or_else(|| {
            TierError::InvalidLocator(format!("double free at offset {:#x}", offset))
        })?;
        self.state.used -= block.span;

        let mut start = offset;
        let mut len = block.span;

        let prev = self
            .state
            .free
            .range(..offset)
            .next_back()
            .map(|(&o, &l)| (o, l));
        if let Some((prev_offset, prev_len)) = prev {
            if prev_offset + prev_len == offset {
                self.state.free.remove(&prev_offset);
                start = prev_offset;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.state.free.remove(&(offset + block.span)) {
            len += next_len;
        }

        self.state.free.insert(start, len);
        Ok(())
    }
}

impl PoolState {
    fn new(size: usize) -> Result<Self> {
        if (size as u64) <= HEAP_START + ALIGN {
            return Err(TierError::Config(format!(
                "pool size {} is too small (minimum {})",
                size,
                HEAP_START + ALIGN + 1
            )));
        }

        let mut free = BTreeMap::new();
        free.insert(HEAP_START, size as u64 - HEAP_START);

        Ok(Self {
            id: new_pool_id(),
            heap: vec![0u8; size],
            blocks: BTreeMap::new(),
            free,
            root: 0,
            used: 0,
            undo: None,
        })
    }
}

/// Sibling temp file used while writing an image: `<pool file>.tmp`
fn image_tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn align_up(size: u64) -> u64 {
    size.saturating_add(ALIGN - 1) / ALIGN * ALIGN
}

/// Pool identifier derived from the creation time (never zero)
fn new_pool_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    (u64::from(hasher.finalize()) << 32) | (nanos & 0xFFFF_FFFF) | 1
}

fn decode_image(bytes: &[u8]) -> Result<PoolState> {
    if bytes.len() < IMAGE_HEADER_SIZE {
        return Err(TierError::PoolCorruption(format!(
            "image is {} bytes, shorter than its {} byte header",
            bytes.len(),
            IMAGE_HEADER_SIZE
        )));
    }
    if &bytes[0..8] != POOL_MAGIC {
        return Err(TierError::PoolCorruption("bad magic".to_string()));
    }

    let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if version != POOL_VERSION {
        return Err(TierError::PoolCorruption(format!(
            "unsupported image version {}",
            version
        )));
    }

    let stored_crc = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&bytes[16..24]);
    let len = u64::from_le_bytes(len_buf);

    let payload = usize::try_from(len)
        .ok()
        .and_then(|len| IMAGE_HEADER_SIZE.checked_add(len))
        .and_then(|end| bytes.get(IMAGE_HEADER_SIZE..end))
        .ok_or_else(|| {
            TierError::PoolCorruption(format!("truncated payload: expected {} bytes", len))
        })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();
    if crc != stored_crc {
        return Err(TierError::PoolCorruption(format!(
            "CRC mismatch: stored {:#010x}, computed {:#010x}",
            stored_crc, crc
        )));
    }

    Ok(bincode::deserialize(payload)?)
}
