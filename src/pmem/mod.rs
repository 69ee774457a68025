//! Persistent Memory Module
//!
//! Crash-consistent storage for the durable twin of every key/value pair.
//!
//! ## Responsibilities
//! - Transactional pool with undo logging (`Pool`, `Transaction`)
//! - Length-prefixed persistent strings (`PmemString`)
//! - Root-anchored doubly linked list of entries (`list`)
//!
//! ## Locators
//! Persistent objects are never addressed by raw pointers. A [`Locator`] is a
//! pool-relative handle; translating it to a process address goes through
//! [`Pool::direct`] and back through [`Pool::locator_of`].
//!
//! ## Write discipline
//! ```text
//!   tx.add_range(..) ──► Logged ──► tx.write(&Logged, ..)
//!   tx.zalloc(..)    ──► Logged ──► tx.write(&Logged, ..)
//! ```
//! The only raw write path takes a `Logged` token, and tokens are handed out
//! only after the bytes they cover were snapshotted into the undo log (or
//! freshly allocated in the same transaction).

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

mod pool;
mod tx;
mod string;
pub mod list;

pub use pool::{Pool, RecoveryReport, HEAP_START};
pub use tx::{Logged, Transaction};
pub use string::{PmemString, SdsType, BACKREF_SIZE};
pub use list::{KvEntry, ListReport, ListRoot};

/// Pool-relative handle to a persistent object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Locator {
    /// Identifier of the pool the object lives in
    pub pool_id: u64,
    /// Byte offset from the start of the pool (0 = null)
    pub offset: u64,
}

impl Locator {
    /// The null locator
    pub const NULL: Locator = Locator { pool_id: 0, offset: 0 };

    /// Encoded size of a locator inside a persistent record
    pub const SIZE: usize = 16;

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{:x}:{:#x}", self.pool_id, self.offset)
        }
    }
}

/// Type tag recorded with every allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    /// The pool's root object
    Root,
    /// A persistent string (key or value bytes)
    Sds,
    /// A persistent key/value entry
    KeyValuePair,
    /// Anything else
    Raw,
}

// =============================================================================
// Typed Fields
// =============================================================================

/// Value with a fixed little-endian encoding inside a persistent record
pub trait PmemCodec: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn encode(&self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Self;
}

impl PmemCodec for u64 {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(buf)
    }
}

impl PmemCodec for Locator {
    const SIZE: usize = Locator::SIZE;

    fn encode(&self, out: &mut [u8]) {
        self.pool_id.encode(&mut out[..8]);
        self.offset.encode(&mut out[8..16]);
    }

    fn decode(bytes: &[u8]) -> Self {
        let pool_id = u64::decode(&bytes[..8]);
        let offset = u64::decode(&bytes[8..16]);
        if offset == 0 {
            return Locator::NULL;
        }
        Locator { pool_id, offset }
    }
}

/// A field of type `T` at a fixed offset within a persistent record
#[derive(Debug)]
pub struct Field<T> {
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T: PmemCodec> Field<T> {
    pub const fn at(offset: usize) -> Self {
        Self { offset, _marker: PhantomData }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        T::SIZE
    }
}
