//! MemTable Module
//!
//! The DRAM-resident key space.
//!
//! ## Responsibilities
//! - Fast lookups for the upsert path (add vs overwrite routing)
//! - Hold the back-reference from each key to its persistent entry
//! - Hold the persistent twin locator of each stored value
//! - Track DRAM-charged bytes for the tiering controller
//!
//! ## Data Structure Choice
//! HashMap wrapped in a parking_lot RwLock: the upsert protocol only needs
//! point lookups, and writers are already serialized by the engine.

use std::sync::Arc;

use bytes::Bytes;

use crate::pmem::Locator;
use crate::tiering::Tier;

mod table;

pub use table::MemTable;

/// Longest decimal rendering of an i64 ("-9223372036854775808")
const MAX_INT_LEN: usize = 20;

/// How a string object holds its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Plain bytes
    Raw,
    /// Canonical decimal integer kept as a number
    Int(i64),
}

/// Volatile string object shared by reference counting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrObject {
    bytes: Bytes,
    encoding: Encoding,
    tier: Tier,
}

impl StrObject {
    /// Raw object without integer detection
    pub fn raw(bytes: impl Into<Bytes>, tier: Tier) -> Self {
        Self {
            bytes: bytes.into(),
            encoding: Encoding::Raw,
            tier,
        }
    }

    /// Pick the most compact encoding for `bytes`
    ///
    /// Short payloads that round-trip exactly through `i64` are stored as
    /// integers; everything else stays raw.
    pub fn encode(bytes: impl Into<Bytes>, tier: Tier) -> Self {
        let bytes = bytes.into();

        if bytes.len() <= MAX_INT_LEN {
            if let Some(value) = parse_canonical_i64(&bytes) {
                return Self {
                    bytes,
                    encoding: Encoding::Int(value),
                    tier,
                };
            }
        }

        Self::raw(bytes, tier)
    }

    pub fn from_int(value: i64, tier: Tier) -> Self {
        Self {
            bytes: Bytes::from(value.to_string()),
            encoding: Encoding::Int(value),
            tier,
        }
    }

    /// Payload as bytes (integers in their decimal form)
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Tier the payload was routed to when the object was created
    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes this object charges to DRAM
    pub fn dram_charge(&self) -> usize {
        match self.tier {
            Tier::Dram => self.bytes.len(),
            Tier::Pmem => 0,
        }
    }

    /// Bytes this object charges to PMEM
    pub fn pmem_charge(&self) -> usize {
        match self.tier {
            Tier::Dram => 0,
            Tier::Pmem => self.bytes.len(),
        }
    }
}

fn parse_canonical_i64(bytes: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(bytes).ok()?;
    let value: i64 = text.parse().ok()?;
    // "007" or "+7" parse fine but would not render back identically
    (value.to_string().as_bytes() == bytes).then_some(value)
}

/// A value slot: the shared object plus the locator of its persistent twin
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub object: Arc<StrObject>,
    pub twin: Locator,
}

/// Snapshot of one key's slot
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub key: Bytes,

    /// Back-reference to the key's persistent entry (never owning)
    pub entry: Locator,

    pub value: StoredValue,
}

/// In-memory table contract consumed by the upsert protocol
pub trait KeyTable {
    /// Logical lookup used to route between the add and overwrite paths
    fn lookup(&self, key: &[u8]) -> Option<TableEntry>;

    /// Insert unless the key exists; returns whether the insert happened
    fn insert_if_absent(&self, key: Bytes, entry: Locator, value: StoredValue) -> bool;

    /// Raw lookup of an existing slot
    fn find(&self, key: &[u8]) -> Option<TableEntry>;

    /// Install `value` in the slot of `key`, returning the previous value
    fn set_value(&self, key: &[u8], value: StoredValue) -> Option<StoredValue>;

    /// Drop a value that left the table
    fn release_value(&self, value: StoredValue);

    /// Remove a key, returning its slot
    fn remove(&self, key: &[u8]) -> Option<TableEntry>;
}
