//! Persistent Strings
//!
//! Length-prefixed byte buffers living in the pool.
//!
//! ## Layout
//! ```text
//! ┌──────────────┬──────────────────────┬───────────┬──────┐
//! │ Backref (16) │ Header (1/3/5/9/17)  │ Data (n)  │ 0x00 │
//! └──────────────┴──────────────────────┴───────────┴──────┘
//! ```
//!
//! The header starts with a flags byte whose low 3 bits name the `SdsType`.
//! Type5 packs the length into the flags' upper 5 bits; wider types follow
//! the flags with `len` and `alloc` in their own integer width. The trailing
//! zero byte lets buffer-oriented consumers treat the data as C-string-like.

use crate::error::{Result, TierError};

use super::tx::Transaction;
use super::{Field, Locator, Pool, TypeTag};

/// Size of the owner back-reference slot preceding the header
pub const BACKREF_SIZE: usize = Locator::SIZE;

const SDS_TYPE_BITS: u8 = 3;
const SDS_TYPE_MASK: u8 = 0b111;

/// Header encoding of a persistent string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdsType {
    Type5 = 0,
    Type8 = 1,
    Type16 = 2,
    Type32 = 3,
    Type64 = 4,
}

impl SdsType {
    /// Narrowest encoding able to hold `len`
    pub fn for_len(len: usize) -> Self {
        let len = len as u64;
        if len < 1 << 5 {
            SdsType::Type5
        } else if len < 1 << 8 {
            SdsType::Type8
        } else if len < 1 << 16 {
            SdsType::Type16
        } else if len < 1 << 32 {
            SdsType::Type32
        } else {
            SdsType::Type64
        }
    }

    /// Encoding used when building a string of `len` bytes
    ///
    /// Empty strings are usually created in order to be grown, which Type5
    /// cannot express, so they start as Type8.
    pub fn for_new(len: usize) -> Self {
        match Self::for_len(len) {
            SdsType::Type5 if len == 0 => SdsType::Type8,
            ty => ty,
        }
    }

    pub fn header_size(self) -> usize {
        match self {
            SdsType::Type5 => 1,
            SdsType::Type8 => 1 + 2,
            SdsType::Type16 => 1 + 2 * 2,
            SdsType::Type32 => 1 + 2 * 4,
            SdsType::Type64 => 1 + 2 * 8,
        }
    }

    fn from_flags(flags: u8) -> Result<Self> {
        match flags & SDS_TYPE_MASK {
            0 => Ok(SdsType::Type5),
            1 => Ok(SdsType::Type8),
            2 => Ok(SdsType::Type16),
            3 => Ok(SdsType::Type32),
            4 => Ok(SdsType::Type64),
            other => Err(TierError::PoolCorruption(format!(
                "unknown string header type {}",
                other
            ))),
        }
    }

    /// Width in bytes of the `len`/`alloc` fields
    fn width(self) -> usize {
        match self {
            SdsType::Type5 => 0,
            SdsType::Type8 => 1,
            SdsType::Type16 => 2,
            SdsType::Type32 => 4,
            SdsType::Type64 => 8,
        }
    }

    fn encode_header(self, len: usize, out: &mut Vec<u8>) {
        if self == SdsType::Type5 {
            out.push(self as u8 | ((len as u8) << SDS_TYPE_BITS));
            return;
        }

        out.push(self as u8);
        let width = self.width();
        let bytes = (len as u64).to_le_bytes();
        // len, then alloc (a fresh string has no spare capacity)
        out.extend_from_slice(&bytes[..width]);
        out.extend_from_slice(&bytes[..width]);
    }
}

/// Decoded view of a persistent string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmemString {
    /// Where the string lives
    pub locator: Locator,

    /// Owning entry, or null
    pub backref: Locator,

    pub sds_type: SdsType,

    /// Capacity recorded in the header
    pub alloc: usize,

    pub data: Vec<u8>,
}

impl PmemString {
    /// Owner back-reference slot
    pub const BACKREF: Field<Locator> = Field::at(0);

    // =========================================================================
    // Building
    // =========================================================================

    /// Build a persistent string of `len` bytes inside `tx`
    ///
    /// With `init = None` the data stays zero-filled. Allocation failure is
    /// returned as-is so that it aborts the caller's transaction.
    pub fn new_len(tx: &mut Transaction<'_>, init: Option<&[u8]>, len: usize) -> Result<Locator> {
        if let Some(src) = init {
            if src.len() < len {
                return Err(TierError::InvalidArgument(format!(
                    "source holds {} bytes, {} requested",
                    src.len(),
                    len
                )));
            }
        }

        let sds_type = SdsType::for_new(len);
        let hdr_len = sds_type.header_size();
        let size = (BACKREF_SIZE + hdr_len)
            .checked_add(len)
            .and_then(|size| size.checked_add(1))
            .ok_or_else(|| TierError::OutOfMemory {
                requested: len,
                available: tx.pool().capacity().saturating_sub(tx.pool().used_bytes()),
            })?;
        let logged = tx.zalloc(size, TypeTag::Sds)?;

        let mut header = Vec::with_capacity(hdr_len);
        sds_type.encode_header(len, &mut header);
        tx.write(&logged, BACKREF_SIZE, &header)?;

        let data_start = BACKREF_SIZE + hdr_len;
        if let Some(src) = init {
            if len > 0 {
                tx.write(&logged, data_start, &src[..len])?;
            }
        }
        tx.write(&logged, data_start + len, &[0])?;

        Ok(logged.locator())
    }

    /// Build a persistent copy of `bytes`
    pub fn dup(tx: &mut Transaction<'_>, bytes: &[u8]) -> Result<Locator> {
        Self::new_len(tx, Some(bytes), bytes.len())
    }

    // =========================================================================
    // Back-references
    // =========================================================================

    /// Record the entry that owns the string at `loc`
    pub fn set_backref(tx: &mut Transaction<'_>, loc: Locator, owner: Locator) -> Result<()> {
        tx.set(loc, Self::BACKREF, &owner)
    }

    pub fn backref(pool: &Pool, loc: Locator) -> Result<Locator> {
        pool.get(loc, Self::BACKREF)
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Decode the string at `loc`, validating header, size and sentinel
    pub fn load(pool: &Pool, loc: Locator) -> Result<Self> {
        if pool.type_of(loc)? != TypeTag::Sds {
            return Err(TierError::InvalidLocator(format!("{} is not a string", loc)));
        }
        let size = pool.usable_size(loc)?;
        let flags = pool.read(loc, BACKREF_SIZE, 1)?[0];
        let sds_type = SdsType::from_flags(flags)?;
        let hdr_len = sds_type.header_size();

        let (len, alloc) = if sds_type == SdsType::Type5 {
            let len = (flags >> SDS_TYPE_BITS) as usize;
            (len, len)
        } else {
            let width = sds_type.width();
            let fields = pool.read(loc, BACKREF_SIZE + 1, 2 * width)?;
            (read_uint(&fields[..width]), read_uint(&fields[width..]))
        };

        if BACKREF_SIZE + hdr_len + len + 1 != size {
            return Err(TierError::PoolCorruption(format!(
                "string {} claims {} bytes but occupies {}",
                loc, len, size
            )));
        }

        let data_start = BACKREF_SIZE + hdr_len;
        if pool.read(loc, data_start + len, 1)?[0] != 0 {
            return Err(TierError::PoolCorruption(format!(
                "string {} is missing its terminator",
                loc
            )));
        }

        Ok(Self {
            locator: loc,
            backref: Self::backref(pool, loc)?,
            sds_type,
            alloc,
            data: pool.read(loc, data_start, len)?.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

fn read_uint(bytes: &[u8]) -> usize {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf) as usize
}
