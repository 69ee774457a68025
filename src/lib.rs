//! # tierkv
//!
//! Persistence core of a key-value engine that spreads data over DRAM and
//! persistent memory (PMEM):
//! - Crash-consistent persistent twins of every key/value pair
//! - Undo-logged transactions over a pool addressed by locators
//! - An adaptive threshold deciding which values land in PMEM
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │            (Single Writer / Multi Reader)                    │
//! └──────────┬──────────────────┬──────────────────┬────────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//!   ┌─────────────────┐ ┌──────────────┐ ┌────────────────────┐
//!   │     Upsert      │ │   MemTable   │ │ ThresholdController│
//!   │ (add/overwrite) │ │   (RwLock)   │ │   (cron driven)    │
//!   └────────┬────────┘ └──────────────┘ └────────────────────┘
//!            │
//!            ▼
//!   ┌─────────────────────────────────────┐
//!   │                Pool                  │
//!   │  Transaction ─ PmemString ─ list     │
//!   └─────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod pmem;
pub mod memtable;
pub mod tiering;
pub mod hooks;
pub mod upsert;
pub mod engine;
pub mod maintenance;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, TierError};
pub use config::Config;
pub use engine::Engine;
pub use upsert::SetOutcome;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of tierkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
