//! Engine Module
//!
//! Ties the persistent pool, the in-memory table and the tiering controller
//! together.
//!
//! ## Responsibilities
//! - Open or create the pool and rebuild the table from the entry list
//! - Route every write through the transactional upsert protocol
//! - Tag new values with the tier chosen by the current threshold
//! - Drive the threshold controller from the maintenance tick
//! - Fire keyspace hooks after successful writes

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Result, TierError};
use crate::hooks::{KeyspaceHooks, NoopHooks};
use crate::memtable::{KeyTable, MemTable, StoredValue, StrObject};
use crate::pmem::list::{self, ListReport, ListRoot};
use crate::pmem::{Locator, PmemString, Pool, RecoveryReport};
use crate::tiering::{
    Adjustment, MemoryPolicy, ThresholdController, ThresholdHandle, TieringSnapshot, UsageSample,
};
use crate::upsert::{SetOutcome, Upsert};

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (set/overwrite/delete): Serialized by the `pool` mutex
///   - The pool is only ever mutated inside a transaction
///   - Table changes are applied while the pool lock is still held
///
/// - **Reads** (get): Served by the MemTable's internal RwLock
///
/// - **Maintenance** (cron): Locks the controller, then samples the pool.
///   Writers never take the controller lock, so the order cannot invert.
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Persistent pool (exclusive access for writes)
    pool: Mutex<Pool>,

    /// Locator of the list root inside the pool
    root: Locator,

    /// In-memory key space (internal RwLock)
    memtable: MemTable,

    /// Single writer of the routing threshold
    controller: Mutex<ThresholdController>,

    /// Lock-free reader of the routing threshold
    threshold: ThresholdHandle,

    hooks: Box<dyn KeyspaceHooks>,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Open the pool image, or create it (volatile without a path)
    /// 2. Replay any interrupted transaction (done by `Pool::open`)
    /// 3. Rebuild the in-memory table by walking the entry list
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_hooks(config, Box::new(NoopHooks))
    }

    /// Same as [`Engine::open`] with custom keyspace hooks
    pub fn open_with_hooks(config: Config, hooks: Box<dyn KeyspaceHooks>) -> Result<Self> {
        config.validate()?;

        // Step 1: Open or create the pool
        let pool = match &config.pool_path {
            Some(path) if path.exists() => Pool::open(path)?,
            Some(path) => Pool::create(path, config.pool_size)?,
            None => Pool::volatile(config.pool_size)?,
        };

        Self::from_pool(config, pool, hooks)
    }

    fn from_pool(config: Config, mut pool: Pool, hooks: Box<dyn KeyspaceHooks>) -> Result<Self> {
        // Step 2: Locate (or allocate) the list root
        let root = pool.root(ListRoot::SIZE)?;

        // Step 3: Tiering state starts from the configured policy
        let controller = ThresholdController::new(&config);
        let threshold = controller.handle();

        let engine = Self {
            config,
            pool: Mutex::new(pool),
            root,
            memtable: MemTable::new(),
            controller: Mutex::new(controller),
            threshold,
            hooks,
        };

        // Step 4: Rebuild the volatile key space
        engine.rebuild()?;
        Ok(engine)
    }

    /// Repopulate the table from the persistent list
    fn rebuild(&self) -> Result<usize> {
        let pool = self.pool.lock();
        self.memtable.clear();

        let mut loaded = 0usize;
        for item in list::walk(&pool, self.root)? {
            let (entry, snapshot) = item?;

            let key = PmemString::load(&pool, snapshot.key)?;
            let value = PmemString::load(&pool, snapshot.value)?;
            let tier = self.threshold.tier_for(value.len());
            let object = StrObject::encode(Bytes::from(value.data), tier);

            let inserted = self.memtable.insert_if_absent(
                Bytes::from(key.data),
                entry,
                StoredValue {
                    object: Arc::new(object),
                    twin: snapshot.value,
                },
            );
            if !inserted {
                return Err(TierError::ListCorruption(format!(
                    "entry {} duplicates a key already in the list",
                    entry
                )));
            }
            loaded += 1;
        }

        let stored = list::count(&pool, self.root)?;
        if stored != loaded as u64 {
            return Err(TierError::ListCorruption(format!(
                "root count is {} but {} entries were loaded",
                stored, loaded
            )));
        }

        if loaded > 0 {
            tracing::info!("Rebuilt {} keys from pool {:x}", loaded, pool.id());
        }
        Ok(loaded)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Set `key` to `value`
    ///
    /// The value object is tagged with the tier picked by the current
    /// threshold before it enters the upsert protocol.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<SetOutcome> {
        let tier = self.threshold.tier_for(value.len());
        let object = StrObject::encode(Bytes::copy_from_slice(value), tier);
        self.set_key(key, Arc::new(object))
    }

    /// Set `key` to an existing shared value object
    ///
    /// Clears any expiry and signals watchers once the write is durable in
    /// the pool.
    pub fn set_key(&self, key: &[u8], value: Arc<StrObject>) -> Result<SetOutcome> {
        let outcome = {
            let mut pool = self.pool.lock();
            Upsert::new(&self.memtable, self.root).set(&mut pool, key, value)?
        };

        if outcome == SetOutcome::Added {
            self.hooks.key_added(key);
        }
        self.hooks.remove_expire(key);
        self.hooks.signal_modified_key(key);
        Ok(outcome)
    }

    /// Replace the value of a key that must exist
    ///
    /// # Panics
    /// If `key` is not in the table.
    pub fn overwrite(&self, key: &[u8], value: Arc<StrObject>) -> Result<()> {
        {
            let mut pool = self.pool.lock();
            Upsert::new(&self.memtable, self.root).overwrite(&mut pool, key, value)?;
        }
        self.hooks.signal_modified_key(key);
        Ok(())
    }

    /// Delete a key, returning whether it existed
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let existed = {
            let mut pool = self.pool.lock();
            Upsert::new(&self.memtable, self.root).delete(&mut pool, key)?
        };

        if existed {
            self.hooks.key_deleted(key);
            self.hooks.signal_modified_key(key);
        }
        Ok(existed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the value bytes of a key
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.memtable.find(key).map(|entry| entry.value.object.bytes().clone())
    }

    /// Get the shared value object of a key
    pub fn get_object(&self, key: &[u8]) -> Option<Arc<StrObject>> {
        self.memtable.find(key).map(|entry| entry.value.object)
    }

    /// Read the persistent twin of a key's value straight from the pool
    pub fn persistent_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.memtable.find(key) else {
            return Ok(None);
        };
        let pool = self.pool.lock();
        let value = PmemString::load(&pool, entry.value.twin)?;
        Ok(Some(value.data))
    }

    /// Locator of the persistent entry of a key
    pub fn entry_of(&self, key: &[u8]) -> Option<Locator> {
        self.memtable.find(key).map(|entry| entry.entry)
    }

    /// Number of keys in the in-memory table
    pub fn entry_count(&self) -> usize {
        self.memtable.entry_count()
    }

    /// Number of entries recorded in the persistent list root
    pub fn persistent_count(&self) -> Result<u64> {
        list::count(&self.pool.lock(), self.root)
    }

    /// All keys, in no particular order
    pub fn keys(&self) -> Vec<Bytes> {
        self.memtable.keys()
    }

    /// Walk the persistent list and check every structural invariant
    ///
    /// Also checks that the list and the in-memory table hold the same
    /// number of keys.
    pub fn verify(&self) -> Result<ListReport> {
        let report = list::verify(&self.pool.lock(), self.root)?;
        let in_memory = self.memtable.entry_count() as u64;
        if report.count != in_memory {
            return Err(TierError::ListCorruption(format!(
                "list holds {} entries but the table holds {} keys",
                report.count, in_memory
            )));
        }
        Ok(report)
    }

    // =========================================================================
    // Tiering
    // =========================================================================

    /// Bytes routed to each tier by the threshold
    ///
    /// Persistent twins are not counted: every pair has one whichever tier
    /// its value was routed to.
    pub fn usage(&self) -> UsageSample {
        UsageSample::new(self.memtable.dram_bytes(), self.memtable.pmem_bytes())
    }

    /// Bytes allocated in the pool, persistent twins and list entries included
    pub fn pool_used_bytes(&self) -> usize {
        self.pool.lock().used_bytes()
    }

    /// One maintenance tick: lets the controller adjust the threshold
    pub fn cron(&self) -> Adjustment {
        let mut controller = self.controller.lock();
        controller.tick(|| self.usage())
    }

    /// Current routing threshold in bytes
    pub fn threshold(&self) -> usize {
        self.threshold.get()
    }

    /// Shared handle to the routing threshold
    pub fn threshold_handle(&self) -> ThresholdHandle {
        self.threshold.clone()
    }

    /// Switch the memory policy at runtime
    pub fn set_policy(&self, policy: MemoryPolicy) {
        self.controller.lock().set_policy(policy);
    }

    pub fn tiering_snapshot(&self) -> TieringSnapshot {
        self.controller.lock().snapshot()
    }

    // =========================================================================
    // Durability & Failure Injection
    // =========================================================================

    /// Write the pool image to its file (no-op for volatile pools)
    pub fn sync(&self) -> Result<()> {
        self.pool.lock().sync()
    }

    /// Simulate power loss after `n` more persistent mutations
    pub fn inject_crash_after(&self, n: usize) {
        self.pool.lock().inject_crash_after(n);
    }

    /// Whether a simulated crash fired and recovery is pending
    pub fn is_crashed(&self) -> bool {
        self.pool.lock().is_crashed()
    }

    /// Simulate a process restart on the same pool
    ///
    /// Volatile state is discarded, the undo log is replayed and the table
    /// is rebuilt from the list.
    pub fn restart(self) -> Result<(Self, RecoveryReport)> {
        let Engine { config, pool, hooks, .. } = self;

        let mut pool = pool.into_inner();
        let report = pool.recover()?;

        let engine = Self::from_pool(config, pool, hooks)?;
        Ok((engine, report))
    }

    /// Sync the pool image and shut down
    pub fn close(self) -> Result<()> {
        let pool = self.pool.into_inner();
        pool.sync()?;
        tracing::info!("Closed pool {:x} ({} bytes used)", pool.id(), pool.used_bytes());
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
