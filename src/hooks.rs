//! Keyspace hooks
//!
//! Extension points invoked after a successful write. The engine ships with
//! [`NoopHooks`]; expiry, keyspace notifications, blocked-list wakeups and
//! cluster slot bookkeeping plug in here.

/// Callbacks fired by the engine after it changed a key
pub trait KeyspaceHooks: Send + Sync {
    /// A key was added by `set`
    fn key_added(&self, _key: &[u8]) {}

    /// Any expiry attached to the key must be cleared
    fn remove_expire(&self, _key: &[u8]) {}

    /// Watchers of the key must be told it changed
    fn signal_modified_key(&self, _key: &[u8]) {}

    /// A key was deleted
    fn key_deleted(&self, _key: &[u8]) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl KeyspaceHooks for NoopHooks {}
