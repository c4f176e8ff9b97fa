use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use relay_core::Snapshot;

use crate::error::StoreError;
use crate::PersistentStore;

/// Process-local store. Nothing survives a restart; useful for tests and
/// for running without a data directory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Snapshot>,
    commits: AtomicUsize,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state, as if it had been committed earlier.
    pub fn with_state(state: Snapshot) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make subsequent commits fail with an I/O error.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Last committed state.
    pub fn stored(&self) -> Snapshot {
        self.state.lock().clone()
    }
}

impl PersistentStore for MemoryStore {
    fn load_all(&self) -> Result<Snapshot, StoreError> {
        Ok(self.state.lock().clone())
    }

    fn commit(&self, state: &Snapshot) -> Result<(), StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Io("commit rejected".into()));
        }
        *self.state.lock() = state.clone();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
