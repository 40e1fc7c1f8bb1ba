//! Per-key warm-up tracking.
//!
//! A key is cold until its first successful cache write. Cold keys are
//! served by direct computation while the write happens in the background.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Tracks which cache keys have been populated since the last health change.
#[derive(Debug, Default)]
pub struct WarmUpState {
    keys: RwLock<HashMap<String, bool>>,
}

impl WarmUpState {
    /// Creates a state with every key cold.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once `key` has been written.
    #[must_use]
    pub fn is_warm(&self, key: &str) -> bool {
        self.keys.read().get(key).copied().unwrap_or(false)
    }

    /// Marks `key` as populated.
    pub fn mark_warm(&self, key: &str) {
        self.keys.write().insert(key.to_string(), true);
    }

    /// Marks every key cold again.
    pub fn reset_all(&self) {
        self.keys.write().clear();
    }

    /// Number of warm keys.
    #[must_use]
    pub fn warm_count(&self) -> usize {
        self.keys.read().values().filter(|warm| **warm).count()
    }
}
