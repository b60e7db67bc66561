//! Process-wide instance cells with double-checked initialization.
//!
//! The resource manager and manifest fetcher are one-per-process handles
//! initialized lazily from the environment. The fast path reads an
//! `OnceLock` without taking the init mutex; the slow path locks, rechecks,
//! and constructs. Construction is fallible (e.g. missing credentials), so
//! a failed init leaves the cell empty for a later retry.

use crate::error::Result;
use std::sync::{Arc, Mutex, OnceLock};

/// A lazily-initialized process-wide instance of `T`.
pub struct Singleton<T> {
    cell: OnceLock<Arc<T>>,
    init_lock: Mutex<()>,
}

impl<T> Singleton<T> {
    pub const fn new() -> Self {
        Self { cell: OnceLock::new(), init_lock: Mutex::new(()) }
    }

    /// Return the instance, constructing it with `init` on first use.
    ///
    /// Concurrent first calls race on the init mutex; exactly one `init`
    /// runs and every caller receives the same `Arc`.
    pub fn get_or_try_init<F>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(existing) = self.cell.get() {
            return Ok(existing.clone());
        }

        let _guard = self.init_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = self.cell.get() {
            return Ok(existing.clone());
        }

        let instance = Arc::new(init()?);
        // The init mutex is held, so this set cannot race with another.
        let _ = self.cell.set(instance.clone());
        Ok(instance)
    }

    /// The instance, if it has already been constructed.
    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }
}

impl<T> Default for Singleton<T> {
    fn default() -> Self {
        Self::new()
    }
}
