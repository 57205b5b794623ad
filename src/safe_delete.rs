//! Deferred destruction for objects that concurrent readers may still
//! be walking.  While a deferral bracket is open, scheduled deletions
//! are parked; closing the last bracket drops them all.
use std::sync::Mutex;

struct Inner<T> {
    enabled: usize,
    deferred: Vec<T>,
}

pub struct SafeDelete<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for SafeDelete<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SafeDelete<T> {
    pub fn new() -> Self {
        SafeDelete {
            inner: Mutex::new(Inner {
                enabled: 0,
                deferred: Vec::new(),
            }),
        }
    }

    /// Opens a deferral bracket.  Brackets nest.
    pub fn enable_deferred_delete(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.enabled += 1;
    }

    /// Closes a bracket; closing the outermost drops everything that
    /// was scheduled while any bracket was open.
    pub fn disable_deferred_delete(&self) {
        let to_drop = {
            let mut inner = self.inner.lock().unwrap();
            assert!(inner.enabled > 0, "unbalanced disable");

            inner.enabled -= 1;
            if inner.enabled > 0 {
                return;
            }

            std::mem::take(&mut inner.deferred)
        };

        // Drop outside the lock.
        drop(to_drop);
    }

    /// Schedules `object` for destruction: immediate when no bracket
    /// is open, deferred otherwise.
    pub fn schedule_delete(&self, object: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.enabled > 0 {
            inner.deferred.push(object);
            return;
        }

        drop(inner);
        drop(object);
    }

    /// Number of parked deletions.  Verification aid.
    pub fn deferred_count(&self) -> usize {
        self.inner.lock().unwrap().deferred.len()
    }
}
