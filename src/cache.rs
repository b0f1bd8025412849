//! Compute-once value cache.
//!
//! Used for the autocompletion list, whose shape changes only on
//! deployment. The cached value is shared via `Arc` so repeated reads
//! return the identical allocation until `clear` starts a new generation.

use std::sync::{Arc, RwLock};

/// A single-slot cache with get-or-compute semantics.
#[derive(Debug, Default)]
pub struct ComputedCache<T> {
    slot: RwLock<Option<Arc<T>>>,
}

impl<T> ComputedCache<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Return the cached value, computing it with `generator` if the slot
    /// is empty. At most one value exists per generation; a concurrent
    /// race keeps the first value written.
    pub fn get_or_compute<F>(&self, generator: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(value) = self.slot.read().unwrap().as_ref() {
            return Arc::clone(value);
        }

        let mut slot = self.slot.write().unwrap();
        if let Some(value) = slot.as_ref() {
            return Arc::clone(value);
        }
        let value = Arc::new(generator());
        *slot = Some(Arc::clone(&value));
        value
    }

    /// Fallible variant of [`get_or_compute`](Self::get_or_compute).
    /// Errors are not cached; the next call recomputes.
    pub fn get_or_try_compute<F, E>(&self, generator: F) -> std::result::Result<Arc<T>, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
    {
        if let Some(value) = self.slot.read().unwrap().as_ref() {
            return Ok(Arc::clone(value));
        }

        let mut slot = self.slot.write().unwrap();
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(generator()?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Invalidate the cached value.
    pub fn clear(&self) {
        *self.slot.write().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_computes_once() {
        let cache = ComputedCache::new();
        let calls = AtomicUsize::new(0);

        let first = cache.get_or_compute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            vec![1, 2, 3]
        });
        let second = cache.get_or_compute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            vec![4, 5, 6]
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*second, vec![1, 2, 3]);
        // Same allocation, not just equal values
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_try_compute_error_not_cached() {
        let cache: ComputedCache<i32> = ComputedCache::new();
        let result: Result<_, String> = cache.get_or_try_compute(|| Err("boom".to_string()));
        assert!(result.is_err());

        let value = cache
            .get_or_try_compute::<_, String>(|| Ok(7))
            .unwrap();
        assert_eq!(*value, 7);
    }

    #[test]
    fn test_clear_starts_new_generation() {
        let cache = ComputedCache::new();
        let first = cache.get_or_compute(|| "a".to_string());
        cache.clear();
        let second = cache.get_or_compute(|| "b".to_string());

        assert_eq!(*first, "a");
        assert_eq!(*second, "b");
    }
}
