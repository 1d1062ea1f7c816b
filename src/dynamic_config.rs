//! Live-updatable configuration values.
//!
//! Reads are lock-free (`ArcSwap`), so the lookup hot path can consult the
//! current rate-limit policy or cache TTL on every call while an operator
//! swaps them underneath.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle to a value that can be replaced at runtime. Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}
