//! Free-list pools keyed by concrete type.
//!
//! Nodes, pass-throughs and cancelation refs are recycled through here instead
//! of being dropped. A pooled object is an `Arc<T>`; stale handles may still
//! hold a clone of the `Arc`, which is why every poolable type carries a
//! generation id of its own and bumps it in [`Poolable::reset`].

use crate::config;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) trait Poolable: Default + Send + Sync + 'static {
    fn marker(&self) -> &PoolMarker;

    /// Clears every externally visible field so a parked object keeps nothing
    /// alive, and invalidates outstanding handles.
    fn reset(&self);
}

trait ErasedPool: Send + Sync {
    fn clear(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

lazy_static! {
    static ref POOLS: RwLock<HashMap<TypeId, Arc<dyn ErasedPool>>> = RwLock::new(HashMap::new());
}

pub(crate) struct Pool<T> {
    free: Mutex<Vec<Arc<T>>>,
}

impl<T: Poolable> ErasedPool for Pool<T> {
    fn clear(&self) -> usize {
        let parked = std::mem::take(&mut *self.free.lock());
        parked.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: Poolable> Pool<T> {
    fn with<R>(f: impl FnOnce(&Pool<T>) -> R) -> R {
        let key = TypeId::of::<T>();
        let existing = POOLS.read().get(&key).cloned();
        let erased = match existing {
            Some(pool) => pool,
            None => POOLS
                .write()
                .entry(key)
                .or_insert_with(|| {
                    tracing::trace!(ty = type_name::<T>(), "registering object pool");
                    Arc::new(Pool::<T> {
                        free: Mutex::new(Vec::new()),
                    })
                })
                .clone(),
        };
        let pool = erased
            .as_any()
            .downcast_ref::<Pool<T>>()
            .expect("pool registry is keyed by the pooled type");
        f(pool)
    }

    /// Hands out a recycled instance, or a fresh one if the pool is empty.
    pub(crate) fn take() -> Arc<T> {
        if config::object_pooling_enabled() {
            if let Some(item) = Self::with(|pool| pool.free.lock().pop()) {
                item.marker().unpark();
                return item;
            }
        }
        Arc::new(T::default())
    }

    /// Resets `item` and parks it for reuse.
    #[track_caller]
    pub(crate) fn repool(item: Arc<T>) {
        item.marker().assert_live();
        item.reset();
        if !config::object_pooling_enabled() {
            return;
        }
        item.marker().park();
        Self::with(|pool| pool.free.lock().push(item));
    }

    #[cfg(test)]
    pub(crate) fn parked() -> usize {
        Self::with(|pool| pool.free.lock().len())
    }
}

/// Drops every object currently parked in any pool.
///
/// Objects that are in use are unaffected and still return to their pool
/// when they are released.
pub fn clear_object_pool() {
    let pools: Vec<_> = POOLS.read().values().cloned().collect();
    let dropped: usize = pools.iter().map(|pool| pool.clear()).sum();
    tracing::debug!(dropped, "cleared object pools");
}

/// Tracks whether an object currently sits in its pool.
///
/// Only present in validating builds; in release builds it is a zero-sized
/// no-op.
#[cfg(any(debug_assertions, feature = "validate"))]
#[derive(Debug, Default)]
pub(crate) struct PoolMarker(std::sync::atomic::AtomicBool);

#[cfg(any(debug_assertions, feature = "validate"))]
impl PoolMarker {
    #[track_caller]
    pub(crate) fn assert_live(&self) {
        assert!(
            !self.0.load(std::sync::atomic::Ordering::Acquire),
            "pooled object used after it was returned to the pool"
        );
    }

    #[track_caller]
    fn park(&self) {
        let was_parked = self.0.swap(true, std::sync::atomic::Ordering::AcqRel);
        assert!(!was_parked, "object returned to the pool twice");
    }

    fn unpark(&self) {
        self.0.store(false, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(not(any(debug_assertions, feature = "validate")))]
#[derive(Debug, Default)]
pub(crate) struct PoolMarker;

#[cfg(not(any(debug_assertions, feature = "validate")))]
impl PoolMarker {
    #[inline(always)]
    pub(crate) fn assert_live(&self) {}

    #[inline(always)]
    fn park(&self) {}

    #[inline(always)]
    fn unpark(&self) {}
}
