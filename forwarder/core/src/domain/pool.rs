// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Descriptor pool
//!
//! Typed object pool for fixed-size descriptors such as requests. Released
//! objects are parked on a pending list without being touched; `restock`
//! resets them in bulk and makes them available again. An object whose
//! reset reports failure is dropped instead of being reused.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** acquire / release / restock for pooled descriptors

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Objects that can live in an [`ObjectPool`].
pub trait Poolable: Default + Send {
    /// Return the object to its freshly-constructed state.
    ///
    /// Returning `false` discards the object.
    fn reset(&mut self) -> bool {
        *self = Self::default();
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub free: usize,
    pub pending: usize,
    pub allocated: u64,
    pub acquired: u64,
    pub released: u64,
}

#[derive(Debug)]
struct PoolLists<T> {
    free: Vec<Box<T>>,
    pending: Vec<Box<T>>,
}

pub struct ObjectPool<T: Poolable> {
    name: String,
    target: usize,
    lists: Mutex<PoolLists<T>>,
    allocated: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl<T: Poolable> ObjectPool<T> {
    /// Create a pool that keeps `target` objects ready after each restock.
    pub fn new(name: impl Into<String>, target: usize) -> Self {
        let pool = Self {
            name: name.into(),
            target,
            lists: Mutex::new(PoolLists {
                free: Vec::with_capacity(target),
                pending: Vec::new(),
            }),
            allocated: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        };
        pool.restock();
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) -> Box<T> {
        self.acquired.fetch_add(1, Ordering::Relaxed);

        let mut lists = self.lists.lock();
        if lists.free.is_empty() {
            Self::reclaim(&mut lists);
        }
        if let Some(object) = lists.free.pop() {
            return object;
        }
        drop(lists);

        self.allocated.fetch_add(1, Ordering::Relaxed);
        Box::default()
    }

    pub fn release(&self, object: Box<T>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.lists.lock().pending.push(object);
    }

    /// Reset pending objects and top the free list up to the target.
    pub fn restock(&self) {
        let mut lists = self.lists.lock();
        Self::reclaim(&mut lists);

        while lists.free.len() < self.target {
            lists.free.push(Box::default());
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let lists = self.lists.lock();
        PoolStats {
            free: lists.free.len(),
            pending: lists.pending.len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    fn reclaim(lists: &mut PoolLists<T>) {
        let pending = std::mem::take(&mut lists.pending);
        for mut object in pending {
            if object.reset() {
                lists.free.push(object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Descriptor {
        value: u32,
        poisoned: bool,
    }

    impl Poolable for Descriptor {
        fn reset(&mut self) -> bool {
            if self.poisoned {
                return false;
            }
            self.value = 0;
            true
        }
    }

    #[test]
    fn test_restock_prefills_target() {
        let pool: ObjectPool<Descriptor> = ObjectPool::new("requests", 4);
        let stats = pool.stats();
        assert_eq!(stats.free, 4);
        assert_eq!(stats.allocated, 4);
    }

    #[test]
    fn test_released_objects_are_reset_before_reuse() {
        let pool: ObjectPool<Descriptor> = ObjectPool::new("requests", 1);

        let mut object = pool.acquire();
        object.value = 99;
        pool.release(object);
        assert_eq!(pool.stats().pending, 1);

        // Free list is empty, so acquire reclaims the pending object.
        let object = pool.acquire();
        assert_eq!(object.value, 0);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_failed_reset_discards_object() {
        let pool: ObjectPool<Descriptor> = ObjectPool::new("requests", 0);

        let mut object = pool.acquire();
        object.poisoned = true;
        pool.release(object);
        pool.restock();

        let stats = pool.stats();
        assert_eq!(stats.free, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.released, 1);
    }
}
