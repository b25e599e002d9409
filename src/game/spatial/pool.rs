//! Object pools for spatial working structures
//!
//! `get` hands back a recycled object when one is idle, otherwise allocates a
//! fresh one. Pools never fail: the capacity is advisory and only bounds how
//! many idle objects are retained after `put`.
//!
//! Objects coming out of a pool are usable but not zeroed. Callers set every
//! field they rely on.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Types that can live in a [`Pool`]
pub trait Poolable: Default + Send {
    /// Called on `put`, before the object becomes idle
    fn recycle(&mut self) {}
}

/// Fixed-capacity object pool
pub struct Pool<T: Poolable> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
    gets: AtomicU64,
    puts: AtomicU64,
    allocations: AtomicU64,
}

/// Pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub gets: u64,
    pub puts: u64,
    pub allocations: u64,
    pub idle: usize,
}

impl PoolStats {
    /// Objects handed out and not yet returned
    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.gets.saturating_sub(self.puts)
    }
}

impl<T: Poolable> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    /// Take an object out of the pool
    pub fn get(&self) -> T {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(item) = self.idle.lock().pop() {
            return item;
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        T::default()
    }

    /// Return an object; dropped instead of retained once the pool is full
    pub fn put(&self, mut item: T) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        item.recycle();
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(item);
        }
    }

    /// Borrow an object for the current scope; it is returned on drop
    pub fn borrow(&self) -> Pooled<'_, T> {
        Pooled {
            item: self.get(),
            pool: self,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Scoped pool borrow
pub struct Pooled<'a, T: Poolable> {
    item: T,
    pool: &'a Pool<T>,
}

impl<T: Poolable> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Poolable> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Poolable> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        // Default values of pooled types do not allocate
        self.pool.put(std::mem::take(&mut self.item));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        values: Vec<u32>,
        tag: u32,
    }

    impl Poolable for Scratch {
        fn recycle(&mut self) {
            self.values.clear();
        }
    }

    #[test]
    fn test_get_allocates_when_empty() {
        let pool: Pool<Scratch> = Pool::new(4);
        let _a = pool.get();
        let _b = pool.get();

        let stats = pool.stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.outstanding(), 2);
    }

    #[test]
    fn test_put_then_get_reuses() {
        let pool: Pool<Scratch> = Pool::new(4);
        let mut item = pool.get();
        item.values.extend([1, 2, 3]);
        item.tag = 42;
        pool.put(item);

        let reused = pool.get();
        assert!(reused.values.is_empty(), "recycle runs on put");
        // Not zeroed: fields recycle leaves alone survive
        assert_eq!(reused.tag, 42);
        assert_eq!(pool.stats().allocations, 1);
    }

    #[test]
    fn test_capacity_is_advisory() {
        let pool: Pool<Scratch> = Pool::new(2);
        let items: Vec<_> = (0..5).map(|_| pool.get()).collect();
        assert_eq!(pool.stats().allocations, 5);

        for item in items {
            pool.put(item);
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn test_borrow_returns_on_drop() {
        let pool: Pool<Scratch> = Pool::new(2);
        {
            let mut scratch = pool.borrow();
            scratch.values.push(7);
            assert_eq!(pool.stats().outstanding(), 1);
        }
        let stats = pool.stats();
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.idle, 1);
    }
}
