//! Engine instance pool
//!
//! Keyed, bounded cache of engine handles with strict LRU eviction.
//! Handles are created lazily on first request for their key and dropped
//! only when evicted (or on `clear`). Callers keep an `Arc` to the handle,
//! so inference runs outside the pool lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::{EngineFactory, EngineHandle, EngineInstanceKey};
use crate::errors::EngineError;

/// Default maximum number of live engine handles
pub const DEFAULT_POOL_CAPACITY: usize = 12;

struct PoolEntry {
    handle: Arc<EngineHandle>,
    last_used: u64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<EngineInstanceKey, PoolEntry>,
    /// Monotonic touch counter used for recency ordering
    clock: u64,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn least_recently_used(&self) -> Option<EngineInstanceKey> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())
    }
}

/// Bounded pool of recognition-engine handles
pub struct EngineInstancePool {
    factory: Arc<dyn EngineFactory>,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl EngineInstancePool {
    /// Create a pool with the default capacity
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self::with_capacity(factory, DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool holding at most `capacity` handles (minimum 1)
    pub fn with_capacity(factory: Arc<dyn EngineFactory>, capacity: usize) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Get the handle for `key`, constructing it if needed.
    ///
    /// Construction happens under the pool lock so each key is built at most
    /// once per residency. A failed construction leaves the pool untouched.
    pub fn acquire(&self, key: &EngineInstanceKey) -> Result<Arc<EngineHandle>, EngineError> {
        let mut state = self.state.lock();
        let now = state.tick();

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used = now;
            return Ok(Arc::clone(&entry.handle));
        }

        info!("Constructing recognition engine for {}", key);
        let start = Instant::now();
        let engine = self.factory.construct(key)?;
        let handle = Arc::new(EngineHandle::new(key.clone(), engine));
        info!("Engine {} ready in {:?}", key, start.elapsed());

        if state.entries.len() >= self.capacity {
            if let Some(victim) = state.least_recently_used() {
                state.entries.remove(&victim);
                info!("Evicted least recently used engine {}", victim);
            }
        }

        state.entries.insert(
            key.clone(),
            PoolEntry {
                handle: Arc::clone(&handle),
                last_used: now,
            },
        );
        debug!("Engine pool holds {}/{} handles", state.entries.len(), self.capacity);

        Ok(handle)
    }

    /// Drop every pooled handle
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        if count > 0 {
            info!("Cleared {} engine handles", count);
        }
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of live handles
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a handle for `key` is currently pooled
    pub fn contains(&self, key: &EngineInstanceKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeFactory;
    use std::thread;

    fn key(name: &str) -> EngineInstanceKey {
        EngineInstanceKey::new(name, false, false)
    }

    #[test]
    fn test_acquire_reuses_handle() {
        let factory = Arc::new(FakeFactory::returning(vec![]));
        let calls = factory.calls.clone();
        let pool = EngineInstancePool::new(factory);

        let first = pool.acquire(&key("ch")).unwrap();
        let second = pool.acquire(&key("ch")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.constructed(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let factory = Arc::new(FakeFactory::returning(vec![]));
        let pool = EngineInstancePool::with_capacity(factory, 2);

        pool.acquire(&key("a")).unwrap();
        pool.acquire(&key("b")).unwrap();
        pool.acquire(&key("a")).unwrap();
        pool.acquire(&key("c")).unwrap();

        // A was touched after B, so B goes
        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&key("a")));
        assert!(!pool.contains(&key("b")));
        assert!(pool.contains(&key("c")));
    }

    #[test]
    fn test_evicts_first_inserted_without_touch() {
        let factory = Arc::new(FakeFactory::returning(vec![]));
        let pool = EngineInstancePool::with_capacity(factory, 2);

        pool.acquire(&key("a")).unwrap();
        pool.acquire(&key("b")).unwrap();
        pool.acquire(&key("c")).unwrap();

        assert!(!pool.contains(&key("a")));
        assert!(pool.contains(&key("b")));
        assert!(pool.contains(&key("c")));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let factory = Arc::new(FakeFactory::returning(vec![]));
        let pool = EngineInstancePool::with_capacity(factory, 3);

        for i in 0..20 {
            pool.acquire(&key(&format!("lang{}", i % 7))).unwrap();
            assert!(pool.len() <= 3);
        }
    }

    #[test]
    fn test_construction_failure_leaves_pool_intact() {
        let factory = Arc::new(FakeFactory::returning(vec![]).failing_on(key("broken")));
        let pool = EngineInstancePool::with_capacity(factory, 1);

        pool.acquire(&key("ch")).unwrap();
        let result = pool.acquire(&key("broken"));

        assert!(matches!(result, Err(EngineError::Construction(_))));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&key("ch")));
    }

    #[test]
    fn test_evicted_handle_stays_usable_by_holder() {
        let factory = Arc::new(FakeFactory::returning(vec![]));
        let calls = factory.calls.clone();
        let pool = EngineInstancePool::with_capacity(factory, 1);

        let held = pool.acquire(&key("a")).unwrap();
        pool.acquire(&key("b")).unwrap();
        assert!(!pool.contains(&key("a")));

        let image = image::DynamicImage::new_rgb8(2, 2);
        assert!(held.run(&Default::default(), &image).is_ok());

        // Re-requesting an evicted key rebuilds it
        pool.acquire(&key("a")).unwrap();
        assert_eq!(calls.constructed(), 3);
    }

    #[test]
    fn test_clear() {
        let factory = Arc::new(FakeFactory::returning(vec![]));
        let pool = EngineInstancePool::new(factory);
        pool.acquire(&key("a")).unwrap();
        pool.acquire(&key("b")).unwrap();

        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.capacity(), DEFAULT_POOL_CAPACITY);
    }

    #[test]
    fn test_concurrent_acquire_constructs_once() {
        let factory = Arc::new(FakeFactory::returning(vec![]));
        let calls = factory.calls.clone();
        let pool = Arc::new(EngineInstancePool::new(factory));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.acquire(&key("ch")).map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(calls.constructed(), 1);
    }
}
