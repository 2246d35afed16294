//! Bounded pool of recently detached cars.
//!
//! Entries are only ever pushed and popped, never read in place, so the LRU
//! order of the underlying cache is plain insertion order and eviction drops
//! the car that was detached longest ago.
//!
//! An optional hook hears the id of every car the pool releases, so caches
//! keyed by model can drop their entries too.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::resource::CarResource;

/// Called with the id of each car released by the pool.
pub type EvictionHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct EvictionPool {
    /// `None` when pooling is disabled (capacity 0).
    entries: Option<LruCache<String, CarResource>>,
    on_evict: Option<EvictionHook>,
}

impl EvictionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            on_evict: None,
        }
    }

    pub fn set_eviction_hook(&mut self, hook: EvictionHook) {
        self.on_evict = Some(hook);
    }

    fn released(&self, id: &str) {
        if let Some(hook) = &self.on_evict {
            hook(id);
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.cap().get())
    }

    /// Park a detached car. The oldest entry is dropped (releasing its GPU
    /// objects) when the pool is full; with pooling disabled `car` is dropped.
    pub fn admit(&mut self, mut car: CarResource) {
        car.clear_overrides();
        let id = car.id().to_string();
        let Some(entries) = self.entries.as_mut() else {
            log::debug!("Pooling disabled, releasing `{id}`");
            drop(car);
            self.released(&id);
            return;
        };
        match entries.push(id.clone(), car) {
            Some((evicted, _)) if evicted == id => log::debug!("Replaced pooled `{id}`"),
            Some((evicted, old)) => {
                log::warn!("Car pool full, evicting `{evicted}`");
                drop(old);
                self.released(&evicted);
            }
            None => log::debug!("Pooled `{id}` ({}/{})", entries.len(), entries.cap()),
        }
    }

    /// Remove a pooled car for reattachment.
    pub fn take(&mut self, id: &str) -> Option<CarResource> {
        let car = self.entries.as_mut()?.pop(id);
        if car.is_some() {
            log::debug!("Reattaching pooled `{id}`");
        }
        car
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.as_ref().is_some_and(|e| e.contains(id))
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pooled ids, oldest first.
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .as_ref()
            .map(|e| e.iter().rev().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        let ids = self.ids();
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
        for id in &ids {
            self.released(id);
        }
    }
}

impl std::fmt::Debug for EvictionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionPool")
            .field("capacity", &self.capacity())
            .field("ids", &self.ids())
            .field("hooked", &self.on_evict.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::fixtures::test_car;
    use crate::car::resource::DecodedCar;
    use crate::gpu::{CpuBackend, SharedBackend};
    use std::sync::Arc;

    fn car(backend: &SharedBackend, id: &str) -> CarResource {
        CarResource::build(backend, DecodedCar::decode(test_car(id), None)).unwrap()
    }

    #[test]
    fn test_evicts_oldest_first() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut pool = EvictionPool::new(2);
        pool.admit(car(&backend, "a"));
        pool.admit(car(&backend, "b"));
        pool.admit(car(&backend, "c"));
        assert_eq!(pool.ids(), vec!["b".to_string(), "c".to_string()]);
        assert!(!pool.contains("a"));
        // Only b and c hold buffers now
        assert_eq!(backend.stats().live_buffers, 12);
    }

    #[test]
    fn test_take_removes_entry() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut pool = EvictionPool::new(2);
        pool.admit(car(&backend, "a"));
        pool.admit(car(&backend, "b"));
        let a = pool.take("a").unwrap();
        assert_eq!(a.id(), "a");
        assert_eq!(pool.ids(), vec!["b".to_string()]);
        assert!(pool.take("a").is_none());

        // Re-admitted cars go to the back of the queue
        pool.admit(a);
        pool.admit(car(&backend, "c"));
        assert_eq!(pool.ids(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_zero_capacity_disables_pooling() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut pool = EvictionPool::new(0);
        pool.admit(car(&backend, "a"));
        assert!(pool.is_empty());
        assert_eq!(pool.capacity(), 0);
        assert_eq!(backend.stats().live_buffers, 0);
    }

    #[test]
    fn test_hook_hears_every_released_car() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let heard = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&heard);
        let hook: EvictionHook = Arc::new(move |id: &str| sink.lock().push(id.to_string()));

        let mut pool = EvictionPool::new(1);
        pool.set_eviction_hook(Arc::clone(&hook));
        pool.admit(car(&backend, "a"));
        pool.admit(car(&backend, "a"));
        assert!(heard.lock().is_empty());
        pool.admit(car(&backend, "b"));
        assert_eq!(*heard.lock(), vec!["a".to_string()]);
        // Taken cars are back in a slot, not released
        let b = pool.take("b").unwrap();
        pool.clear();
        assert_eq!(heard.lock().len(), 1);
        pool.admit(b);
        pool.clear();
        assert_eq!(*heard.lock(), vec!["a".to_string(), "b".to_string()]);

        let mut disabled = EvictionPool::new(0);
        disabled.set_eviction_hook(hook);
        disabled.admit(car(&backend, "c"));
        assert_eq!(heard.lock().last().map(String::as_str), Some("c"));
    }
}
