//! Per-cluster circuit-breaker call counters.
//!
//! Counters are shared process-wide by (cluster, EDS service name) so
//! every channel targeting the same cluster shares one in-flight count.
//! The map holds weak references; a counter removes its own entry when
//! the last picker drops it.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, Weak,
};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

type CounterKey = (String, String);

/// Shared atomic count of in-flight calls for one cluster.
pub struct CallCounter {
    key: CounterKey,
    registry: Weak<CircuitBreakerRegistry>,
    in_flight: AtomicU32,
}

impl CallCounter {
    /// Record a call start.
    pub fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a call finish.
    pub fn decrement(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current in-flight count. Racy by design: the check at pick time
    /// and the increment at call start are not atomic, so bounded
    /// overshoot is accepted.
    pub fn load(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for CallCounter {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut map = registry.map.lock().unwrap();
        // Only remove the entry if it still binds to this counter; a
        // fresh counter may have replaced a dead weak ref already.
        if let Some(existing) = map.get(&self.key) {
            if std::ptr::eq(existing.as_ptr(), self) {
                map.remove(&self.key);
            }
        }
    }
}

/// The (cluster, eds_service_name) -> counter map.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    map: Mutex<FxHashMap<CounterKey, Weak<CallCounter>>>,
}

impl CircuitBreakerRegistry {
    /// An empty registry. Tests build their own instead of sharing the
    /// process default.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Return the live counter for the key, installing a new one if the
    /// previous binding died.
    pub fn get_or_create(
        self: &Arc<Self>,
        cluster: &str,
        eds_service_name: &str,
    ) -> Arc<CallCounter> {
        let key = (cluster.to_string(), eds_service_name.to_string());
        let mut map = self.map.lock().unwrap();
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let counter = Arc::new(CallCounter {
            key: key.clone(),
            registry: Arc::downgrade(self),
            in_flight: AtomicU32::new(0),
        });
        map.insert(key, Arc::downgrade(&counter));
        counter
    }
}

/// The process-wide registry used by production wiring.
pub fn global_registry() -> Arc<CircuitBreakerRegistry> {
    static GLOBAL: Lazy<Arc<CircuitBreakerRegistry>> = Lazy::new(CircuitBreakerRegistry::new);
    GLOBAL.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_a_counter() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("cluster", "eds");
        let b = registry.get_or_create("cluster", "eds");
        assert!(Arc::ptr_eq(&a, &b));
        a.increment();
        assert_eq!(b.load(), 1);
        a.decrement();
        assert_eq!(b.load(), 0);

        let other = registry.get_or_create("cluster", "other-eds");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn entry_removed_when_last_ref_drops() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("cluster", "eds");
        a.increment();
        drop(a);
        assert!(registry.map.lock().unwrap().is_empty());
        // A later lookup installs a fresh counter starting at zero.
        let b = registry.get_or_create("cluster", "eds");
        assert_eq!(b.load(), 0);
    }
}
