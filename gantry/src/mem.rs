//! Memory accounting for endpoint read buffers.
//!
//! The endpoint reserves its next read target from an allocator before
//! touching the kernel; on reservation failure the read fails with
//! `ResourceExhausted` and a reclaimer is posted so buffers can be shed
//! under pressure.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// A granted byte reservation. Returns the bytes on drop.
pub struct Reservation {
    release: Option<Box<dyn FnOnce() + Send>>,
    bytes: usize,
}

impl Reservation {
    /// Construct a reservation with a custom release hook.
    pub fn new(bytes: usize, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
            bytes,
        }
    }

    /// Number of reserved bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// The allocator surface consumed by the endpoint.
pub trait MemoryAllocator: Send + Sync {
    /// Try to reserve `bytes`; `None` signals pressure.
    fn reserve(&self, bytes: usize) -> Option<Reservation>;

    /// Register a callback invoked when the allocator wants memory back.
    fn post_reclaimer(&self, reclaimer: Box<dyn Fn() + Send + Sync>);
}

/// A fixed-limit quota allocator.
pub struct MemoryQuota {
    inner: Arc<QuotaInner>,
}

struct QuotaInner {
    limit: usize,
    used: AtomicUsize,
    reclaimers: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl MemoryQuota {
    /// Create a quota capped at `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                limit,
                used: AtomicUsize::new(0),
                reclaimers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }
}

impl MemoryAllocator for MemoryQuota {
    fn reserve(&self, bytes: usize) -> Option<Reservation> {
        let mut used = self.inner.used.load(Ordering::Relaxed);
        loop {
            if used + bytes > self.inner.limit {
                // Give registered reclaimers a chance before failing.
                // Snapshot first: reclaimers run without the lock held.
                let reclaimers = self.inner.reclaimers.lock().unwrap().clone();
                for reclaimer in &reclaimers {
                    reclaimer();
                }
                let now = self.inner.used.load(Ordering::Relaxed);
                if now + bytes > self.inner.limit {
                    return None;
                }
                used = now;
                continue;
            }
            match self.inner.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        let inner = self.inner.clone();
        Some(Reservation::new(bytes, move || {
            inner.used.fetch_sub(bytes, Ordering::AcqRel);
        }))
    }

    fn post_reclaimer(&self, reclaimer: Box<dyn Fn() + Send + Sync>) {
        self.inner
            .reclaimers
            .lock()
            .unwrap()
            .push(Arc::from(reclaimer));
    }
}
