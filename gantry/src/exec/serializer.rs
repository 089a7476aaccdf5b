use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

type Closure = Box<dyn FnOnce() + Send>;

/// A FIFO closure queue that is never run concurrently with itself.
///
/// `run` borrows the calling thread: if no drain is active the closure
/// (and anything enqueued while it runs) executes before `run` returns.
/// Calls made while another thread is draining just enqueue; the active
/// drainer picks them up, preserving submission order.
pub struct WorkSerializer {
    inner: Mutex<Inner>,
}

struct Inner {
    queue: VecDeque<Closure>,
    draining: bool,
}

impl WorkSerializer {
    /// Create a new serializer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                draining: false,
            }),
        })
    }

    /// Enqueue `f` and drain the queue unless a drain is already active.
    pub fn run(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.push_back(Box::new(f));
            if inner.draining {
                return;
            }
            inner.draining = true;
        }
        self.drain();
    }

    /// Enqueue `f` without draining. A later `run` or `drain` executes it.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.lock().unwrap().queue.push_back(Box::new(f));
    }

    /// Drain all queued closures on the calling thread.
    pub fn drain(self: &Arc<Self>) {
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                match inner.queue.pop_front() {
                    Some(f) => {
                        inner.draining = true;
                        f
                    }
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };
            next();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn fifo_order() {
        let serializer = WorkSerializer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = order.clone();
            serializer.schedule(move || order.lock().unwrap().push(i));
        }
        serializer.drain();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn reentrant_run_defers() {
        let serializer = WorkSerializer::new();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let serializer2 = serializer.clone();
            let seen = seen.clone();
            serializer.run(move || {
                let inner_seen = seen.clone();
                serializer2.run(move || {
                    inner_seen.store(2, Ordering::SeqCst);
                });
                // The nested closure must not have run yet.
                assert_eq!(seen.load(Ordering::SeqCst), 0);
                seen.store(1, Ordering::SeqCst);
            });
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
