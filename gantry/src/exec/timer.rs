use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;

type Closure = Box<dyn FnOnce() + Send>;

/// Identifies a timer armed with [`TimerDriver::run_after`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle {
    id: u64,
}

/// A deadline-ordered timer wheel driven by a dedicated thread.
///
/// Callbacks fire on the driver thread; callers that need serialized
/// execution re-dispatch into their own [`super::WorkSerializer`].
pub struct TimerDriver {
    state: Mutex<State>,
    cond: Condvar,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct State {
    // Deadlines, earliest first. Cancelled ids stay in the heap and are
    // skipped when popped; `callbacks` is the source of truth.
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: FxHashMap<u64, Closure>,
    next_id: u64,
    shutdown: bool,
}

impl TimerDriver {
    /// Spawn the driver thread.
    pub fn new() -> std::sync::Arc<Self> {
        let driver = std::sync::Arc::new(Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                callbacks: FxHashMap::default(),
                next_id: 1,
                shutdown: false,
            }),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        });
        let worker_driver = driver.clone();
        let handle = thread::Builder::new()
            .name("gantry-timer".into())
            .spawn(move || worker_driver.run_loop())
            .expect("failed to spawn timer thread");
        *driver.worker.lock().unwrap() = Some(handle);
        driver
    }

    /// Arm a one-shot timer `delay` from now.
    pub fn run_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse((deadline, id)));
        state.callbacks.insert(id, Box::new(f));
        self.cond.notify_one();
        TimerHandle { id }
    }

    /// Cancel a pending timer. Returns false once the timer has fired or
    /// was already cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        state.callbacks.remove(&handle.id).is_some()
    }

    /// Stop the driver thread. Pending timers never fire.
    pub fn shutdown(&self) {
        let worker = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            state.callbacks.clear();
            self.cond.notify_one();
            self.worker.lock().unwrap().take()
        };
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    fn run_loop(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            match state.heap.peek().copied() {
                None => {
                    state = self.cond.wait(state).unwrap();
                }
                Some(Reverse((deadline, id))) => {
                    if !state.callbacks.contains_key(&id) {
                        // Cancelled; discard the stale heap entry.
                        state.heap.pop();
                        continue;
                    }
                    if deadline > now {
                        let (next, _) = self
                            .cond
                            .wait_timeout(state, deadline - now)
                            .unwrap();
                        state = next;
                        continue;
                    }
                    state.heap.pop();
                    if let Some(callback) = state.callbacks.remove(&id) {
                        drop(state);
                        callback();
                        state = self.state.lock().unwrap();
                    }
                }
            }
        }
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        let worker = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            self.cond.notify_one();
            self.worker.lock().unwrap().take()
        };
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    };

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let driver = TimerDriver::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        driver.run_after(Duration::from_millis(40), move || tx2.send(2).unwrap());
        driver.run_after(Duration::from_millis(10), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn cancel_prevents_fire() {
        let driver = TimerDriver::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = driver.run_after(Duration::from_millis(50), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(driver.cancel(handle));
        assert!(!driver.cancel(handle));
        thread::sleep(Duration::from_millis(120));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
