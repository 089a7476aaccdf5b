use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use rustc_hash::FxHashMap;

/// Kernel optmem disposition. An ENOBUFS from a MSG_ZEROCOPY send can
/// mean optmem pressure rather than generic backpressure; this machine
/// decides when the fd should be woken for writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OptMem {
    Open,
    Full,
    Check,
}

/// One outstanding MSG_ZEROCOPY send. Holds the submitted slices until
/// the kernel acknowledges them on the error queue, plus the resumption
/// offsets for partial sends.
///
/// Refcount protocol: 1 for the outer write, plus 1 per in-flight
/// sendmsg. The buffer is cleared exactly once, when the count hits zero.
pub(crate) struct ZerocopySendRecord {
    refs: AtomicUsize,
    buf: Mutex<SendBuf>,
}

#[derive(Default)]
struct SendBuf {
    slices: Vec<Bytes>,
    slice_idx: usize,
    byte_idx: usize,
}

/// Largest iovec batch per sendmsg.
pub(crate) const MAX_IOVEC: usize = 64;

impl ZerocopySendRecord {
    fn new() -> Self {
        Self {
            refs: AtomicUsize::new(0),
            buf: Mutex::new(SendBuf::default()),
        }
    }

    /// Install the slices for a fresh write. The record must be idle.
    pub(crate) fn prepare(&self, slices: Vec<Bytes>) {
        let prev = self.refs.swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "zerocopy record reused while referenced");
        let mut buf = self.buf.lock().unwrap();
        buf.slices = slices;
        buf.slice_idx = 0;
        buf.byte_idx = 0;
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one ref; on the last one the buffer is released. Returns
    /// true when this call dropped the record to idle.
    fn unref(&self) -> bool {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut buf = self.buf.lock().unwrap();
            buf.slices.clear();
            buf.slice_idx = 0;
            buf.byte_idx = 0;
            true
        } else {
            false
        }
    }

    /// Bytes not yet handed to the kernel.
    pub(crate) fn remaining(&self) -> usize {
        let buf = self.buf.lock().unwrap();
        buf.slices
            .iter()
            .skip(buf.slice_idx)
            .map(|s| s.len())
            .sum::<usize>()
            .saturating_sub(buf.byte_idx)
    }

    /// Fill `iov` from the unsent tail. Returns (entries, bytes).
    ///
    /// The pointers stay valid until the slices are released: `Bytes`
    /// storage is stable and the record keeps the slices alive while any
    /// send is outstanding.
    pub(crate) fn fill_iovec(&self, iov: &mut [libc::iovec; MAX_IOVEC]) -> (usize, usize) {
        let buf = self.buf.lock().unwrap();
        let mut count = 0;
        let mut total = 0;
        let mut byte_idx = buf.byte_idx;
        for slice in buf.slices.iter().skip(buf.slice_idx) {
            if count == MAX_IOVEC {
                break;
            }
            let data = &slice[byte_idx..];
            iov[count] = libc::iovec {
                iov_base: data.as_ptr() as *mut libc::c_void,
                iov_len: data.len(),
            };
            total += data.len();
            count += 1;
            byte_idx = 0;
        }
        (count, total)
    }

    /// Advance the resumption offsets past `sent` bytes.
    pub(crate) fn advance(&self, mut sent: usize) {
        let mut buf = self.buf.lock().unwrap();
        while sent > 0 {
            let slice_len = buf.slices[buf.slice_idx].len() - buf.byte_idx;
            if sent < slice_len {
                buf.byte_idx += sent;
                return;
            }
            sent -= slice_len;
            buf.slice_idx += 1;
            buf.byte_idx = 0;
        }
    }
}

/// Bounded pool of zerocopy send records plus the optmem machine.
pub struct ZerocopyCtx {
    records: Vec<Arc<ZerocopySendRecord>>,
    threshold: usize,
    enabled: bool,
    inner: Mutex<CtxInner>,
}

struct CtxInner {
    free: Vec<usize>,
    by_seq: FxHashMap<u32, usize>,
    last_send: u32,
    shutdown: bool,
    optmem: OptMem,
    write_in_progress: bool,
    memory_limited: bool,
}

impl ZerocopyCtx {
    /// Build a pool of `max_sends` records. If the pool cannot be
    /// allocated, zerocopy is disabled for this context; that is not
    /// fatal.
    pub fn new(enabled: bool, threshold: usize, max_sends: usize) -> Self {
        let mut records = Vec::new();
        let mut enabled = enabled && max_sends > 0;
        if enabled {
            if records.try_reserve_exact(max_sends).is_ok() {
                records.extend((0..max_sends).map(|_| Arc::new(ZerocopySendRecord::new())));
            } else {
                tracing::warn!("zerocopy record pool allocation failed; disabling zerocopy");
                enabled = false;
            }
        }
        let free = (0..records.len()).rev().collect();
        Self {
            records,
            threshold,
            enabled,
            inner: Mutex::new(CtxInner {
                free,
                by_seq: FxHashMap::default(),
                last_send: 0,
                shutdown: false,
                optmem: OptMem::Open,
                write_in_progress: false,
                memory_limited: false,
            }),
        }
    }

    /// Whether this context may be used at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Writes below this size take the plain sendmsg path.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub(crate) fn record(&self, idx: usize) -> Arc<ZerocopySendRecord> {
        self.records[idx].clone()
    }

    /// Pull a record off the free list; `None` when exhausted or shut
    /// down (the caller falls back to a plain send).
    pub(crate) fn get_send_record(&self, slices: Vec<Bytes>) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        let idx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return None;
            }
            inner.free.pop()?
        };
        self.records[idx].prepare(slices);
        Some(idx)
    }

    /// Assign the next sequence number to `idx` ahead of a sendmsg.
    pub(crate) fn note_send(&self, idx: usize) {
        self.records[idx].add_ref();
        let mut inner = self.inner.lock().unwrap();
        inner.last_send = inner.last_send.wrapping_add(1);
        let seq = inner.last_send;
        inner.by_seq.insert(seq, idx);
    }

    /// Roll back the most recent `note_send` after a failed sendmsg.
    pub(crate) fn undo_send(&self) {
        let idx = {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.last_send;
            inner.last_send = inner.last_send.wrapping_sub(1);
            inner.by_seq.remove(&seq)
        };
        if let Some(idx) = idx {
            self.release_ref(idx);
        }
    }

    /// The kernel acknowledged sequence `seq` on the error queue.
    pub(crate) fn release_send_record(&self, seq: u32) {
        let idx = self.inner.lock().unwrap().by_seq.remove(&seq);
        match idx {
            Some(idx) => self.release_ref(idx),
            None => tracing::error!(seq, "zerocopy completion for unknown sequence"),
        }
    }

    /// Drop the write-level ref taken by `get_send_record`.
    pub(crate) fn release_write_ref(&self, idx: usize) {
        self.release_ref(idx);
    }

    fn release_ref(&self, idx: usize) {
        if self.records[idx].unref() {
            self.inner.lock().unwrap().free.push(idx);
        }
    }

    /// Mark that a sendmsg is being issued; pairs with
    /// [`Self::update_after_send`].
    pub(crate) fn enter_write(&self) {
        self.inner.lock().unwrap().write_in_progress = true;
    }

    /// Fold the outcome of a sendmsg into the optmem machine. Returns
    /// `(wake_writable, was_resource_constrained)`.
    pub(crate) fn update_after_send(&self, seen_enobufs: bool) -> (bool, bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_in_progress = false;
        let mut constrained = false;
        if seen_enobufs {
            let outstanding = self.records.len() - inner.free.len();
            if outstanding == 1 {
                // A single outstanding record hitting ENOBUFS means the
                // process itself lacks memlock budget, not the socket.
                constrained = true;
                inner.memory_limited = true;
            }
            if inner.optmem == OptMem::Check {
                // A completion already freed optmem while we were in
                // sendmsg; the fd can make progress right away.
                inner.optmem = OptMem::Open;
                return (true, constrained);
            }
            inner.optmem = OptMem::Full;
            return (false, constrained);
        }
        if inner.optmem != OptMem::Open {
            inner.optmem = OptMem::Open;
        }
        (false, constrained)
    }

    /// A zerocopy completion freed optmem space. Returns whether the fd
    /// should be woken for writing.
    pub(crate) fn update_after_optmem_free(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.write_in_progress {
            inner.optmem = OptMem::Check;
            return false;
        }
        match inner.optmem {
            OptMem::Full => {
                inner.optmem = OptMem::Open;
                true
            }
            OptMem::Open => false,
            OptMem::Check => {
                debug_assert!(false, "optmem CHECK with no write in progress");
                tracing::error!("optmem CHECK with no write in progress");
                inner.optmem = OptMem::Open;
                true
            }
        }
    }

    /// Whether the process was ever observed to be memlock-constrained.
    pub fn memory_limited(&self) -> bool {
        self.inner.lock().unwrap().memory_limited
    }

    /// Stop handing out records. In-flight completions still drain.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
    }

    /// True when every record is back on the free list.
    pub fn all_records_empty(&self) -> bool {
        self.inner.lock().unwrap().free.len() == self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slices(n: usize) -> Vec<Bytes> {
        vec![Bytes::from(vec![0xa5; n])]
    }

    #[test]
    fn pool_accounting() {
        let ctx = ZerocopyCtx::new(true, 1024, 2);
        assert!(ctx.all_records_empty());
        let a = ctx.get_send_record(slices(16)).unwrap();
        let b = ctx.get_send_record(slices(16)).unwrap();
        assert!(ctx.get_send_record(slices(16)).is_none());
        assert!(!ctx.all_records_empty());

        // One sendmsg per record, both acknowledged by the kernel.
        ctx.note_send(a);
        ctx.note_send(b);
        ctx.release_send_record(1);
        ctx.release_send_record(2);
        assert!(!ctx.all_records_empty());
        ctx.release_write_ref(a);
        ctx.release_write_ref(b);
        assert!(ctx.all_records_empty());
        assert_eq!(ctx.record(a).remaining(), 0);
    }

    #[test]
    fn undo_send_rolls_back_sequence() {
        let ctx = ZerocopyCtx::new(true, 1024, 1);
        let idx = ctx.get_send_record(slices(8)).unwrap();
        ctx.note_send(idx);
        ctx.undo_send();
        // The next send must reuse the rolled-back sequence number.
        ctx.note_send(idx);
        ctx.release_send_record(1);
        ctx.release_write_ref(idx);
        assert!(ctx.all_records_empty());
    }

    #[test]
    fn partial_send_resumption() {
        let ctx = ZerocopyCtx::new(true, 1024, 1);
        let idx = ctx
            .get_send_record(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")])
            .unwrap();
        let record = ctx.record(idx);
        assert_eq!(record.remaining(), 10);
        record.advance(7);
        assert_eq!(record.remaining(), 3);
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_IOVEC];
        let (count, total) = record.fill_iovec(&mut iov);
        assert_eq!(count, 1);
        assert_eq!(total, 3);
        ctx.release_write_ref(idx);
    }

    #[test]
    fn optmem_full_then_wake() {
        let ctx = ZerocopyCtx::new(true, 1024, 2);
        let a = ctx.get_send_record(slices(8)).unwrap();
        let _b = ctx.get_send_record(slices(8)).unwrap();
        ctx.note_send(a);

        ctx.enter_write();
        let (wake, constrained) = ctx.update_after_send(true);
        assert!(!wake);
        // Two records outstanding, so not a memlock problem.
        assert!(!constrained);

        // Completion with no active sendmsg: FULL -> OPEN, wake.
        assert!(ctx.update_after_optmem_free());
        // Already OPEN: no wake.
        assert!(!ctx.update_after_optmem_free());
    }

    #[test]
    fn optmem_check_during_write() {
        let ctx = ZerocopyCtx::new(true, 1024, 1);
        let idx = ctx.get_send_record(slices(8)).unwrap();
        ctx.note_send(idx);

        ctx.enter_write();
        // Completion lands while the sendmsg is still on the stack.
        assert!(!ctx.update_after_optmem_free());
        // The sendmsg then reports ENOBUFS: CHECK means space already
        // freed, so the fd is woken immediately.
        let (wake, constrained) = ctx.update_after_send(true);
        assert!(wake);
        assert!(constrained);
        assert!(ctx.memory_limited());
    }

    #[test]
    fn disabled_context_hands_out_nothing() {
        let ctx = ZerocopyCtx::new(false, 1024, 4);
        assert!(!ctx.enabled());
        assert!(ctx.get_send_record(slices(8)).is_none());

        let ctx = ZerocopyCtx::new(true, 1024, 2);
        ctx.shutdown();
        assert!(ctx.get_send_record(slices(8)).is_none());
    }
}
