use std::{
    io,
    ops,
    os::unix::io::RawFd,
    sync::{Arc, Mutex},
    thread,
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};

use super::fd::FdHandle;
use crate::{utils::slab::Slab, Status};

const READABLE: u8 = 0b0_0001;
const WRITABLE: u8 = 0b0_0010;
const READ_CLOSED: u8 = 0b0_0100;
const WRITE_CLOSED: u8 = 0b0_1000;
const ERROR: u8 = 0b1_0000;

/// Readiness bits cached per registration between poll wakeups.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Ready(u8);

impl Ready {
    const EMPTY: Ready = Ready(0);
    const READABLE: Ready = Ready(READABLE);
    const WRITABLE: Ready = Ready(WRITABLE);
    const READ_CLOSED: Ready = Ready(READ_CLOSED);
    const WRITE_CLOSED: Ready = Ready(WRITE_CLOSED);
    const ERROR: Ready = Ready(ERROR);

    fn from_mio(event: &mio::event::Event) -> Ready {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_read_closed() {
            ready |= Ready::READ_CLOSED;
        }
        if event.is_write_closed() {
            ready |= Ready::WRITE_CLOSED;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        ready
    }

    fn is_empty(self) -> bool {
        self == Ready::EMPTY
    }

    fn wakes_read(self) -> bool {
        !(self & Ready(READABLE | READ_CLOSED | ERROR)).is_empty()
    }

    fn wakes_write(self) -> bool {
        !(self & Ready(WRITABLE | WRITE_CLOSED | ERROR)).is_empty()
    }

    // Closed bits stay out of this mask: error arms are re-armed in a
    // loop, and a sticky hangup bit would spin it.
    fn wakes_error(self) -> bool {
        !(self & Ready::ERROR).is_empty()
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;
    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;
    fn not(self) -> Ready {
        Ready(!self.0)
    }
}

/// Closure invoked when the awaited readiness fires. Runs on the poller
/// thread.
pub type ReadinessCallback = Box<dyn FnOnce() + Send>;

/// Receives the released raw fd when a handle is orphaned; ownership of
/// the fd transfers to the callback.
pub type ReleaseFdCallback = Box<dyn FnOnce(io::Result<RawFd>) + Send>;

/// One registration of an fd with a poller. One handle per fd.
pub trait PollerHandle: Send + Sync {
    /// Arm a one-shot read-readiness callback. Fires immediately when
    /// readiness is already cached.
    fn notify_on_read(&self, on_ready: ReadinessCallback);
    /// Arm a one-shot write-readiness callback.
    fn notify_on_write(&self, on_ready: ReadinessCallback);
    /// Arm a one-shot error callback (error queue or hangup).
    fn notify_on_error(&self, on_ready: ReadinessCallback);
    /// Wake every armed callback and fail future arms immediately.
    fn shutdown(&self, why: &Status);
    /// Deregister the fd and hand it back through `on_release`.
    fn orphan(&self, on_release: ReleaseFdCallback);
}

/// Readiness multiplexer consumed by the endpoint and listener.
pub trait Poller: Send + Sync {
    /// Register `fd` and return its handle.
    fn create_handle(
        &self,
        fd: FdHandle,
        name: &str,
        track_errors: bool,
    ) -> io::Result<Arc<dyn PollerHandle>>;
}

const TOKEN_WAKEUP: Token = Token(1 << 31);

/// Default poller: a mio `Poll` driven by a dedicated thread, with slab
/// tokens mapping events back to registrations.
pub struct EventPoller {
    shared: Arc<PollerShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct PollerShared {
    registry: mio::Registry,
    waker: Waker,
    state: Mutex<PollerState>,
}

struct PollerState {
    slab: Slab<Entry>,
    shutdown: bool,
}

struct Entry {
    readiness: Ready,
    shutdown: bool,
    read_cb: Option<ReadinessCallback>,
    write_cb: Option<ReadinessCallback>,
    error_cb: Option<ReadinessCallback>,
}

impl Entry {
    fn new() -> Self {
        Self {
            readiness: Ready::EMPTY,
            shutdown: false,
            read_cb: None,
            write_cb: None,
            error_cb: None,
        }
    }

    // Pull out every callback that the cached readiness can satisfy.
    // Readable/writable bits are consumed; closed bits stay sticky so
    // late arms keep firing. Shutdown wakes read/write arms so pending
    // operations can observe it, but not the error arm: the error
    // queue may still owe completions that only arrive with real
    // error readiness, and a forced wake would spin that loop.
    fn take_ready(&mut self, fired: &mut Vec<ReadinessCallback>) {
        if (self.shutdown || self.readiness.wakes_read()) && self.read_cb.is_some() {
            self.readiness = self.readiness & !Ready::READABLE;
            fired.extend(self.read_cb.take());
        }
        if (self.shutdown || self.readiness.wakes_write()) && self.write_cb.is_some() {
            self.readiness = self.readiness & !Ready::WRITABLE;
            fired.extend(self.write_cb.take());
        }
        if self.readiness.wakes_error() && self.error_cb.is_some() {
            self.readiness = self.readiness & !Ready::ERROR;
            fired.extend(self.error_cb.take());
        }
    }
}

impl EventPoller {
    const DEFAULT_EVENTS: usize = 1024;

    /// Spawn the poll thread.
    pub fn new() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), TOKEN_WAKEUP)?;
        let shared = Arc::new(PollerShared {
            registry,
            waker,
            state: Mutex::new(PollerState {
                slab: Slab::new(),
                shutdown: false,
            }),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("gantry-poller".into())
            .spawn(move || run_poll_loop(poll, worker_shared))?;
        Ok(Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Stop the poll thread. Registered handles stop firing.
    pub fn shutdown(&self) {
        self.shared.state.lock().unwrap().shutdown = true;
        let _ = self.shared.waker.wake();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_poll_loop(mut poll: Poll, shared: Arc<PollerShared>) {
    let mut events = Events::with_capacity(EventPoller::DEFAULT_EVENTS);
    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "poller failed; stopping");
                return;
            }
        }
        let mut fired = Vec::new();
        {
            let mut state = shared.state.lock().unwrap();
            for event in events.iter() {
                if event.token() == TOKEN_WAKEUP {
                    if state.shutdown {
                        return;
                    }
                    continue;
                }
                if let Some(entry) = state.slab.get_mut(event.token().0) {
                    entry.readiness |= Ready::from_mio(event);
                    entry.take_ready(&mut fired);
                }
            }
        }
        for callback in fired {
            callback();
        }
    }
}

impl Poller for EventPoller {
    fn create_handle(
        &self,
        fd: FdHandle,
        name: &str,
        track_errors: bool,
    ) -> io::Result<Arc<dyn PollerHandle>> {
        let raw = fd.raw_fd();
        let token = {
            let mut state = self.shared.state.lock().unwrap();
            state.slab.insert(Entry::new())
        };
        let mut source = SourceFd(&raw);
        if let Err(e) = self.shared.registry.register(
            &mut source,
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.shared.state.lock().unwrap().slab.try_remove(token);
            return Err(e);
        }
        tracing::trace!(name, fd = raw, token, track_errors, "registered fd");
        Ok(Arc::new(MioHandle {
            shared: self.shared.clone(),
            token,
            fd: raw,
        }))
    }
}

struct MioHandle {
    shared: Arc<PollerShared>,
    token: usize,
    fd: RawFd,
}

impl MioHandle {
    fn arm(&self, slot: fn(&mut Entry) -> &mut Option<ReadinessCallback>, cb: ReadinessCallback) {
        let mut fired = Vec::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            match state.slab.get_mut(self.token) {
                Some(entry) => {
                    let prev = slot(entry).replace(cb);
                    debug_assert!(prev.is_none(), "double-armed poller callback");
                    entry.take_ready(&mut fired);
                }
                // Orphaned registration: wake the caller so it observes
                // the endpoint state instead of hanging forever.
                None => fired.push(cb),
            }
        }
        for callback in fired {
            callback();
        }
    }
}

impl PollerHandle for MioHandle {
    fn notify_on_read(&self, on_ready: ReadinessCallback) {
        self.arm(|entry| &mut entry.read_cb, on_ready);
    }

    fn notify_on_write(&self, on_ready: ReadinessCallback) {
        self.arm(|entry| &mut entry.write_cb, on_ready);
    }

    fn notify_on_error(&self, on_ready: ReadinessCallback) {
        self.arm(|entry| &mut entry.error_cb, on_ready);
    }

    fn shutdown(&self, why: &Status) {
        tracing::trace!(fd = self.fd, %why, "poller handle shutdown");
        let mut fired = Vec::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(entry) = state.slab.get_mut(self.token) {
                entry.shutdown = true;
                entry.take_ready(&mut fired);
            }
        }
        for callback in fired {
            callback();
        }
    }

    fn orphan(&self, on_release: ReleaseFdCallback) {
        let mut fired = Vec::new();
        let removed = {
            let mut state = self.shared.state.lock().unwrap();
            state.slab.try_remove(self.token)
        };
        if let Some(mut entry) = removed {
            entry.shutdown = true;
            entry.take_ready(&mut fired);
            let mut source = SourceFd(&self.fd);
            let _ = self.shared.registry.deregister(&mut source);
        }
        for callback in fired {
            callback();
        }
        on_release(Ok(self.fd));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::posix::{FdRegistry, SocketOps};

    #[test]
    fn pipe_readiness_fires() {
        let ops = SocketOps::new(Arc::new(FdRegistry::new(true)));
        let poller = EventPoller::new().unwrap();
        let (rd, wr) = ops.pipe().unwrap();
        let handle = poller.create_handle(rd, "pipe-read", false).unwrap();

        let (tx, rx) = mpsc::channel();
        handle.notify_on_read(Box::new(move || tx.send(()).unwrap()));
        ops.write(wr, b"x").unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        handle.orphan(Box::new(move |fd| tx.send(fd.unwrap()).unwrap()));
        let released = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(released, rd.raw_fd());
        assert!(ops.close(rd));
        assert!(ops.close(wr));
    }

    #[test]
    fn shutdown_wakes_armed_callbacks() {
        let ops = SocketOps::new(Arc::new(FdRegistry::new(true)));
        let poller = EventPoller::new().unwrap();
        let (rd, _wr) = ops.pipe().unwrap();
        let handle = poller.create_handle(rd, "pipe-read", false).unwrap();

        let (tx, rx) = mpsc::channel();
        handle.notify_on_read(Box::new(move || tx.send(()).unwrap()));
        handle.shutdown(&Status::unavailable("going away"));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
