use std::{
    collections::VecDeque,
    mem,
    net::SocketAddr,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use bytes::{Bytes, BytesMut};

use super::{
    fd::{FdHandle, PosixError},
    options::TcpOptions,
    poller::{Poller, PollerHandle},
    sys::SocketOps,
    zerocopy::{ZerocopyCtx, MAX_IOVEC},
};
use crate::{
    exec::WorkSerializer,
    mem::MemoryAllocator,
    Status,
};

// TODO: use libc consts once exposed there.
const SO_TIMESTAMPING: libc::c_int = 37;
const SCM_TIMESTAMPING: libc::c_int = 37;
const TCP_INQ: libc::c_int = 36;
const MSG_ZEROCOPY: libc::c_int = 0x400_0000;
const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
const SCM_TSTAMP_SCHED: u32 = 1;
const SCM_TSTAMP_SND: u32 = 0;
const SCM_TSTAMP_ACK: u32 = 2;

const SOF_TIMESTAMPING_TX_SOFTWARE: libc::c_int = 1 << 1;
const SOF_TIMESTAMPING_SOFTWARE: libc::c_int = 1 << 4;
const SOF_TIMESTAMPING_OPT_ID: libc::c_int = 1 << 7;
const SOF_TIMESTAMPING_TX_SCHED: libc::c_int = 1 << 8;
const SOF_TIMESTAMPING_TX_ACK: libc::c_int = 1 << 9;
const SOF_TIMESTAMPING_OPT_TSONLY: libc::c_int = 1 << 11;

const TIMESTAMPING_FLAGS: libc::c_int = SOF_TIMESTAMPING_TX_SOFTWARE
    | SOF_TIMESTAMPING_SOFTWARE
    | SOF_TIMESTAMPING_OPT_ID
    | SOF_TIMESTAMPING_TX_SCHED
    | SOF_TIMESTAMPING_TX_ACK
    | SOF_TIMESTAMPING_OPT_TSONLY;

/// Which stage of transmission a timestamp refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampKind {
    /// Queued to the NIC.
    Scheduled,
    /// Left the host.
    Sent,
    /// Acknowledged by the peer.
    Acked,
}

/// Receives write timestamps decoded from the socket error queue.
pub trait TimestampsObserver: Send + Sync {
    /// `byte_offset` is the cumulative number of bytes written to this
    /// endpoint when the traced write completed.
    fn on_timestamp(&self, byte_offset: u64, kind: TimestampKind, when: SystemTime);
}

/// Completion for [`TcpEndpoint::read`].
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes, Status>) + Send>;
/// Completion for [`TcpEndpoint::write`].
pub type WriteCallback = Box<dyn FnOnce(Result<(), Status>) + Send>;

/// Arguments to [`TcpEndpoint::read`].
#[derive(Clone, Copy, Debug)]
pub struct ReadArgs {
    /// Read until at least this many bytes are buffered (or EOF).
    pub min_progress_size: usize,
}

impl Default for ReadArgs {
    fn default() -> Self {
        Self {
            min_progress_size: 1,
        }
    }
}

/// Arguments to [`TcpEndpoint::write`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteArgs {
    /// Trace this write's transmission timestamps.
    pub want_timestamps: bool,
}

/// A connected TCP endpoint.
///
/// Reads and writes either complete synchronously (the call returns
/// `Some`) or suspend on the poller and deliver through the callback on
/// the endpoint's work serializer. At most one read and one write may be
/// outstanding at a time.
pub struct TcpEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    ops: SocketOps,
    fd: FdHandle,
    handle: Arc<dyn PollerHandle>,
    serializer: Arc<WorkSerializer>,
    options: TcpOptions,
    allocator: Arc<dyn MemoryAllocator>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    zerocopy: ZerocopyCtx,
    track_errors: bool,
    inq_enabled: bool,
    // Adaptive read target. Atomic so the memory reclaimer can shrink
    // it without taking the read lock.
    target_length: AtomicUsize,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    shutdown: Mutex<ShutdownState>,
    observer: Mutex<Option<Arc<dyn TimestampsObserver>>>,
    traced: Mutex<VecDeque<u32>>,
    bytes_written: AtomicU64,
}

struct ReadState {
    staging: BytesMut,
    eof: bool,
    eof_delivered: bool,
    pending: Option<PendingRead>,
}

struct PendingRead {
    on_done: ReadCallback,
    min_progress: usize,
}

struct WriteState {
    pending: Option<PendingWrite>,
}

struct PendingWrite {
    on_done: WriteCallback,
    kind: WriteKind,
    want_timestamps: bool,
}

enum WriteKind {
    Plain {
        slices: Vec<Bytes>,
        slice_idx: usize,
        byte_idx: usize,
    },
    Zerocopy {
        record_idx: usize,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Active,
    ShuttingDown,
    Released,
}

struct ShutdownState {
    phase: Phase,
    on_release: Option<Box<dyn FnOnce(Result<RawFd, Status>) + Send>>,
}

enum ReadStep {
    Progress,
    WouldBlock,
    Failed(Status),
}

enum WriteStep {
    Done,
    WouldBlock,
    // Zerocopy hit optmem pressure; wait for an error-queue wake unless
    // the machine said to retry immediately.
    Throttled { retry_now: bool },
    Failed(Status),
}

impl TcpEndpoint {
    /// Wrap a connected socket. `pending_data`, if any, is delivered
    /// ahead of the socket stream (externally accepted connections).
    pub fn new(
        ops: SocketOps,
        fd: FdHandle,
        poller: &Arc<dyn Poller>,
        serializer: Arc<WorkSerializer>,
        allocator: Arc<dyn MemoryAllocator>,
        options: TcpOptions,
        pending_data: Option<Bytes>,
    ) -> Result<Self, Status> {
        let peer_addr = ops.peer_addr(fd).map_err(posix_to_status)?;
        let local_addr = ops.local_addr(fd).map_err(posix_to_status)?;
        // Only honor the zerocopy request if SO_ZEROCOPY actually took
        // on this socket; otherwise MSG_ZEROCOPY sends would fail.
        let zerocopy_usable = options.zerocopy_enabled
            && ops
                .getsockopt_int(fd, libc::SOL_SOCKET, super::sys::SO_ZEROCOPY)
                .map(|v| v == 1)
                .unwrap_or(false);
        let zerocopy = ZerocopyCtx::new(
            zerocopy_usable,
            options.zerocopy_send_bytes_threshold,
            options.zerocopy_max_simultaneous_sends,
        );
        let track_errors = cfg!(target_os = "linux");
        let inq_enabled = cfg!(target_os = "linux")
            && ops.setsockopt_int(fd, libc::IPPROTO_TCP, TCP_INQ, 1).is_ok();
        let handle = poller
            .create_handle(fd, "tcp-endpoint", track_errors)
            .map_err(|e| Status::from(e))?;
        let mut staging = BytesMut::new();
        if let Some(data) = pending_data {
            staging.extend_from_slice(&data);
        }
        let options = options.finalize();
        let inner = Arc::new(EndpointInner {
            target_length: AtomicUsize::new(options.read_chunk_size),
            read: Mutex::new(ReadState {
                staging,
                eof: false,
                eof_delivered: false,
                pending: None,
            }),
            write: Mutex::new(WriteState { pending: None }),
            shutdown: Mutex::new(ShutdownState {
                phase: Phase::Active,
                on_release: None,
            }),
            observer: Mutex::new(None),
            traced: Mutex::new(VecDeque::new()),
            bytes_written: AtomicU64::new(0),
            ops,
            fd,
            handle,
            serializer,
            options,
            allocator,
            peer_addr,
            local_addr,
            zerocopy,
            track_errors,
            inq_enabled,
        });
        if inner.track_errors {
            EndpointInner::arm_error_loop(&inner);
        }
        // Under memory pressure, shrink the next read target so the
        // allocator gets smaller reservations to refuse.
        let reclaim = Arc::downgrade(&inner);
        inner.allocator.post_reclaimer(Box::new(move || {
            if let Some(inner) = reclaim.upgrade() {
                inner
                    .target_length
                    .store(inner.options.min_read_chunk_size, Ordering::Relaxed);
            }
        }));
        Ok(Self { inner })
    }

    /// Peer address.
    pub fn peer_address(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Local address.
    pub fn local_address(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Whether this endpoint consumes the socket error queue.
    pub fn can_track_errors(&self) -> bool {
        self.inner.track_errors
    }

    /// Install the timestamps observer and enable SO_TIMESTAMPING.
    /// Only effective when the endpoint tracks errors.
    pub fn set_timestamps_observer(
        &self,
        observer: Arc<dyn TimestampsObserver>,
    ) -> Result<(), Status> {
        if !self.inner.track_errors {
            return Err(Status::failed_precondition(
                "endpoint does not track errors",
            ));
        }
        self.inner
            .ops
            .setsockopt_int(
                self.inner.fd,
                libc::SOL_SOCKET,
                SO_TIMESTAMPING,
                TIMESTAMPING_FLAGS,
            )
            .map_err(posix_to_status)?;
        *self.inner.observer.lock().unwrap() = Some(observer);
        Ok(())
    }

    /// Read at least `args.min_progress_size` bytes. `Some` means the
    /// read completed synchronously and `on_done` will not run.
    pub fn read(&self, on_done: ReadCallback, args: ReadArgs) -> Option<Result<Bytes, Status>> {
        if let Some(status) = self.inner.shutdown_status() {
            return Some(Err(status));
        }
        let min_progress = args.min_progress_size.max(1);
        let mut state = self.inner.read.lock().unwrap();
        if state.pending.is_some() {
            return Some(Err(Status::internal("read already in progress")));
        }
        match self.inner.read_until_blocked(&mut state, min_progress) {
            Some(result) => Some(result),
            None => {
                state.pending = Some(PendingRead {
                    on_done,
                    min_progress,
                });
                drop(state);
                EndpointInner::arm_read(&self.inner);
                None
            }
        }
    }

    /// Write `data`. `Some` means the write completed synchronously and
    /// `on_done` will not run. Completion means the bytes were handed to
    /// the kernel; zerocopy buffers are retained until acknowledged.
    pub fn write(
        &self,
        on_done: WriteCallback,
        data: Vec<Bytes>,
        args: WriteArgs,
    ) -> Option<Result<(), Status>> {
        if let Some(status) = self.inner.shutdown_status() {
            return Some(Err(status));
        }
        let mut state = self.inner.write.lock().unwrap();
        if state.pending.is_some() {
            return Some(Err(Status::internal("write already in progress")));
        }
        let total: usize = data.iter().map(|s| s.len()).sum();
        let kind = if self.inner.zerocopy.enabled() && total >= self.inner.zerocopy.threshold() {
            match self.inner.zerocopy.get_send_record(data.clone()) {
                Some(record_idx) => WriteKind::Zerocopy { record_idx },
                // Pool exhausted under pressure; fall back to plain.
                None => WriteKind::Plain {
                    slices: data,
                    slice_idx: 0,
                    byte_idx: 0,
                },
            }
        } else {
            WriteKind::Plain {
                slices: data,
                slice_idx: 0,
                byte_idx: 0,
            }
        };
        let mut pending = PendingWrite {
            on_done,
            kind,
            want_timestamps: args.want_timestamps,
        };
        match self.inner.write_until_blocked(&mut pending) {
            WriteStep::Done => Some(Ok(())),
            WriteStep::Failed(status) => Some(Err(status)),
            WriteStep::WouldBlock => {
                state.pending = Some(pending);
                drop(state);
                EndpointInner::arm_write(&self.inner);
                None
            }
            WriteStep::Throttled { retry_now } => {
                state.pending = Some(pending);
                drop(state);
                if retry_now {
                    let inner = self.inner.clone();
                    self.inner
                        .serializer
                        .run(move || EndpointInner::continue_write(&inner));
                }
                None
            }
        }
    }

    /// Idempotent shutdown. Pending operations fail with
    /// `FailedPrecondition`; the fd is released to `on_release` exactly
    /// once, after in-flight zerocopy sends drain. Later calls do not
    /// deliver.
    pub fn maybe_shutdown(
        &self,
        why: Status,
        on_release: impl FnOnce(Result<RawFd, Status>) + Send + 'static,
    ) {
        {
            let mut shutdown = self.inner.shutdown.lock().unwrap();
            if shutdown.phase != Phase::Active {
                tracing::debug!(%why, "endpoint already shutting down");
                return;
            }
            shutdown.phase = Phase::ShuttingDown;
            shutdown.on_release = Some(Box::new(on_release));
        }
        self.inner.fail_pending_ops();
        self.inner.zerocopy.shutdown();
        self.inner.handle.shutdown(&why);
        EndpointInner::maybe_release(&self.inner);
    }
}

impl EndpointInner {
    fn shutdown_status(&self) -> Option<Status> {
        let shutdown = self.shutdown.lock().unwrap();
        match shutdown.phase {
            Phase::Active => None,
            _ => Some(Status::failed_precondition("Endpoint closing")),
        }
    }

    fn fail_pending_ops(&self) {
        let status = Status::failed_precondition("Endpoint closing");
        let read_cb = self.read.lock().unwrap().pending.take();
        let write_cb = self.write.lock().unwrap().pending.take();
        if let Some(pending) = read_cb {
            let status = status.clone();
            let on_done = pending.on_done;
            self.serializer.run(move || on_done(Err(status)));
        }
        if let Some(pending) = write_cb {
            let PendingWrite { on_done, kind, .. } = pending;
            if let WriteKind::Zerocopy { record_idx } = kind {
                self.zerocopy.release_write_ref(record_idx);
            }
            self.serializer.run(move || on_done(Err(status)));
        }
    }

    // Release the fd once zerocopy records drained and shutdown started.
    fn maybe_release(this: &Arc<Self>) {
        if !this.zerocopy.all_records_empty() {
            return;
        }
        let on_release = {
            let mut shutdown = this.shutdown.lock().unwrap();
            if shutdown.phase != Phase::ShuttingDown {
                return;
            }
            shutdown.phase = Phase::Released;
            shutdown.on_release.take()
        };
        let Some(on_release) = on_release else { return };
        let fd = this.fd;
        let registry_ok = this.ops.registry().close(fd);
        let this2 = this.clone();
        this.handle.orphan(Box::new(move |released| {
            let result = if registry_ok {
                released.map_err(Status::from)
            } else {
                Err(Status::failed_precondition(
                    "fd belongs to a previous generation",
                ))
            };
            this2.serializer.run(move || on_release(result));
        }));
    }

    fn arm_read(this: &Arc<Self>) {
        let weak = this.clone();
        this.handle.notify_on_read(Box::new(move || {
            EndpointInner::continue_read(&weak);
        }));
    }

    fn arm_write(this: &Arc<Self>) {
        let weak = this.clone();
        this.handle.notify_on_write(Box::new(move || {
            EndpointInner::continue_write(&weak);
        }));
    }

    fn arm_error_loop(this: &Arc<Self>) {
        let weak = this.clone();
        this.handle.notify_on_error(Box::new(move || {
            EndpointInner::process_error_queue(&weak);
        }));
    }

    fn continue_read(this: &Arc<Self>) {
        if this.shutdown_status().is_some() {
            // A pending callback, if any, was failed by the shutdown.
            return;
        }
        let mut state = this.read.lock().unwrap();
        let Some(pending) = state.pending.take() else {
            return;
        };
        match this.read_until_blocked(&mut state, pending.min_progress) {
            Some(result) => {
                drop(state);
                let serializer = this.serializer.clone();
                serializer.run(move || (pending.on_done)(result));
            }
            None => {
                state.pending = Some(pending);
                drop(state);
                EndpointInner::arm_read(this);
            }
        }
    }

    // Pull bytes until `min_progress` is buffered, EOF, or EAGAIN.
    // Returns None when the caller should suspend on the poller.
    fn read_until_blocked(
        &self,
        state: &mut ReadState,
        min_progress: usize,
    ) -> Option<Result<Bytes, Status>> {
        loop {
            if state.staging.len() >= min_progress {
                return Some(Ok(state.staging.split().freeze()));
            }
            if state.eof {
                if !state.staging.is_empty() {
                    return Some(Ok(state.staging.split().freeze()));
                }
                if !state.eof_delivered {
                    state.eof_delivered = true;
                    return Some(Ok(Bytes::new()));
                }
                return Some(Err(Status::unavailable("connection closed by peer")));
            }
            match self.read_once(state) {
                ReadStep::Progress => continue,
                ReadStep::WouldBlock => return None,
                ReadStep::Failed(status) => return Some(Err(status)),
            }
        }
    }

    fn read_once(&self, state: &mut ReadState) -> ReadStep {
        let target = self.target_length.load(Ordering::Relaxed);
        let Some(_reservation) = self.allocator.reserve(target) else {
            return ReadStep::Failed(Status::resource_exhausted(
                "read buffer reservation failed",
            ));
        };
        state.staging.reserve(target);

        let raw = match self.ops.registry().get(self.fd) {
            Ok(raw) => raw,
            Err(_) => {
                return ReadStep::Failed(Status::failed_precondition(
                    "fd belongs to a previous generation",
                ))
            }
        };

        let spare = state.staging.spare_capacity_mut();
        let mut iov = libc::iovec {
            iov_base: spare.as_mut_ptr() as *mut libc::c_void,
            iov_len: spare.len().min(target),
        };
        let mut control = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if self.inq_enabled {
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len();
        }

        loop {
            let n = unsafe { libc::recvmsg(raw, &mut msg, 0) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => ReadStep::WouldBlock,
                    _ => ReadStep::Failed(read_error_status(err)),
                };
            }
            if n == 0 {
                state.eof = true;
                return ReadStep::Progress;
            }
            let n = n as usize;
            // Safety: recvmsg wrote n bytes into the spare capacity.
            unsafe { state.staging.set_len(state.staging.len() + n) };

            // Adaptive sizing: double when the buffer filled, halve on
            // heavy underutilization.
            if n >= iov.iov_len {
                self.target_length
                    .store((target * 2).min(self.options.max_read_chunk_size), Ordering::Relaxed);
            } else if n < target / 8 {
                self.target_length
                    .store((target / 2).max(self.options.min_read_chunk_size), Ordering::Relaxed);
            }

            if self.inq_enabled {
                if let Some(inq) = parse_inq(&msg) {
                    if inq == 0 {
                        return ReadStep::Progress;
                    }
                }
            }
            return ReadStep::Progress;
        }
    }

    fn continue_write(this: &Arc<Self>) {
        if this.shutdown_status().is_some() {
            return;
        }
        let mut state = this.write.lock().unwrap();
        let Some(mut pending) = state.pending.take() else {
            return;
        };
        match this.write_until_blocked(&mut pending) {
            WriteStep::Done => {
                drop(state);
                let serializer = this.serializer.clone();
                serializer.run(move || (pending.on_done)(Ok(())));
            }
            WriteStep::Failed(status) => {
                drop(state);
                let serializer = this.serializer.clone();
                serializer.run(move || (pending.on_done)(Err(status)));
            }
            WriteStep::WouldBlock => {
                state.pending = Some(pending);
                drop(state);
                EndpointInner::arm_write(this);
            }
            WriteStep::Throttled { retry_now } => {
                state.pending = Some(pending);
                drop(state);
                if retry_now {
                    let inner = this.clone();
                    this.serializer
                        .run(move || EndpointInner::continue_write(&inner));
                }
            }
        }
    }

    fn write_until_blocked(&self, pending: &mut PendingWrite) -> WriteStep {
        let raw = match self.ops.registry().get(self.fd) {
            Ok(raw) => raw,
            Err(_) => {
                return WriteStep::Failed(Status::failed_precondition(
                    "fd belongs to a previous generation",
                ))
            }
        };
        loop {
            let step = match &mut pending.kind {
                WriteKind::Plain {
                    slices,
                    slice_idx,
                    byte_idx,
                } => self.send_plain(raw, slices, slice_idx, byte_idx),
                WriteKind::Zerocopy { record_idx } => self.send_zerocopy(raw, *record_idx),
            };
            match step {
                WriteStep::Done => {
                    if pending.want_timestamps {
                        self.enqueue_traced_write();
                    }
                    return WriteStep::Done;
                }
                WriteStep::WouldBlock => return WriteStep::WouldBlock,
                WriteStep::Throttled { retry_now } => {
                    return WriteStep::Throttled { retry_now }
                }
                WriteStep::Failed(status) => return WriteStep::Failed(status),
            }
        }
    }

    fn send_plain(
        &self,
        raw: RawFd,
        slices: &mut Vec<Bytes>,
        slice_idx: &mut usize,
        byte_idx: &mut usize,
    ) -> WriteStep {
        loop {
            let mut iov = [libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            }; MAX_IOVEC];
            let mut count = 0;
            let mut offset = *byte_idx;
            for slice in slices.iter().skip(*slice_idx) {
                if count == MAX_IOVEC {
                    break;
                }
                let data = &slice[offset..];
                iov[count] = libc::iovec {
                    iov_base: data.as_ptr() as *mut libc::c_void,
                    iov_len: data.len(),
                };
                count += 1;
                offset = 0;
            }
            if count == 0 {
                return WriteStep::Done;
            }
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = count;
            let n = unsafe { libc::sendmsg(raw, &msg, libc::MSG_NOSIGNAL) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => WriteStep::WouldBlock,
                    _ => WriteStep::Failed(write_error_status(err)),
                };
            }
            let mut sent = n as usize;
            self.bytes_written.fetch_add(sent as u64, Ordering::Relaxed);
            while sent > 0 {
                let remaining = slices[*slice_idx].len() - *byte_idx;
                if sent < remaining {
                    *byte_idx += sent;
                    break;
                }
                sent -= remaining;
                *slice_idx += 1;
                *byte_idx = 0;
            }
            if *slice_idx >= slices.len() {
                return WriteStep::Done;
            }
        }
    }

    fn send_zerocopy(&self, raw: RawFd, record_idx: usize) -> WriteStep {
        let record = self.zerocopy.record(record_idx);
        loop {
            if record.remaining() == 0 {
                // All bytes are with the kernel; the record itself lives
                // on until the error queue acknowledges every send.
                self.zerocopy.release_write_ref(record_idx);
                return WriteStep::Done;
            }
            let mut iov = [libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            }; MAX_IOVEC];
            let (count, _total) = record.fill_iovec(&mut iov);
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = count;

            self.zerocopy.enter_write();
            self.zerocopy.note_send(record_idx);
            let n = unsafe { libc::sendmsg(raw, &msg, libc::MSG_NOSIGNAL | MSG_ZEROCOPY) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                self.zerocopy.undo_send();
                match err.raw_os_error() {
                    Some(libc::EINTR) => {
                        self.zerocopy.update_after_send(false);
                        continue;
                    }
                    Some(libc::EAGAIN) => {
                        self.zerocopy.update_after_send(false);
                        return WriteStep::WouldBlock;
                    }
                    Some(libc::ENOBUFS) => {
                        let (wake, constrained) = self.zerocopy.update_after_send(true);
                        if constrained {
                            tracing::warn!(
                                "zerocopy send hit ENOBUFS with one record outstanding; \
                                 process may lack memlock budget"
                            );
                        }
                        return WriteStep::Throttled { retry_now: wake };
                    }
                    _ => {
                        self.zerocopy.update_after_send(false);
                        self.zerocopy.release_write_ref(record_idx);
                        return WriteStep::Failed(write_error_status(err));
                    }
                }
            }
            self.zerocopy.update_after_send(false);
            let sent = n as usize;
            self.bytes_written.fetch_add(sent as u64, Ordering::Relaxed);
            record.advance(sent);
        }
    }

    fn enqueue_traced_write(&self) {
        // SO_TIMESTAMPING OPT_ID counters are byte offsets for TCP.
        let offset = self.bytes_written.load(Ordering::Relaxed);
        self.traced
            .lock()
            .unwrap()
            .push_back(offset.saturating_sub(1) as u32);
    }

    // Drain MSG_ERRQUEUE: zerocopy acknowledgements and write
    // timestamps both arrive here.
    fn process_error_queue(this: &Arc<Self>) {
        let raw = match this.ops.registry().get(this.fd) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let mut wake_writer = false;
        loop {
            let mut control = [0u8; 256];
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len();
            let n = unsafe { libc::recvmsg(raw, &mut msg, libc::MSG_ERRQUEUE) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => break,
                    _ => {
                        tracing::debug!(error = %err, "error queue read failed");
                        break;
                    }
                }
            }
            wake_writer |= this.process_error_cmsgs(&msg);
        }
        if wake_writer {
            let inner = this.clone();
            this.serializer
                .run(move || EndpointInner::continue_write(&inner));
        }
        let phase = this.shutdown.lock().unwrap().phase;
        match phase {
            Phase::Active => EndpointInner::arm_error_loop(this),
            Phase::ShuttingDown => {
                if this.zerocopy.all_records_empty() {
                    EndpointInner::maybe_release(this);
                } else {
                    // Still waiting on zerocopy acknowledgements; keep
                    // draining the error queue until they land.
                    EndpointInner::arm_error_loop(this);
                }
            }
            Phase::Released => {}
        }
    }

    // Returns whether the writer should be woken.
    fn process_error_cmsgs(&self, msg: &libc::msghdr) -> bool {
        let mut wake = false;
        let mut timestamps: Option<[libc::timespec; 3]> = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == SCM_TIMESTAMPING {
                let data = unsafe { libc::CMSG_DATA(cmsg) } as *const [libc::timespec; 3];
                timestamps = Some(unsafe { data.read_unaligned() });
            } else if (hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR)
                || (hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_RECVERR)
            {
                let err = unsafe {
                    (libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err).read_unaligned()
                };
                match err.ee_origin {
                    SO_EE_ORIGIN_ZEROCOPY => {
                        // Acknowledged sequence range is [ee_info, ee_data].
                        let mut seq = err.ee_info;
                        loop {
                            self.zerocopy.release_send_record(seq);
                            if seq == err.ee_data {
                                break;
                            }
                            seq = seq.wrapping_add(1);
                        }
                        wake |= self.zerocopy.update_after_optmem_free();
                    }
                    SO_EE_ORIGIN_TIMESTAMPING => {
                        if let Some(ts) = timestamps.take() {
                            self.deliver_timestamp(err.ee_info, err.ee_data, ts);
                        }
                    }
                    _ => {}
                }
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
        }
        wake
    }

    fn deliver_timestamp(&self, tstype: u32, seq: u32, ts: [libc::timespec; 3]) {
        let observer = self.observer.lock().unwrap().clone();
        let Some(observer) = observer else { return };
        let kind = match tstype {
            SCM_TSTAMP_SCHED => TimestampKind::Scheduled,
            SCM_TSTAMP_SND => TimestampKind::Sent,
            SCM_TSTAMP_ACK => TimestampKind::Acked,
            _ => return,
        };
        let when = SystemTime::UNIX_EPOCH
            + Duration::new(ts[0].tv_sec.max(0) as u64, ts[0].tv_nsec as u32);
        // Deliver for every traced write the counter has passed; the
        // last ack also retires the entry.
        let mut traced = self.traced.lock().unwrap();
        let mut matched = Vec::new();
        while let Some(&front) = traced.front() {
            if front <= seq {
                matched.push(front);
                if kind == TimestampKind::Acked {
                    traced.pop_front();
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        drop(traced);
        for offset in matched {
            observer.on_timestamp(offset as u64 + 1, kind, when);
        }
    }
}

fn posix_to_status(err: PosixError) -> Status {
    match err {
        PosixError::WrongGeneration => {
            Status::failed_precondition("fd belongs to a previous generation")
        }
        PosixError::Os(err) => Status::from(err),
    }
}

fn read_error_status(err: std::io::Error) -> Status {
    match err.raw_os_error() {
        Some(libc::ECONNRESET) => Status::unavailable("connection reset by peer"),
        Some(libc::EBADF) => Status::failed_precondition("socket closed"),
        _ => Status::internal(format!("recvmsg: {err}")),
    }
}

fn write_error_status(err: std::io::Error) -> Status {
    match err.raw_os_error() {
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
            Status::unavailable("connection closed by peer")
        }
        Some(libc::EBADF) => Status::failed_precondition("socket closed"),
        _ => Status::internal(format!("sendmsg: {err}")),
    }
}

fn parse_inq(msg: &libc::msghdr) -> Option<usize> {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::IPPROTO_TCP && hdr.cmsg_type == TCP_INQ {
            let value = unsafe { (libc::CMSG_DATA(cmsg) as *const libc::c_int).read_unaligned() };
            return Some(value.max(0) as usize);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}
