use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use bytes::Bytes;
use socket2::{Protocol, Type};

use super::{
    endpoint::TcpEndpoint,
    fd::{FdHandle, PosixError},
    options::TcpOptions,
    poller::{Poller, PollerHandle},
    sys::{DsMode, SocketOps},
};
use crate::{
    exec::{TimerDriver, WorkSerializer},
    mem::MemoryAllocator,
    Status,
};

/// Invoked with each accepted connection.
pub type AcceptCallback = Arc<dyn Fn(TcpEndpoint) + Send + Sync>;

/// Listener configuration.
#[derive(Clone)]
pub struct ListenerOptions {
    /// Options applied to the listening sockets and every accepted
    /// connection.
    pub tcp: TcpOptions,
    /// First EMFILE backoff delay.
    pub emfile_backoff_initial: Duration,
    /// EMFILE backoff cap.
    pub emfile_backoff_max: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            tcp: TcpOptions::default(),
            emfile_backoff_initial: Duration::from_secs(1),
            emfile_backoff_max: Duration::from_secs(10),
        }
    }
}

/// A TCP acceptor: one or more listening sockets, each with its own
/// accept loop multiplexed over the poller.
///
/// Lifecycle: `bind*` calls, then `start`, then `shutdown_listening_fds`.
/// Binding after `start` is rejected.
pub struct Listener {
    shared: Arc<ListenerShared>,
}

struct ListenerShared {
    ops: SocketOps,
    poller: Arc<dyn Poller>,
    timer: Arc<TimerDriver>,
    allocator: Arc<dyn MemoryAllocator>,
    options: ListenerOptions,
    on_accept: AcceptCallback,
    state: Mutex<ListenerState>,
}

struct ListenerState {
    started: bool,
    shutdown: bool,
    loops: Vec<Arc<AcceptLoop>>,
    chosen_port: u16,
}

struct AcceptLoop {
    shared: Weak<ListenerShared>,
    fd: FdHandle,
    bound_addr: SocketAddr,
    ds_mode: DsMode,
    handle: Mutex<Option<Arc<dyn PollerHandle>>>,
    backoff: Mutex<Duration>,
}

impl Listener {
    /// Build a listener. No sockets exist until `bind`.
    pub fn new(
        ops: SocketOps,
        poller: Arc<dyn Poller>,
        timer: Arc<TimerDriver>,
        allocator: Arc<dyn MemoryAllocator>,
        options: ListenerOptions,
        on_accept: AcceptCallback,
    ) -> Self {
        Self {
            shared: Arc::new(ListenerShared {
                ops,
                poller,
                timer,
                allocator,
                options,
                on_accept,
                state: Mutex::new(ListenerState {
                    started: false,
                    shutdown: false,
                    loops: Vec::new(),
                    chosen_port: 0,
                }),
            }),
        }
    }

    /// Bind `addr`, expanding wildcards per the configured policy.
    /// Returns the chosen port; later wildcard binds reuse it.
    pub fn bind(&self, addr: SocketAddr) -> Result<u16, Status> {
        self.bind_internal(addr, None)
    }

    /// Like [`Listener::bind`], additionally surfacing every listening
    /// fd as it is created.
    pub fn bind_with_fd(
        &self,
        addr: SocketAddr,
        on_new_fd: &dyn Fn(FdHandle),
    ) -> Result<u16, Status> {
        self.bind_internal(addr, Some(on_new_fd))
    }

    fn bind_internal(
        &self,
        addr: SocketAddr,
        on_new_fd: Option<&dyn Fn(FdHandle)>,
    ) -> Result<u16, Status> {
        let mut state = self.shared.state.lock().unwrap();
        if state.started {
            return Err(Status::failed_precondition("bind called after start"));
        }
        let mut port = addr.port();
        if port == 0 {
            port = state.chosen_port;
        }

        if addr.ip().is_unspecified() {
            if self.shared.options.tcp.expand_wildcard_addrs {
                match local_interface_addrs() {
                    Ok(addrs) if !addrs.is_empty() => {
                        for ip in addrs {
                            let bound = self.bind_one(
                                &mut state,
                                SocketAddr::new(ip, port),
                                on_new_fd,
                            )?;
                            port = bound.port();
                        }
                        state.chosen_port = port;
                        return Ok(port);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "interface enumeration failed; using wildcard");
                    }
                }
            }
            // Single dual-stack wildcard; a v6-only socket additionally
            // gets a v4 companion.
            let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
            match self.bind_one(&mut state, v6, on_new_fd) {
                Ok(bound) => {
                    port = bound.port();
                    let v6_only = matches!(
                        state.loops.last().map(|l| l.ds_mode),
                        Some(DsMode::Ipv6)
                    );
                    if v6_only {
                        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                        self.bind_one(&mut state, v4, on_new_fd)?;
                    }
                }
                Err(_) => {
                    let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                    port = self.bind_one(&mut state, v4, on_new_fd)?.port();
                }
            }
            state.chosen_port = port;
            return Ok(port);
        }

        let bound = self.bind_one(&mut state, SocketAddr::new(addr.ip(), port), on_new_fd)?;
        state.chosen_port = bound.port();
        Ok(bound.port())
    }

    fn bind_one(
        &self,
        state: &mut ListenerState,
        addr: SocketAddr,
        on_new_fd: Option<&dyn Fn(FdHandle)>,
    ) -> Result<SocketAddr, Status> {
        let ops = &self.shared.ops;
        let (fd, ds_mode) = ops
            .create_dual_stack_socket(&addr, Type::STREAM, Some(Protocol::TCP))
            .map_err(posix_to_status)?;
        let bound = match ops.prepare_listener_socket(fd, &self.shared.options.tcp, &addr) {
            Ok(bound) => bound,
            Err(e) => {
                ops.close(fd);
                return Err(posix_to_status(e));
            }
        };
        if let Some(on_new_fd) = on_new_fd {
            on_new_fd(fd);
        }
        tracing::debug!(addr = %bound, ?ds_mode, "listener bound");
        state.loops.push(Arc::new(AcceptLoop {
            shared: Arc::downgrade(&self.shared),
            fd,
            bound_addr: bound,
            ds_mode,
            handle: Mutex::new(None),
            backoff: Mutex::new(self.shared.options.emfile_backoff_initial),
        }));
        Ok(bound)
    }

    /// Arm every accept loop. Idempotent calls are rejected.
    pub fn start(&self) -> Result<(), Status> {
        let loops = {
            let mut state = self.shared.state.lock().unwrap();
            if state.started {
                return Err(Status::failed_precondition("listener already started"));
            }
            if state.loops.is_empty() {
                return Err(Status::failed_precondition("listener has no bound sockets"));
            }
            state.started = true;
            state.loops.clone()
        };
        for accept_loop in loops {
            let handle = self
                .shared
                .poller
                .create_handle(accept_loop.fd, "tcp-listener", false)
                .map_err(Status::from)?;
            *accept_loop.handle.lock().unwrap() = Some(handle);
            AcceptLoop::arm(&accept_loop);
        }
        Ok(())
    }

    /// Wrap an externally accepted fd as if this listener produced it.
    /// `pending_data` is delivered before any socket bytes.
    pub fn handle_external_connection(
        &self,
        _listener_fd: Option<FdHandle>,
        fd: FdHandle,
        pending_data: Option<Bytes>,
    ) -> Result<(), Status> {
        let shared = &self.shared;
        shared
            .ops
            .prepare_accepted_socket(fd, &shared.options.tcp)
            .map_err(posix_to_status)?;
        let endpoint = TcpEndpoint::new(
            shared.ops.clone(),
            fd,
            &shared.poller,
            WorkSerializer::new(),
            shared.allocator.clone(),
            shared.options.tcp.clone(),
            pending_data,
        )?;
        (shared.on_accept)(endpoint);
        Ok(())
    }

    /// Bound addresses, in bind order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .state
            .lock()
            .unwrap()
            .loops
            .iter()
            .map(|l| l.bound_addr)
            .collect()
    }

    /// Orphan every accept loop and close the listening sockets.
    pub fn shutdown_listening_fds(&self) {
        let loops = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            std::mem::take(&mut state.loops)
        };
        let why = Status::unavailable("listener shutdown");
        for accept_loop in loops {
            let handle = accept_loop.handle.lock().unwrap().take();
            match handle {
                Some(handle) => {
                    handle.shutdown(&why);
                    let ops = self.shared.ops.clone();
                    let fd = accept_loop.fd;
                    handle.orphan(Box::new(move |released| {
                        if released.is_ok() {
                            ops.close(fd);
                        }
                    }));
                }
                None => {
                    self.shared.ops.close(accept_loop.fd);
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown_listening_fds();
    }
}

impl AcceptLoop {
    fn arm(this: &Arc<Self>) {
        let handle = this.handle.lock().unwrap().clone();
        let Some(handle) = handle else { return };
        let accept_loop = this.clone();
        handle.notify_on_read(Box::new(move || AcceptLoop::on_readable(&accept_loop)));
    }

    fn on_readable(this: &Arc<Self>) {
        let Some(shared) = this.shared.upgrade() else {
            return;
        };
        if shared.state.lock().unwrap().shutdown {
            return;
        }
        loop {
            match shared.ops.accept4(this.fd) {
                Ok((fd, peer)) => {
                    *this.backoff.lock().unwrap() = shared.options.emfile_backoff_initial;
                    if let Err(e) = AcceptLoop::dispatch(&shared, fd) {
                        tracing::warn!(peer = %peer, error = %e, "failed to set up accepted connection");
                        shared.ops.close(fd);
                    }
                }
                Err(PosixError::WrongGeneration) => return,
                Err(PosixError::Os(err)) => match err.raw_os_error() {
                    Some(libc::EAGAIN) => {
                        AcceptLoop::arm(this);
                        return;
                    }
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    Some(libc::EMFILE) => {
                        // Do not re-arm the poller: with the fd table
                        // full every wakeup would fail again. Retry from
                        // a timer instead.
                        let delay = {
                            let mut backoff = this.backoff.lock().unwrap();
                            let delay = *backoff;
                            *backoff = (*backoff * 2).min(shared.options.emfile_backoff_max);
                            delay
                        };
                        tracing::warn!(
                            addr = %this.bound_addr,
                            ?delay,
                            "accept: file descriptor limit reached; backing off"
                        );
                        let accept_loop = this.clone();
                        shared
                            .timer
                            .run_after(delay, move || AcceptLoop::on_readable(&accept_loop));
                        return;
                    }
                    _ => {
                        tracing::warn!(addr = %this.bound_addr, error = %err, "accept failed");
                        AcceptLoop::arm(this);
                        return;
                    }
                },
            }
        }
    }

    fn dispatch(shared: &Arc<ListenerShared>, fd: FdHandle) -> Result<(), Status> {
        shared
            .ops
            .prepare_accepted_socket(fd, &shared.options.tcp)
            .map_err(posix_to_status)?;
        let endpoint = TcpEndpoint::new(
            shared.ops.clone(),
            fd,
            &shared.poller,
            WorkSerializer::new(),
            shared.allocator.clone(),
            shared.options.tcp.clone(),
            None,
        )?;
        (shared.on_accept)(endpoint);
        Ok(())
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

fn local_interface_addrs() -> std::io::Result<Vec<IpAddr>> {
    let mut out = Vec::new();
    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            out.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            let ip = sin6.ip();
            // Link-local addresses need a scope id to be usable.
            if (ip.segments()[0] & 0xffc0) == 0xfe80 {
                continue;
            }
            out.push(IpAddr::V6(ip));
        }
    }
    Ok(out)
}
