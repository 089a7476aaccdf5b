use std::{
    io,
    mem::{self, ManuallyDrop},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::unix::io::{FromRawFd, IntoRawFd, RawFd},
    sync::Arc,
};

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use super::{
    fd::{FdHandle, FdRegistry, PosixError, PosixResult},
    options::{SocketUsage, TcpOptions},
};

// TODO: use libc consts once exposed there.
pub(crate) const SO_ZEROCOPY: libc::c_int = 60;
const TCP_USER_TIMEOUT: libc::c_int = 18;

/// Dual-stack disposition of a created socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DsMode {
    /// Not an IP socket.
    None,
    /// AF_INET only.
    Ipv4,
    /// AF_INET6 with IPV6_V6ONLY set (clearing it failed).
    Ipv6,
    /// AF_INET6 accepting both families.
    DualStack,
}

/// Process-wide socket defaults; passed at construction rather than read
/// from ambient state so tests can build their own.
#[derive(Clone, Copy, Debug)]
pub struct SystemDefaults {
    /// TCP_USER_TIMEOUT for client connections, ms.
    pub client_tcp_user_timeout_ms: u32,
    /// TCP_USER_TIMEOUT for server-side sockets, ms.
    pub server_tcp_user_timeout_ms: u32,
}

impl Default for SystemDefaults {
    fn default() -> Self {
        Self {
            client_tcp_user_timeout_ms: 20_000,
            server_tcp_user_timeout_ms: 20_000,
        }
    }
}

/// Syscall surface of the engine. Every operation validates the handle's
/// generation before touching the kernel; post-fork handles fail with
/// [`PosixError::WrongGeneration`] without a syscall.
#[derive(Clone)]
pub struct SocketOps {
    registry: Arc<FdRegistry>,
    defaults: SystemDefaults,
}

impl SocketOps {
    /// Construct over `registry` with default system settings.
    pub fn new(registry: Arc<FdRegistry>) -> Self {
        Self::with_defaults(registry, SystemDefaults::default())
    }

    /// Construct with explicit system defaults.
    pub fn with_defaults(registry: Arc<FdRegistry>, defaults: SystemDefaults) -> Self {
        Self { registry, defaults }
    }

    /// The fd registry backing this instance.
    pub fn registry(&self) -> &Arc<FdRegistry> {
        &self.registry
    }

    /// Create a non-blocking, close-on-exec socket.
    pub fn socket(&self, domain: Domain, ty: Type, proto: Option<Protocol>) -> PosixResult<FdHandle> {
        let socket = Socket::new(domain, ty, proto).map_err(PosixError::Os)?;
        socket.set_nonblocking(true).map_err(PosixError::Os)?;
        Ok(self.registry.adopt(socket.into_raw_fd()))
    }

    /// `accept4(2)` with NONBLOCK | CLOEXEC. Returns the accepted fd and
    /// the peer address.
    pub fn accept4(&self, handle: FdHandle) -> PosixResult<(FdHandle, SocketAddr)> {
        let raw = self.registry.get(handle)?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            raw,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;
        let addr = sockaddr_to_std(&storage).map_err(PosixError::Os)?;
        Ok((self.registry.adopt(fd), addr))
    }

    /// `bind(2)`.
    pub fn bind(&self, handle: FdHandle, addr: &SocketAddr) -> PosixResult<()> {
        let raw = self.registry.get(handle)?;
        let addr = socket2::SockAddr::from(*addr);
        syscall!(bind(raw, addr.as_ptr() as *const libc::sockaddr, addr.len()))?;
        Ok(())
    }

    /// `listen(2)`.
    pub fn listen(&self, handle: FdHandle, backlog: i32) -> PosixResult<()> {
        let raw = self.registry.get(handle)?;
        syscall!(listen(raw, backlog))?;
        Ok(())
    }

    /// `connect(2)`. A non-blocking connect surfaces `EINPROGRESS` as an
    /// error; the caller is expected to wait for writability.
    pub fn connect(&self, handle: FdHandle, addr: &SocketAddr) -> PosixResult<()> {
        let raw = self.registry.get(handle)?;
        let addr = socket2::SockAddr::from(*addr);
        syscall!(connect(raw, addr.as_ptr() as *const libc::sockaddr, addr.len()))?;
        Ok(())
    }

    /// `shutdown(2)`.
    pub fn shutdown(&self, handle: FdHandle, how: std::net::Shutdown) -> PosixResult<()> {
        let raw = self.registry.get(handle)?;
        let how = match how {
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(raw, how))?;
        Ok(())
    }

    /// `read(2)`.
    pub fn read(&self, handle: FdHandle, buf: &mut [u8]) -> PosixResult<usize> {
        let raw = self.registry.get(handle)?;
        let n = syscall!(read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))?;
        Ok(n as usize)
    }

    /// `write(2)`.
    pub fn write(&self, handle: FdHandle, buf: &[u8]) -> PosixResult<usize> {
        let raw = self.registry.get(handle)?;
        let n = syscall!(write(raw, buf.as_ptr() as *const libc::c_void, buf.len()))?;
        Ok(n as usize)
    }

    /// `recvmsg(2)`.
    pub fn recvmsg(&self, handle: FdHandle, msg: &mut libc::msghdr, flags: i32) -> PosixResult<usize> {
        let raw = self.registry.get(handle)?;
        let n = syscall!(recvmsg(raw, msg, flags))?;
        Ok(n as usize)
    }

    /// `sendmsg(2)`.
    pub fn sendmsg(&self, handle: FdHandle, msg: &libc::msghdr, flags: i32) -> PosixResult<usize> {
        let raw = self.registry.get(handle)?;
        let n = syscall!(sendmsg(raw, msg, flags))?;
        Ok(n as usize)
    }

    /// `FIONREAD`: bytes readable without blocking.
    pub fn ioctl_fionread(&self, handle: FdHandle) -> PosixResult<usize> {
        let raw = self.registry.get(handle)?;
        let mut pending: libc::c_int = 0;
        syscall!(ioctl(raw, libc::FIONREAD as _, &mut pending))?;
        Ok(pending as usize)
    }

    /// `eventfd(2)` with NONBLOCK | CLOEXEC.
    pub fn eventfd(&self, initval: u32) -> PosixResult<FdHandle> {
        let fd = syscall!(eventfd(initval, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
        Ok(self.registry.adopt(fd))
    }

    /// Read the eventfd counter.
    pub fn eventfd_read(&self, handle: FdHandle) -> PosixResult<u64> {
        let mut value = [0u8; 8];
        self.read(handle, &mut value)?;
        Ok(u64::from_ne_bytes(value))
    }

    /// Add to the eventfd counter.
    pub fn eventfd_write(&self, handle: FdHandle, value: u64) -> PosixResult<()> {
        self.write(handle, &value.to_ne_bytes())?;
        Ok(())
    }

    /// `pipe2(2)` with NONBLOCK | CLOEXEC. Returns (read end, write end).
    pub fn pipe(&self) -> PosixResult<(FdHandle, FdHandle)> {
        let mut fds = [0 as RawFd; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        Ok((self.registry.adopt(fds[0]), self.registry.adopt(fds[1])))
    }

    /// `getsockname(2)`.
    pub fn local_addr(&self, handle: FdHandle) -> PosixResult<SocketAddr> {
        let raw = self.registry.get(handle)?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            raw,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        sockaddr_to_std(&storage).map_err(PosixError::Os)
    }

    /// `getpeername(2)`.
    pub fn peer_addr(&self, handle: FdHandle) -> PosixResult<SocketAddr> {
        let raw = self.registry.get(handle)?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            raw,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        sockaddr_to_std(&storage).map_err(PosixError::Os)
    }

    /// Set an integer socket option.
    pub fn setsockopt_int(
        &self,
        handle: FdHandle,
        level: libc::c_int,
        optname: libc::c_int,
        value: libc::c_int,
    ) -> PosixResult<()> {
        let raw = self.registry.get(handle)?;
        set_int_opt(raw, level, optname, value).map_err(PosixError::Os)
    }

    /// Read an integer socket option.
    pub fn getsockopt_int(
        &self,
        handle: FdHandle,
        level: libc::c_int,
        optname: libc::c_int,
    ) -> PosixResult<libc::c_int> {
        let raw = self.registry.get(handle)?;
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            raw,
            level,
            optname,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len
        ))?;
        Ok(value)
    }

    /// Close a handle. Returns true when this call actually closed the
    /// fd; a wrong-generation handle is left for the post-fork sweep.
    pub fn close(&self, handle: FdHandle) -> bool {
        if self.registry.close(handle) {
            let _ = syscall!(close(handle.raw_fd()));
            true
        } else {
            false
        }
    }

    /// Create a socket for `addr`, preferring AF_INET6 with IPV6_V6ONLY
    /// cleared. Falls back per family:
    /// AF_INET6 + clear ok => DualStack; clear failed + v4-mapped target
    /// => retry AF_INET; clear failed otherwise => Ipv6 only. Non-IPv6
    /// targets bypass the fallback entirely.
    pub fn create_dual_stack_socket(
        &self,
        addr: &SocketAddr,
        ty: Type,
        proto: Option<Protocol>,
    ) -> PosixResult<(FdHandle, DsMode)> {
        match addr {
            SocketAddr::V4(_) => {
                let handle = self.socket(Domain::IPV4, ty, proto)?;
                Ok((handle, DsMode::Ipv4))
            }
            SocketAddr::V6(v6) => {
                let handle = match self.socket(Domain::IPV6, ty, proto) {
                    Ok(handle) => handle,
                    Err(err) => {
                        // No v6 support at all; a v4-mapped target can
                        // still go out over AF_INET.
                        if v4_mapped_to_v4(v6).is_some() {
                            let handle = self.socket(Domain::IPV4, ty, proto)?;
                            return Ok((handle, DsMode::Ipv4));
                        }
                        return Err(err);
                    }
                };
                let cleared = self
                    .setsockopt_int(handle, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0)
                    .is_ok();
                if cleared {
                    return Ok((handle, DsMode::DualStack));
                }
                if v4_mapped_to_v4(v6).is_some() {
                    self.close(handle);
                    let handle = self.socket(Domain::IPV4, ty, proto)?;
                    return Ok((handle, DsMode::Ipv4));
                }
                Ok((handle, DsMode::Ipv6))
            }
        }
    }

    /// Create and configure a client socket for `target`. Returns the fd
    /// and the (possibly remapped) address the caller must connect to.
    pub fn create_and_prepare_tcp_client_socket(
        &self,
        options: &TcpOptions,
        target: &SocketAddr,
    ) -> PosixResult<(FdHandle, SocketAddr)> {
        let (handle, mode) = self.create_dual_stack_socket(
            target,
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        let mapped = match (mode, target) {
            // The socket speaks v4 only; unmap a v4-mapped-v6 target.
            (DsMode::Ipv4, SocketAddr::V6(v6)) => match v4_mapped_to_v4(v6) {
                Some(v4) => SocketAddr::V4(v4),
                None => *target,
            },
            // A dual-stack socket reaches v4 peers via the mapped form.
            (DsMode::DualStack, SocketAddr::V4(v4)) => SocketAddr::V6(to_v4_mapped(v4)),
            _ => *target,
        };
        let raw = self.registry.get(handle)?;
        let family = match mapped {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        self.with_socket(raw, |socket| {
            socket.set_nodelay(true)?;
            apply_keepalive(socket, options)?;
            if options.tcp_receive_buffer_size >= 0 {
                socket.set_recv_buffer_size(options.tcp_receive_buffer_size as usize)?;
            }
            set_dscp(raw, family, options.dscp)?;
            set_int_opt(
                raw,
                libc::IPPROTO_TCP,
                TCP_USER_TIMEOUT,
                self.defaults.client_tcp_user_timeout_ms as libc::c_int,
            )?;
            if options.zerocopy_enabled {
                // Best effort; older kernels reject SO_ZEROCOPY.
                let _ = set_int_opt(raw, libc::SOL_SOCKET, SO_ZEROCOPY, 1);
            }
            Ok(())
        })
        .map_err(PosixError::Os)?;
        self.apply_socket_mutator(handle, SocketUsage::ClientConnection, options)?;
        Ok((handle, mapped))
    }

    /// Configure, bind and listen. Returns the bound address, which
    /// carries the kernel-chosen port when `addr` asked for port 0.
    pub fn prepare_listener_socket(
        &self,
        handle: FdHandle,
        options: &TcpOptions,
        addr: &SocketAddr,
    ) -> PosixResult<SocketAddr> {
        let raw = self.registry.get(handle)?;
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        self.with_socket(raw, |socket| {
            socket.set_nonblocking(true)?;
            socket.set_nodelay(true)?;
            socket.set_reuse_address(true)?;
            set_dscp(raw, family, options.dscp)?;
            if options.allow_reuse_port {
                socket.set_reuse_port(true)?;
            }
            set_int_opt(
                raw,
                libc::IPPROTO_TCP,
                TCP_USER_TIMEOUT,
                self.defaults.server_tcp_user_timeout_ms as libc::c_int,
            )?;
            if options.zerocopy_enabled {
                let _ = set_int_opt(raw, libc::SOL_SOCKET, SO_ZEROCOPY, 1);
            }
            Ok(())
        })
        .map_err(PosixError::Os)?;
        self.apply_socket_mutator(handle, SocketUsage::ServerListener, options)?;
        self.bind(handle, addr)?;
        self.listen(handle, max_accept_queue_size())?;
        self.local_addr(handle)
    }

    /// Configure an accepted server-side connection.
    pub fn prepare_accepted_socket(
        &self,
        handle: FdHandle,
        options: &TcpOptions,
    ) -> PosixResult<()> {
        let raw = self.registry.get(handle)?;
        self.with_socket(raw, |socket| {
            socket.set_nonblocking(true)?;
            socket.set_nodelay(true)?;
            apply_keepalive(socket, options)?;
            if options.zerocopy_enabled {
                let _ = set_int_opt(raw, libc::SOL_SOCKET, SO_ZEROCOPY, 1);
            }
            Ok(())
        })
        .map_err(PosixError::Os)?;
        self.apply_socket_mutator(handle, SocketUsage::ServerConnection, options)
    }

    /// Run the user mutator, if any. Failure is fatal to the prepare
    /// call that triggered it.
    pub fn apply_socket_mutator(
        &self,
        handle: FdHandle,
        usage: SocketUsage,
        options: &TcpOptions,
    ) -> PosixResult<()> {
        let Some(mutator) = options.socket_mutator.as_ref() else {
            return Ok(());
        };
        let raw = self.registry.get(handle)?;
        mutator.mutate_fd(raw, usage).map_err(PosixError::Os)
    }

    fn with_socket<R>(
        &self,
        raw: RawFd,
        f: impl FnOnce(&Socket) -> io::Result<R>,
    ) -> io::Result<R> {
        // Borrow the fd as a socket2::Socket without taking ownership.
        let socket = ManuallyDrop::new(unsafe { Socket::from_raw_fd(raw) });
        f(&socket)
    }
}

fn apply_keepalive(socket: &Socket, options: &TcpOptions) -> io::Result<()> {
    // 0 inherits the system default, i32::MAX disables keepalive.
    if options.keep_alive_time_ms <= 0 || options.keep_alive_time_ms == i32::MAX {
        return Ok(());
    }
    let mut keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_millis(
        options.keep_alive_time_ms.max(1000) as u64,
    ));
    if options.keep_alive_timeout_ms > 0 && options.keep_alive_timeout_ms != i32::MAX {
        keepalive = keepalive.with_interval(std::time::Duration::from_millis(
            options.keep_alive_timeout_ms.max(1000) as u64,
        ));
    }
    socket.set_tcp_keepalive(&keepalive)
}

fn set_dscp(raw: RawFd, family: libc::c_int, dscp: i32) -> io::Result<()> {
    if dscp < 0 {
        return Ok(());
    }
    // DSCP occupies the upper six bits of the traffic class octet.
    let value = (dscp << 2) as libc::c_int;
    match family {
        libc::AF_INET => set_int_opt(raw, libc::IPPROTO_IP, libc::IP_TOS, value),
        libc::AF_INET6 => set_int_opt(raw, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, value),
        _ => Ok(()),
    }
}

fn set_int_opt(
    raw: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    syscall!(setsockopt(
        raw,
        level,
        optname,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;
    Ok(())
}

/// Accept queue depth: at least 100, raised to the system cap when the
/// kernel advertises a bigger one.
fn max_accept_queue_size() -> i32 {
    let somaxconn = std::fs::read_to_string("/proc/sys/net/core/somaxconn")
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .unwrap_or(libc::SOMAXCONN);
    somaxconn.max(100)
}

pub(crate) fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // Safety: AF_INET guarantees the storage holds a sockaddr_in.
            let addr: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            // Safety: AF_INET6 guarantees the storage holds a sockaddr_in6.
            let addr: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

pub(crate) fn to_v4_mapped(addr: &SocketAddrV4) -> SocketAddrV6 {
    SocketAddrV6::new(addr.ip().to_ipv6_mapped(), addr.port(), 0, 0)
}

pub(crate) fn v4_mapped_to_v4(addr: &SocketAddrV6) -> Option<SocketAddrV4> {
    addr.ip()
        .to_ipv4_mapped()
        .map(|ip| SocketAddrV4::new(ip, addr.port()))
}
