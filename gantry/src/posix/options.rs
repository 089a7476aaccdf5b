use std::{os::unix::io::RawFd, sync::Arc};

/// What a socket is being prepared for; passed to [`SocketMutator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketUsage {
    /// An outbound connection.
    ClientConnection,
    /// A listening socket.
    ServerListener,
    /// An accepted connection.
    ServerConnection,
}

/// User hook that runs against every socket the engine prepares.
/// A failure aborts the prepare call.
pub trait SocketMutator: Send + Sync {
    /// Apply custom options to `fd`.
    fn mutate_fd(&self, fd: RawFd, usage: SocketUsage) -> std::io::Result<()>;
}

const MAX_CHUNK_SIZE: usize = 32 << 20;

/// Endpoint configuration.
///
/// Chunk sizes are clamped by [`TcpOptions::finalize`] so that
/// `min_read_chunk_size <= read_chunk_size <= max_read_chunk_size`, all
/// capped at 32 MiB.
#[derive(Clone)]
pub struct TcpOptions {
    /// Initial read target in bytes.
    pub read_chunk_size: usize,
    /// Lower bound for adaptive read sizing.
    pub min_read_chunk_size: usize,
    /// Upper bound for adaptive read sizing.
    pub max_read_chunk_size: usize,
    /// Whether to attempt MSG_ZEROCOPY sends.
    pub zerocopy_enabled: bool,
    /// Writes below this size always use the plain path.
    pub zerocopy_send_bytes_threshold: usize,
    /// Bound on outstanding zerocopy send records.
    pub zerocopy_max_simultaneous_sends: usize,
    /// SO_RCVBUF, or -1 to let the kernel decide.
    pub tcp_receive_buffer_size: i32,
    /// TCP_KEEPIDLE in ms; 0 inherits the system default, `i32::MAX`
    /// disables keepalive.
    pub keep_alive_time_ms: i32,
    /// TCP_KEEPINTVL in ms; same sentinel values as the time.
    pub keep_alive_timeout_ms: i32,
    /// DSCP value for IP_TOS / IPV6_TCLASS, or -1 to leave unset.
    pub dscp: i32,
    /// Whether listeners set SO_REUSEPORT.
    pub allow_reuse_port: bool,
    /// Whether wildcard binds expand to one socket per local interface.
    pub expand_wildcard_addrs: bool,
    /// Optional per-socket user hook.
    pub socket_mutator: Option<Arc<dyn SocketMutator>>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            read_chunk_size: 8192,
            min_read_chunk_size: 256,
            max_read_chunk_size: 4 << 20,
            zerocopy_enabled: false,
            zerocopy_send_bytes_threshold: 16 * 1024,
            zerocopy_max_simultaneous_sends: 4,
            tcp_receive_buffer_size: -1,
            keep_alive_time_ms: 0,
            keep_alive_timeout_ms: 0,
            dscp: -1,
            allow_reuse_port: false,
            expand_wildcard_addrs: false,
            socket_mutator: None,
        }
    }
}

impl TcpOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify the initial read chunk size.
    #[must_use]
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Specify the adaptive read floor.
    #[must_use]
    pub fn min_read_chunk_size(mut self, size: usize) -> Self {
        self.min_read_chunk_size = size;
        self
    }

    /// Specify the adaptive read ceiling.
    #[must_use]
    pub fn max_read_chunk_size(mut self, size: usize) -> Self {
        self.max_read_chunk_size = size;
        self
    }

    /// Enable zerocopy sends above `threshold` bytes.
    #[must_use]
    pub fn zerocopy(mut self, enabled: bool, threshold: usize) -> Self {
        self.zerocopy_enabled = enabled;
        self.zerocopy_send_bytes_threshold = threshold;
        self
    }

    /// Bound the number of concurrently outstanding zerocopy sends.
    #[must_use]
    pub fn zerocopy_max_simultaneous_sends(mut self, max: usize) -> Self {
        self.zerocopy_max_simultaneous_sends = max;
        self
    }

    /// Specify SO_RCVBUF.
    #[must_use]
    pub fn tcp_receive_buffer_size(mut self, size: i32) -> Self {
        self.tcp_receive_buffer_size = size;
        self
    }

    /// Specify keepalive time and timeout in milliseconds.
    #[must_use]
    pub fn keep_alive(mut self, time_ms: i32, timeout_ms: i32) -> Self {
        self.keep_alive_time_ms = time_ms;
        self.keep_alive_timeout_ms = timeout_ms;
        self
    }

    /// Specify the DSCP value.
    #[must_use]
    pub fn dscp(mut self, dscp: i32) -> Self {
        self.dscp = dscp;
        self
    }

    /// Enable SO_REUSEPORT on listeners.
    #[must_use]
    pub fn allow_reuse_port(mut self, allow: bool) -> Self {
        self.allow_reuse_port = allow;
        self
    }

    /// Expand wildcard binds to every local interface address.
    #[must_use]
    pub fn expand_wildcard_addrs(mut self, expand: bool) -> Self {
        self.expand_wildcard_addrs = expand;
        self
    }

    /// Install a socket mutator.
    #[must_use]
    pub fn socket_mutator(mut self, mutator: Arc<dyn SocketMutator>) -> Self {
        self.socket_mutator = Some(mutator);
        self
    }

    /// Normalize the chunk sizes. Clamps, never fails.
    #[must_use]
    pub fn finalize(mut self) -> Self {
        self.max_read_chunk_size = self.max_read_chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self.min_read_chunk_size = self.min_read_chunk_size.clamp(1, self.max_read_chunk_size);
        self.read_chunk_size = self
            .read_chunk_size
            .clamp(self.min_read_chunk_size, self.max_read_chunk_size);
        self
    }
}

impl std::fmt::Debug for TcpOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpOptions")
            .field("read_chunk_size", &self.read_chunk_size)
            .field("zerocopy_enabled", &self.zerocopy_enabled)
            .field("dscp", &self.dscp)
            .field("has_mutator", &self.socket_mutator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_clamps_chunk_sizes() {
        let opts = TcpOptions::new()
            .read_chunk_size(usize::MAX)
            .min_read_chunk_size(512)
            .max_read_chunk_size(usize::MAX)
            .finalize();
        assert_eq!(opts.max_read_chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(opts.read_chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(opts.min_read_chunk_size, 512);

        let opts = TcpOptions::new()
            .read_chunk_size(1)
            .min_read_chunk_size(1024)
            .max_read_chunk_size(2048)
            .finalize();
        assert_eq!(opts.read_chunk_size, 1024);
    }
}
