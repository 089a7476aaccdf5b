//! The POSIX I/O engine: fork-safe fd registry, dual-stack socket
//! factory, TCP endpoint with zero-copy sends and timestamped
//! completions, and the accept-loop listener.

mod endpoint;
mod fd;
mod listener;
mod options;
mod poller;
mod sys;
mod zerocopy;

pub use endpoint::{
    ReadArgs, ReadCallback, TcpEndpoint, TimestampKind, TimestampsObserver, WriteArgs,
    WriteCallback,
};
pub use fd::{FdHandle, FdRegistry, PosixError, PosixResult};
pub use listener::{AcceptCallback, Listener, ListenerOptions};
pub use options::{SocketMutator, SocketUsage, TcpOptions};
pub use poller::{EventPoller, Poller, PollerHandle, ReadinessCallback, ReleaseFdCallback};
pub use sys::{DsMode, SocketOps, SystemDefaults};
pub use zerocopy::ZerocopyCtx;
