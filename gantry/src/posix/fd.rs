use std::{fmt, io, os::unix::io::RawFd, sync::Mutex};

use rustc_hash::FxHashSet;

/// Error surface of the fd layer.
#[derive(Debug)]
pub enum PosixError {
    /// The handle was issued before the registry last advanced its
    /// generation (the process forked). The kernel was not touched.
    WrongGeneration,
    /// The underlying syscall failed.
    Os(io::Error),
}

/// Result alias for fd-layer operations.
pub type PosixResult<T> = Result<T, PosixError>;

impl PosixError {
    /// The raw errno, when this wraps a syscall failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            PosixError::WrongGeneration => None,
            PosixError::Os(err) => err.raw_os_error(),
        }
    }
}

impl fmt::Display for PosixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PosixError::WrongGeneration => write!(f, "fd handle from a previous generation"),
            PosixError::Os(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for PosixError {}

impl From<io::Error> for PosixError {
    fn from(err: io::Error) -> Self {
        PosixError::Os(err)
    }
}

/// A file descriptor tagged with the registry generation that issued it.
///
/// The raw fd must never reach a syscall except through [`crate::posix::SocketOps`],
/// which re-validates the generation first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FdHandle {
    fd: RawFd,
    generation: u32,
}

impl FdHandle {
    pub(crate) fn new(fd: RawFd, generation: u32) -> Self {
        Self { fd, generation }
    }

    /// The raw descriptor. Prefer [`FdRegistry::get`], which validates
    /// the generation.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// The generation this handle was issued under.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Tracks every fd the engine owns so that a forked child can invalidate
/// and close all of them wholesale.
pub struct FdRegistry {
    inner: Mutex<Inner>,
    track: bool,
}

struct Inner {
    generation: u32,
    fds: FxHashSet<RawFd>,
}

impl FdRegistry {
    /// `track` enables fork support; without it `adopt` hands out
    /// handles but records nothing.
    pub fn new(track: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                generation: 1,
                fds: FxHashSet::default(),
            }),
            track,
        }
    }

    /// Take ownership of `fd`, returning a handle tagged with the
    /// current generation.
    pub fn adopt(&self, fd: RawFd) -> FdHandle {
        let mut inner = self.inner.lock().unwrap();
        if self.track {
            inner.fds.insert(fd);
        }
        FdHandle::new(fd, inner.generation)
    }

    /// Remove `handle` from the registry. Returns true only when the
    /// handle's generation is current (and, when tracking, the fd was
    /// still registered); only then may the caller close the fd.
    pub fn close(&self, handle: FdHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if handle.generation != inner.generation {
            return false;
        }
        if self.track {
            inner.fds.remove(&handle.raw_fd())
        } else {
            true
        }
    }

    /// Validate `handle` and return the raw fd.
    pub fn get(&self, handle: FdHandle) -> PosixResult<RawFd> {
        let inner = self.inner.lock().unwrap();
        if handle.generation != inner.generation {
            return Err(PosixError::WrongGeneration);
        }
        Ok(handle.raw_fd())
    }

    /// The current generation.
    pub fn generation(&self) -> u32 {
        self.inner.lock().unwrap().generation
    }

    /// Invalidate every outstanding handle and return the drained fds.
    /// The caller owns closing them.
    pub fn advance_generation(&self) -> Vec<RawFd> {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.fds.drain().collect()
    }

    /// Post-fork sweep: advance the generation and close every fd that
    /// survived the fork.
    pub fn post_fork_close_all(&self) {
        let fds = self.advance_generation();
        tracing::debug!(count = fds.len(), "closing fds after fork");
        for fd in fds {
            let _ = syscall!(close(fd));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_exclusive() {
        let registry = FdRegistry::new(true);
        let h1 = registry.adopt(7);
        let h2 = registry.adopt(7);
        assert!(registry.close(h1));
        // The fd is gone; a second handle over the same fd must not
        // report a successful close.
        assert!(!registry.close(h2));
    }

    #[test]
    fn generation_advance_invalidates() {
        let registry = FdRegistry::new(true);
        let h1 = registry.adopt(7);
        assert_eq!(registry.get(h1).unwrap(), 7);

        let drained = registry.advance_generation();
        assert_eq!(drained, vec![7]);
        assert!(!registry.close(h1));
        assert!(matches!(
            registry.get(h1),
            Err(PosixError::WrongGeneration)
        ));

        let h2 = registry.adopt(7);
        assert_eq!(h2.generation(), 2);
        assert_eq!(registry.get(h2).unwrap(), 7);
        assert!(matches!(
            registry.get(h1),
            Err(PosixError::WrongGeneration)
        ));
    }

    #[test]
    fn untracked_registry_still_validates_generations() {
        let registry = FdRegistry::new(false);
        let h1 = registry.adopt(9);
        assert!(registry.close(h1));
        let drained = registry.advance_generation();
        assert!(drained.is_empty());
        assert!(!registry.close(h1));
    }
}
