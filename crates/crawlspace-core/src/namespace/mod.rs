//! Linux namespace joining for observing another process's view of the system.
//!
//! [`NamespaceOps`] is the narrow OS boundary (open, enter, close) and
//! [`ProcessContext`] builds the reversible attach/detach protocol on top of
//! it. [`SyscallNamespaceOps`] is the real implementation over `setns(2)`.

pub mod context;
pub mod syscall;

use std::fmt;
use std::io;

use crawlspace_common::types::NamespaceKind;

pub use context::{ContextState, ProcessContext};
pub use syscall::SyscallNamespaceOps;

/// Process whose `/proc/<pid>/ns` entries are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcRef {
    /// The calling process (`/proc/self`).
    Current,
    /// Another process by pid.
    Pid(i32),
}

impl fmt::Display for ProcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("self"),
            Self::Pid(pid) => write!(f, "{pid}"),
        }
    }
}

/// Operating-system operations needed to switch namespaces.
///
/// Handles are exclusively owned by whoever opened them and must be given
/// back to [`NamespaceOps::close`] exactly once.
pub trait NamespaceOps: Send + Sync {
    /// Open namespace reference (a file descriptor for the real implementation).
    type Handle;

    /// Opens `/proc/<proc>/ns/<kind>` read-only.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the entry cannot be opened.
    fn open_namespace(&self, proc: ProcRef, kind: NamespaceKind) -> io::Result<Self::Handle>;

    /// Moves the calling thread into the namespace referenced by `handle`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the kernel refuses the switch.
    fn enter(&self, handle: &Self::Handle, kind: NamespaceKind) -> io::Result<()>;

    /// Releases `handle`.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `close(2)`.
    fn close(&self, handle: Self::Handle) -> io::Result<()>;
}

impl<T: NamespaceOps + ?Sized> NamespaceOps for std::sync::Arc<T> {
    type Handle = T::Handle;

    fn open_namespace(&self, proc: ProcRef, kind: NamespaceKind) -> io::Result<Self::Handle> {
        (**self).open_namespace(proc, kind)
    }

    fn enter(&self, handle: &Self::Handle, kind: NamespaceKind) -> io::Result<()> {
        (**self).enter(handle, kind)
    }

    fn close(&self, handle: Self::Handle) -> io::Result<()> {
        (**self).close(handle)
    }
}
