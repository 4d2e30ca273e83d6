//! `setns(2)`-backed namespace operations.

use std::io;
use std::os::fd::{AsFd, IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use crawlspace_common::constants::DEFAULT_PROC_ROOT;
use crawlspace_common::types::NamespaceKind;
use nix::sched::CloneFlags;

use super::{NamespaceOps, ProcRef};

/// Real namespace operations against a procfs mount.
#[derive(Debug, Clone)]
pub struct SyscallNamespaceOps {
    proc_root: PathBuf,
}

impl SyscallNamespaceOps {
    /// Creates operations reading namespace entries under `proc_root`.
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Path of the namespace entry for `proc` and `kind`.
    #[must_use]
    pub fn entry_path(&self, proc: ProcRef, kind: NamespaceKind) -> PathBuf {
        self.proc_root
            .join(proc.to_string())
            .join("ns")
            .join(kind.proc_name())
    }

    /// Host procfs mount point.
    #[must_use]
    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }
}

impl Default for SyscallNamespaceOps {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

/// Flag `setns(2)` uses to check the descriptor refers to the expected kind.
#[must_use]
pub const fn clone_flag(kind: NamespaceKind) -> CloneFlags {
    match kind {
        NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
        NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
        NamespaceKind::Mnt => CloneFlags::CLONE_NEWNS,
    }
}

impl NamespaceOps for SyscallNamespaceOps {
    type Handle = OwnedFd;

    fn open_namespace(&self, proc: ProcRef, kind: NamespaceKind) -> io::Result<OwnedFd> {
        let file = std::fs::File::open(self.entry_path(proc, kind))?;
        Ok(OwnedFd::from(file))
    }

    fn enter(&self, handle: &OwnedFd, kind: NamespaceKind) -> io::Result<()> {
        if kind == NamespaceKind::Mnt {
            // setns(CLONE_NEWNS) is refused while the filesystem context is
            // shared with sibling threads.
            nix::sched::unshare(CloneFlags::CLONE_FS).map_err(io::Error::from)?;
        }
        nix::sched::setns(handle.as_fd(), clone_flag(kind)).map_err(io::Error::from)?;
        tracing::trace!(kind = %kind, "entered namespace");
        Ok(())
    }

    fn close(&self, handle: OwnedFd) -> io::Result<()> {
        let raw = handle.into_raw_fd();
        // SAFETY: `raw` was just released from an `OwnedFd`, so this is the
        // only remaining reference to the descriptor and it is closed once.
        let rc = unsafe { libc::close(raw) };
        nix::errno::Errno::result(rc)
            .map(drop)
            .map_err(io::Error::from)
    }
}
