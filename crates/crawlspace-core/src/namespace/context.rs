//! Reversible binding of the calling process to a target's namespaces.
//!
//! A [`ProcessContext`] is single-use: `Created -> Attached -> Detached`.
//! Attaching opens the host's and the target's namespace entries, then
//! enters the target's in canonical order with mount last. Detaching
//! re-enters the host's, restores the working directory, and closes every
//! handle exactly once.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use crawlspace_common::error::{CrawlError, Result};
use crawlspace_common::types::NamespaceKind;

use super::{NamespaceOps, ProcRef};
use crate::logging;

/// Lifecycle of a [`ProcessContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Constructed, nothing opened yet.
    Created,
    /// The calling thread is inside the target's namespaces.
    Attached,
    /// Host namespaces restored and all handles closed. Terminal.
    Detached,
}

/// A namespace that was requested but not joined.
#[derive(Debug)]
pub struct SkippedNamespace {
    /// Namespace kind.
    pub kind: NamespaceKind,
    /// Step that failed (`"open"` or `"enter"`).
    pub stage: &'static str,
    /// OS error.
    pub error: io::Error,
}

/// Namespace handles of one process, keyed (and therefore ordered) by kind.
struct NamespaceFdSet<H> {
    handles: BTreeMap<NamespaceKind, H>,
}

impl<H> NamespaceFdSet<H> {
    const fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
        }
    }

    fn insert(&mut self, kind: NamespaceKind, handle: H) {
        let _ = self.handles.insert(kind, handle);
    }

    fn get(&self, kind: NamespaceKind) -> Option<&H> {
        self.handles.get(&kind)
    }

    fn kinds(&self) -> Vec<NamespaceKind> {
        self.handles.keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.handles.len()
    }

    fn take(&mut self) -> BTreeMap<NamespaceKind, H> {
        std::mem::take(&mut self.handles)
    }
}

/// Exclusive, reversible membership in a target process's namespaces.
///
/// Failures to open or enter any kind other than mount are recorded and
/// skipped. A mount failure aborts the attach after undoing whatever was
/// already done, so the process is never left half-attached.
pub struct ProcessContext<O: NamespaceOps> {
    ops: O,
    target_pid: i32,
    requested: Vec<NamespaceKind>,
    host: NamespaceFdSet<O::Handle>,
    target: NamespaceFdSet<O::Handle>,
    entered: Vec<NamespaceKind>,
    skipped: Vec<SkippedNamespace>,
    host_cwd: Option<PathBuf>,
    state: ContextState,
}

impl<O: NamespaceOps> ProcessContext<O> {
    /// Creates a context for `target_pid` joining `namespaces`.
    pub fn new(ops: O, target_pid: i32, namespaces: &[NamespaceKind]) -> Self {
        Self {
            ops,
            target_pid,
            requested: NamespaceKind::ordered_for_entry(namespaces),
            host: NamespaceFdSet::new(),
            target: NamespaceFdSet::new(),
            entered: Vec::new(),
            skipped: Vec::new(),
            host_cwd: None,
            state: ContextState::Created,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> ContextState {
        self.state
    }

    /// Target process id.
    pub const fn target_pid(&self) -> i32 {
        self.target_pid
    }

    /// Namespaces actually entered by the last attach.
    pub fn entered(&self) -> &[NamespaceKind] {
        &self.entered
    }

    /// Namespaces that were requested but skipped.
    pub fn skipped(&self) -> &[SkippedNamespace] {
        &self.skipped
    }

    /// Number of handles currently held open (host and target).
    pub fn open_handles(&self) -> usize {
        self.host.len() + self.target.len()
    }

    /// Joins the target's namespaces.
    ///
    /// Logging is suppressed from the first namespace switch until
    /// [`ProcessContext::detach`].
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::NamespaceAttach`] if the mount namespace cannot
    /// be opened or entered; every handle is closed and any namespace already
    /// entered is left again before returning. Returns
    /// [`CrawlError::NamespaceRestore`] if that unwinding itself cannot
    /// restore the host mount namespace. Returns [`CrawlError::Config`] if
    /// the context was already used.
    pub fn attach(&mut self) -> Result<()> {
        if self.state != ContextState::Created {
            return Err(CrawlError::Config {
                message: format!("process context for pid {} already used", self.target_pid),
            });
        }

        self.host_cwd = match std::env::current_dir() {
            Ok(cwd) => Some(cwd),
            Err(e) => {
                tracing::warn!(error = %e, "cannot capture working directory");
                None
            }
        };

        if let Err(err) = self.open_all() {
            self.close_all();
            self.state = ContextState::Detached;
            return Err(err);
        }

        logging::suppress();
        self.state = ContextState::Attached;

        if let Err(err) = self.enter_target() {
            self.detach()?;
            return Err(err);
        }
        Ok(())
    }

    /// Restores the host's namespaces and working directory, then closes
    /// every handle.
    ///
    /// Calling this on a context that is not attached does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::NamespaceRestore`] only when the host mount
    /// namespace could not be re-entered. Every other failure is logged.
    pub fn detach(&mut self) -> Result<()> {
        if self.state != ContextState::Attached {
            tracing::warn!(pid = self.target_pid, state = ?self.state, "detach without attach");
            return Ok(());
        }

        let mut fatal = None;
        let mut failures = Vec::new();
        for kind in self.entered.clone() {
            let Some(handle) = self.host.get(kind) else {
                continue;
            };
            if let Err(source) = self.ops.enter(handle, kind) {
                if kind.is_mandatory() {
                    fatal = Some(CrawlError::NamespaceRestore { kind, source });
                } else {
                    failures.push((kind, source));
                }
            }
        }

        let mut cwd_failure = None;
        if fatal.is_none() {
            if let Some(cwd) = &self.host_cwd {
                if let Err(e) = std::env::set_current_dir(cwd) {
                    cwd_failure = Some(e);
                }
            }
        }

        logging::resume();
        self.state = ContextState::Detached;

        for skipped in &self.skipped {
            tracing::warn!(
                pid = self.target_pid,
                kind = %skipped.kind,
                stage = skipped.stage,
                error = %skipped.error,
                "namespace skipped"
            );
        }
        for (kind, error) in failures {
            tracing::warn!(kind = %kind, error = %error, "failed to restore host namespace");
        }
        if let Some(e) = cwd_failure {
            tracing::warn!(error = %e, "failed to restore working directory");
        }

        self.close_all();
        tracing::debug!(pid = self.target_pid, entered = ?self.entered, "detached");
        fatal.map_or(Ok(()), Err)
    }

    fn open_all(&mut self) -> Result<()> {
        for kind in self.requested.clone() {
            let host = match self.ops.open_namespace(ProcRef::Current, kind) {
                Ok(handle) => handle,
                Err(error) => {
                    self.record_open_failure(kind, error)?;
                    continue;
                }
            };
            match self.ops.open_namespace(ProcRef::Pid(self.target_pid), kind) {
                Ok(target) => {
                    self.host.insert(kind, host);
                    self.target.insert(kind, target);
                }
                Err(error) => {
                    if let Err(e) = self.ops.close(host) {
                        tracing::warn!(kind = %kind, error = %e, "failed to close namespace handle");
                    }
                    self.record_open_failure(kind, error)?;
                }
            }
        }
        Ok(())
    }

    fn record_open_failure(&mut self, kind: NamespaceKind, error: io::Error) -> Result<()> {
        if kind.is_mandatory() {
            return Err(CrawlError::NamespaceAttach {
                kind,
                source: error,
            });
        }
        tracing::warn!(pid = self.target_pid, kind = %kind, error = %error, "cannot open namespace");
        self.skipped.push(SkippedNamespace {
            kind,
            stage: "open",
            error,
        });
        Ok(())
    }

    fn enter_target(&mut self) -> Result<()> {
        for kind in self.target.kinds() {
            let Some(handle) = self.target.get(kind) else {
                continue;
            };
            match self.ops.enter(handle, kind) {
                Ok(()) => self.entered.push(kind),
                Err(source) if kind.is_mandatory() => {
                    return Err(CrawlError::NamespaceAttach { kind, source });
                }
                Err(error) => self.skipped.push(SkippedNamespace {
                    kind,
                    stage: "enter",
                    error,
                }),
            }
        }
        Ok(())
    }

    fn close_all(&mut self) {
        let handles = self.host.take().into_iter().chain(self.target.take());
        for (kind, handle) in handles {
            if let Err(e) = self.ops.close(handle) {
                tracing::warn!(kind = %kind, error = %e, "failed to close namespace handle");
            }
        }
    }
}

impl<O: NamespaceOps> Drop for ProcessContext<O> {
    fn drop(&mut self) {
        if self.state == ContextState::Attached {
            if let Err(err) = self.detach() {
                tracing::error!(error = %err, "host mount namespace lost, aborting");
                std::process::abort();
            }
        }
    }
}
