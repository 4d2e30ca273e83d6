//! Running a probe as though inside another process's container.
//!
//! One call is: preload once, attach the calling thread to the target's
//! namespaces, fork a worker that inherits them, run the probe in the
//! worker, wait for its reply under a wall-clock bound, reap or kill the
//! worker, and always detach before returning.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crawlspace_common::constants::DEFAULT_ISOLATION_TIMEOUT_SECS;
use crawlspace_common::error::{CrawlError, ProbeError, Result};
use crawlspace_common::types::NamespaceKind;
use crawlspace_core::namespace::{NamespaceOps, ProcessContext, SyscallNamespaceOps};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid, pipe};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channel::{self, Received, ReplyReceiver, WorkerReply};
use crate::preload::ModulePreloader;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs probes inside a target process's namespaces, in a forked worker.
///
/// Calls are synchronous and must not nest on the same thread.
pub struct IsolatedExecutor<O: NamespaceOps = SyscallNamespaceOps> {
    ops: Arc<O>,
    timeout: Duration,
    preloader: ModulePreloader,
}

impl IsolatedExecutor<SyscallNamespaceOps> {
    /// Creates an executor using real namespace operations under `/proc`.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SyscallNamespaceOps::default())
    }
}

impl<O: NamespaceOps> IsolatedExecutor<O> {
    /// Creates an executor over `ops` with the default 30 second bound.
    pub fn new(ops: O) -> Self {
        Self {
            ops: Arc::new(ops),
            timeout: Duration::from_secs(DEFAULT_ISOLATION_TIMEOUT_SECS),
            preloader: ModulePreloader::new(),
        }
    }

    /// Overrides the receive and join bound.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the preloader.
    #[must_use]
    pub fn with_preloader(mut self, preloader: ModulePreloader) -> Self {
        self.preloader = preloader;
        self
    }

    /// Bound applied to receiving the reply and to joining the worker.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `probe` inside `pid`'s `namespaces` and returns its value.
    ///
    /// # Errors
    ///
    /// - [`CrawlError::NamespaceAttach`] if the mount namespace cannot be
    ///   joined; no worker is forked.
    /// - [`CrawlError::Probe`] with the probe's own error.
    /// - [`CrawlError::IsolationTimeout`] if no reply arrives in time; the
    ///   worker is killed.
    /// - [`CrawlError::WorkerCrashed`] if the worker dies without replying.
    /// - [`CrawlError::Fork`] if the worker cannot be started.
    ///
    /// The caller's namespaces are restored before any of these return. If
    /// the host mount namespace cannot be restored the process aborts.
    pub fn run<T, F>(&self, pid: i32, namespaces: &[NamespaceKind], probe: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> std::result::Result<T, ProbeError>,
    {
        self.preloader.ensure_loaded();

        // No thread can be created once the pid namespace is joined, so the
        // reply reader must already be running.
        let (read_end, write_end) = pipe().map_err(|e| CrawlError::Fork { source: e.into() })?;
        let receiver = ReplyReceiver::<T>::spawn(File::from(read_end))
            .map_err(|source| CrawlError::Fork { source })?;

        let mut context = ProcessContext::new(Arc::clone(&self.ops), pid, namespaces);
        context.attach()?;

        let outcome = self.fork_worker(pid, receiver, write_end, probe);

        if let Err(err) = context.detach() {
            tracing::error!(pid, error = %err, "host mount namespace lost, aborting");
            std::process::abort();
        }
        if let Err(err) = &outcome {
            tracing::warn!(pid, error = %err, "isolated call failed");
        }
        outcome
    }

    /// Runs a probe producing a sequence and returns it materialized.
    ///
    /// The sequence is collected inside the worker, in order, before it
    /// crosses the process boundary.
    ///
    /// # Errors
    ///
    /// Same as [`IsolatedExecutor::run`].
    pub fn run_sequence<I, F>(
        &self,
        pid: i32,
        namespaces: &[NamespaceKind],
        probe: F,
    ) -> Result<Vec<I::Item>>
    where
        I: IntoIterator,
        I::Item: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> std::result::Result<I, ProbeError>,
    {
        self.run(pid, namespaces, move || {
            probe().map(|items| items.into_iter().collect::<Vec<_>>())
        })
    }

    fn fork_worker<T, F>(
        &self,
        pid: i32,
        receiver: ReplyReceiver<T>,
        write_end: OwnedFd,
        probe: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> std::result::Result<T, ProbeError>,
    {
        let parent = getpid();

        // SAFETY: the child runs only the probe and then `_exit`s; it never
        // returns into the caller's stack.
        match unsafe { fork() } {
            Err(e) => Err(CrawlError::Fork { source: e.into() }),
            Ok(ForkResult::Child) => worker_main(parent, write_end, probe),
            Ok(ForkResult::Parent { child }) => {
                drop(write_end);
                tracing::trace!(pid, worker = child.as_raw(), "worker forked");
                self.await_worker(pid, child, &receiver)
            }
        }
    }

    fn await_worker<T>(&self, pid: i32, child: Pid, receiver: &ReplyReceiver<T>) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match receiver.wait(self.timeout) {
            Received::Reply(reply) => {
                let _ = join_or_kill(child, self.timeout);
                reply.map_err(CrawlError::Probe)
            }
            Received::Broken(e) => {
                let status = join_or_kill(child, self.timeout);
                Err(CrawlError::WorkerCrashed {
                    pid,
                    detail: format!("{e}; worker status {status}"),
                })
            }
            Received::TimedOut => {
                let _ = kill_and_reap(child);
                Err(CrawlError::IsolationTimeout {
                    pid,
                    timeout: self.timeout,
                })
            }
        }
    }
}

/// Body of the forked worker. Never returns.
fn worker_main<T, F>(parent: Pid, write_end: OwnedFd, probe: F) -> !
where
    T: Serialize,
    F: FnOnce() -> std::result::Result<T, ProbeError>,
{
    // An orchestrator killed before reaping must not leave us behind
    // inside the container's namespaces.
    let orphaned = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).is_err()
        || !parent_alive(parent, getppid());
    if orphaned {
        // SAFETY: plain process exit from the worker.
        unsafe { libc::_exit(1) }
    }

    let reply: WorkerReply<T> = std::panic::catch_unwind(std::panic::AssertUnwindSafe(probe))
        .unwrap_or_else(|_| Err(ProbeError::new("Panic", "probe panicked")));
    let mut code = i32::from(reply.is_err());

    let mut pipe = File::from(write_end);
    if channel::send(&mut pipe, &reply).is_err() {
        code = 2;
    }
    drop(pipe);
    // SAFETY: skip the parent's atexit handlers and destructors.
    unsafe { libc::_exit(code) }
}

/// Whether the worker is still the child of `parent`.
///
/// A parent living in an ancestor pid namespace has no pid in the worker's
/// namespace and shows up as 0. Once orphaned, the worker is reparented to
/// a reaper that does have a pid there.
fn parent_alive(parent: Pid, ppid: Pid) -> bool {
    ppid == parent || ppid.as_raw() == 0
}

/// Waits up to `timeout` for the worker to exit, then kills it.
fn join_or_kill(child: Pid, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => return describe(status),
            Err(e) => return format!("unknown ({e})"),
        }
        if Instant::now() >= deadline {
            tracing::warn!(worker = child.as_raw(), "worker did not exit in time, killing");
            return kill_and_reap(child);
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
}

/// Sends SIGKILL and reaps the worker.
fn kill_and_reap(child: Pid) -> String {
    if let Err(e) = kill(child, Signal::SIGKILL) {
        tracing::debug!(worker = child.as_raw(), error = %e, "kill failed");
    }
    match waitpid(child, None) {
        Ok(status) => describe(status),
        Err(e) => format!("unknown ({e})"),
    }
}

fn describe(status: WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exited with {code}"),
        WaitStatus::Signaled(_, signal, _) => format!("killed by {signal:?}"),
        other => format!("{other:?}"),
    }
}
