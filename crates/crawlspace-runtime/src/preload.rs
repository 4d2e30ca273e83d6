//! Resolution of lazily loaded host resources before any namespace switch.
//!
//! Some libc facilities load shared objects or read host files on first use
//! (NSS modules for user lookup, the timezone database). Once the caller has
//! entered a container's mount namespace, those paths resolve inside the
//! container instead. The preloader touches them in the host's view, and
//! spawns and joins one throwaway child so the fork-and-reap path has run
//! once before it is needed under a foreign filesystem.

use std::sync::Once;

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Uid, User, fork};

type Hook = Box<dyn Fn() + Send + Sync>;

/// Runs preload hooks at most once per instance.
pub struct ModulePreloader {
    once: Once,
    hooks: Vec<(&'static str, Hook)>,
}

impl ModulePreloader {
    /// Creates a preloader with the default hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::empty()
            .with_hook("nss", || {
                let _ = User::from_uid(Uid::current());
            })
            .with_hook("timezone", || {
                let _ = chrono::Local::now();
            })
    }

    /// Creates a preloader without hooks (the throwaway child still runs).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            once: Once::new(),
            hooks: Vec::new(),
        }
    }

    /// Adds a named hook.
    #[must_use]
    pub fn with_hook(mut self, name: &'static str, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.push((name, Box::new(hook)));
        self
    }

    /// Whether the hooks have already run.
    pub fn is_loaded(&self) -> bool {
        self.once.is_completed()
    }

    /// Runs every hook and the throwaway child, the first time only.
    pub fn ensure_loaded(&self) {
        self.once.call_once(|| {
            for (name, hook) in &self.hooks {
                tracing::trace!(hook = *name, "preloading");
                hook();
            }
            spawn_and_join();
            tracing::debug!(hooks = self.hooks.len(), "preload complete");
        });
    }
}

impl Default for ModulePreloader {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_and_join() {
    // SAFETY: the child only calls the async-signal-safe `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // SAFETY: terminating the child without running parent-owned destructors.
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => {}
            Ok(status) => tracing::warn!(?status, "preload child exited abnormally"),
            Err(e) => tracing::warn!(error = %e, "failed to reap preload child"),
        },
        Err(e) => tracing::warn!(error = %e, "failed to fork preload child"),
    }
}
