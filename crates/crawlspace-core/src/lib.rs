//! # crawlspace-core
//!
//! Low-level Linux primitives for observing containers from the host.
//!
//! This crate provides:
//! - **Namespaces**: a reversible binding of the calling process to a
//!   target process's user, pid, uts, ipc, net, and mount namespaces.
//! - **Cgroups**: per-core CPU utilization and memory usage for a
//!   cgroup-confined container, computed from cumulative counters.
//! - **Logging gate**: process-wide suppression of log output while the
//!   process is attached to a foreign mount namespace.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::float_cmp))]

pub mod cgroup;
pub mod clock;
pub mod host;
pub mod logging;
pub mod namespace;
