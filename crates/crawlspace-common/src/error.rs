//! Unified error types for the Crawlspace workspace.
//!
//! [`CrawlError`] is the taxonomy every crate reports through. Probe failures
//! travel across the worker process boundary as plain data ([`ProbeError`]),
//! so they never depend on an error object being serializable.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NamespaceKind;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Joining a namespace whose failure cannot be tolerated (mount) failed.
    #[error("failed to attach to {kind} namespace: {source}")]
    NamespaceAttach {
        /// Namespace that could not be opened or entered.
        kind: NamespaceKind,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The host's own mount namespace could not be restored.
    ///
    /// There is no safe continuation after this: the process is left
    /// looking at a foreign filesystem.
    #[error("failed to restore host {kind} namespace: {source}")]
    NamespaceRestore {
        /// Namespace that could not be re-entered.
        kind: NamespaceKind,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// No result arrived from the worker within the time bound.
    #[error("isolated call into pid {pid} timed out after {timeout:?}")]
    IsolationTimeout {
        /// Target process whose namespaces were joined.
        pid: i32,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// The probe ran and reported a failure.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// The worker process exited without delivering a result.
    #[error("worker for pid {pid} exited without a result: {detail}")]
    WorkerCrashed {
        /// Target process whose namespaces were joined.
        pid: i32,
        /// Exit status or channel failure observed by the caller.
        detail: String,
    },

    /// Spawning the worker process failed.
    #[error("failed to fork worker: {source}")]
    Fork {
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A cgroup read or parse failed while sampling a container.
    #[error("resource sample for container {container} failed: {message}")]
    ResourceSample {
        /// Container being sampled.
        container: String,
        /// Description of the failed read.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Failure reported by a probe, carried across the worker boundary as data.
///
/// `kind` names the error class the probe raised (for example `"NotFound"`
/// or a feature-specific tag) and `message` its text. The caller re-raises
/// a `ProbeError` with both fields intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ProbeError {
    /// Error class reported by the probe.
    pub kind: String,
    /// Human-readable failure description.
    pub message: String,
}

impl ProbeError {
    /// Creates a probe error with an explicit class and message.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("{:?}", err.kind()), err.to_string())
    }
}

impl From<CrawlError> for ProbeError {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::Probe(inner) => inner,
            sample @ CrawlError::ResourceSample { .. } => {
                Self::new("ResourceSample", sample.to_string())
            }
            other => Self::new("Crawl", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_error_survives_json_roundtrip() {
        let err = ProbeError::new("FooError", "oops");
        let json = serde_json::to_string(&err).unwrap();
        let back: ProbeError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.to_string(), "FooError: oops");
    }

    #[test]
    fn io_error_keeps_its_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = ProbeError::from(io);
        assert_eq!(err.kind, "NotFound");
        assert_eq!(err.message, "no such file");
    }

    #[test]
    fn crawl_error_unwraps_nested_probe_error() {
        let err = ProbeError::from(CrawlError::Probe(ProbeError::new("X", "y")));
        assert_eq!(err, ProbeError::new("X", "y"));
    }

    #[test]
    fn timeout_message_names_pid() {
        let err = CrawlError::IsolationTimeout {
            pid: 42,
            timeout: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "isolated call into pid 42 timed out after 3s");
    }
}
