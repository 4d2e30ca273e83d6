//! Domain primitive types used across the Crawlspace workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CrawlError;

/// Identifier of a crawled container (the runtime's long id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of Linux namespace that can be joined through `/proc/<pid>/ns/<kind>`.
///
/// Variants are declared in canonical entry order. The mount namespace is
/// always entered last because it changes path resolution for everything
/// after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// User and group ID mappings.
    User,
    /// Process ID space (applies to children created after entry).
    Pid,
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Network stack.
    Net,
    /// Mount table.
    Mnt,
}

impl NamespaceKind {
    /// Every namespace kind, in canonical entry order.
    pub const ALL: [Self; 6] = [
        Self::User,
        Self::Pid,
        Self::Uts,
        Self::Ipc,
        Self::Net,
        Self::Mnt,
    ];

    /// Name of the entry under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Pid => "pid",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "net",
            Self::Mnt => "mnt",
        }
    }

    /// Whether a failure to open or enter this namespace must abort the call.
    #[must_use]
    pub const fn is_mandatory(self) -> bool {
        matches!(self, Self::Mnt)
    }

    /// Returns `requested` deduplicated and sorted into entry order, mount last.
    #[must_use]
    pub fn ordered_for_entry(requested: &[Self]) -> Vec<Self> {
        let mut kinds = requested.to_vec();
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for NamespaceKind {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "user" => Ok(Self::User),
            "pid" => Ok(Self::Pid),
            "uts" => Ok(Self::Uts),
            "ipc" => Ok(Self::Ipc),
            "net" => Ok(Self::Net),
            "mnt" | "mount" => Ok(Self::Mnt),
            other => Err(CrawlError::Config {
                message: format!("unknown namespace kind: {other}"),
            }),
        }
    }
}

/// A container to crawl, addressed through one of its live processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTarget {
    /// Container long id, used for cgroup paths and cache keys.
    pub container_id: ContainerId,
    /// A process inside the container whose namespaces are joined.
    pub pid: i32,
}

impl FromStr for CrawlTarget {
    type Err = CrawlError;

    /// Parses `<container_id>:<pid>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, pid) = s.rsplit_once(':').ok_or_else(|| CrawlError::Config {
            message: format!("target must be <container_id>:<pid>, got {s}"),
        })?;
        if id.is_empty() {
            return Err(CrawlError::Config {
                message: format!("empty container id in target {s}"),
            });
        }
        let pid = pid.parse::<i32>().map_err(|e| CrawlError::Config {
            message: format!("invalid pid in target {s}: {e}"),
        })?;
        Ok(Self {
            container_id: ContainerId::new(id),
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_order_puts_mount_last() {
        let ordered = NamespaceKind::ordered_for_entry(&[
            NamespaceKind::Mnt,
            NamespaceKind::Net,
            NamespaceKind::User,
            NamespaceKind::Net,
        ]);
        assert_eq!(
            ordered,
            vec![NamespaceKind::User, NamespaceKind::Net, NamespaceKind::Mnt]
        );
    }

    #[test]
    fn only_mount_is_mandatory() {
        let mandatory: Vec<_> = NamespaceKind::ALL
            .into_iter()
            .filter(|k| k.is_mandatory())
            .collect();
        assert_eq!(mandatory, vec![NamespaceKind::Mnt]);
    }

    #[test]
    fn kind_parses_proc_names() {
        for kind in NamespaceKind::ALL {
            assert_eq!(kind.proc_name().parse::<NamespaceKind>().unwrap(), kind);
        }
        assert!("cgroup".parse::<NamespaceKind>().is_err());
    }

    #[test]
    fn kind_serializes_lowercase() {
        let json = serde_json::to_string(&NamespaceKind::Mnt).unwrap();
        assert_eq!(json, "\"mnt\"");
    }

    #[test]
    fn target_parses_id_and_pid() {
        let target: CrawlTarget = "abc123:4242".parse().unwrap();
        assert_eq!(target.container_id.as_str(), "abc123");
        assert_eq!(target.pid, 4242);
    }

    #[test]
    fn target_rejects_missing_pid() {
        assert!("abc123".parse::<CrawlTarget>().is_err());
        assert!("abc123:x".parse::<CrawlTarget>().is_err());
        assert!(":12".parse::<CrawlTarget>().is_err());
    }
}
