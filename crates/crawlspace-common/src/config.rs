//! Configuration model for the crawler.
//!
//! Loaded from a JSON file; every field has a default so a partial file
//! (or no file at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CrawlError, Result};
use crate::types::NamespaceKind;

/// Which cgroup hierarchy the host exposes container accounting under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupLayout {
    /// Per-controller v1 hierarchy (`cpuacct/docker/<id>`, `memory/docker/<id>`).
    #[default]
    V1,
    /// Unified v2 hierarchy (`system.slice/docker-<id>.scope`).
    V2,
}

/// A crawl feature the runtime knows how to collect per container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// Hostname and `/etc/os-release` as seen inside the container.
    Os,
    /// Process table as seen inside the container's pid namespace.
    Process,
    /// Per-core CPU utilization from cgroup counters.
    Cpu,
    /// Memory usage from cgroup counters.
    Memory,
}

impl Feature {
    /// Every feature, in report order.
    pub const ALL: [Self; 4] = [Self::Os, Self::Process, Self::Cpu, Self::Memory];

    /// Whether collecting this feature requires joining the target's namespaces.
    #[must_use]
    pub const fn needs_isolation(self) -> bool {
        matches!(self, Self::Os | Self::Process)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Os => "os",
            Self::Process => "process",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        })
    }
}

impl std::str::FromStr for Feature {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "os" => Ok(Self::Os),
            "process" => Ok(Self::Process),
            "cpu" => Ok(Self::Cpu),
            "memory" => Ok(Self::Memory),
            other => Err(CrawlError::Config {
                message: format!("unknown feature: {other}"),
            }),
        }
    }
}

/// Root configuration for the crawler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Bound on receiving a result from, and joining, an isolated worker.
    pub isolation_timeout_secs: u64,
    /// Namespaces joined for isolated features.
    pub namespaces: Vec<NamespaceKind>,
    /// Host procfs mount point.
    pub proc_root: PathBuf,
    /// Host cgroup filesystem mount point.
    pub cgroup_root: PathBuf,
    /// Layout of container accounting under `cgroup_root`.
    pub cgroup_layout: CgroupLayout,
    /// Forced wait between CPU samples on a cold cache, in milliseconds.
    pub cold_start_interval_ms: u64,
    /// Features collected for every target.
    pub features: Vec<Feature>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            isolation_timeout_secs: constants::DEFAULT_ISOLATION_TIMEOUT_SECS,
            namespaces: NamespaceKind::ALL.to_vec(),
            proc_root: PathBuf::from(constants::DEFAULT_PROC_ROOT),
            cgroup_root: PathBuf::from(constants::DEFAULT_CGROUP_ROOT),
            cgroup_layout: CgroupLayout::default(),
            cold_start_interval_ms: constants::DEFAULT_COLD_START_INTERVAL_MS,
            features: Feature::ALL.to_vec(),
        }
    }
}

impl CrawlerConfig {
    /// Loads a configuration file, filling unspecified fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`CrawlerConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CrawlError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Config`] for a zero timeout or zero cold-start
    /// interval.
    pub fn validate(&self) -> Result<()> {
        if self.isolation_timeout_secs == 0 {
            return Err(CrawlError::Config {
                message: "isolation_timeout_secs must be positive".into(),
            });
        }
        if self.cold_start_interval_ms == 0 {
            return Err(CrawlError::Config {
                message: "cold_start_interval_ms must be positive".into(),
            });
        }
        Ok(())
    }

    /// Isolation bound as a [`Duration`].
    #[must_use]
    pub const fn isolation_timeout(&self) -> Duration {
        Duration::from_secs(self.isolation_timeout_secs)
    }

    /// Cold-start sampling interval as a [`Duration`].
    #[must_use]
    pub const fn cold_start_interval(&self) -> Duration {
        Duration::from_millis(self.cold_start_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_join_every_namespace() {
        let config = CrawlerConfig::default();
        assert_eq!(config.namespaces, NamespaceKind::ALL.to_vec());
        assert_eq!(config.isolation_timeout(), Duration::from_secs(30));
        assert_eq!(config.cold_start_interval(), Duration::from_millis(100));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"isolation_timeout_secs": 5, "cgroup_layout": "v2", "namespaces": ["net", "mnt"]}}"#
        )
        .unwrap();

        let config = CrawlerConfig::load(file.path()).unwrap();
        assert_eq!(config.isolation_timeout_secs, 5);
        assert_eq!(config.cgroup_layout, CgroupLayout::V2);
        assert_eq!(config.namespaces, vec![NamespaceKind::Net, NamespaceKind::Mnt]);
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert_eq!(config.features, Feature::ALL.to_vec());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"isolation_timeout_secs": 0}}"#).unwrap();
        assert!(matches!(
            CrawlerConfig::load(file.path()),
            Err(CrawlError::Config { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = CrawlerConfig::load(Path::new("/nonexistent/crawlspace.json")).unwrap_err();
        assert!(matches!(err, CrawlError::Io { .. }));
    }

    #[test]
    fn only_in_container_features_need_isolation() {
        assert!(Feature::Os.needs_isolation());
        assert!(Feature::Process.needs_isolation());
        assert!(!Feature::Cpu.needs_isolation());
        assert!(!Feature::Memory.needs_isolation());
    }
}
