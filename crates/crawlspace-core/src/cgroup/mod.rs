//! Cgroup accounting for crawled containers.
//!
//! Resolves where a container's CPU and memory counters live under the
//! host's cgroup mount and parses the pseudo-files found there. Both the
//! per-controller v1 hierarchy that docker uses (`cpuacct/docker/<id>`) and
//! the unified v2 hierarchy (`system.slice/docker-<id>.scope`) are supported.

pub mod cache;
pub mod cpu;
pub mod memory;

use std::collections::HashMap;
use std::io;
use std::path::Path;

use crawlspace_common::config::CgroupLayout;
use crawlspace_common::types::ContainerId;

pub use cache::{ContainerCpuSample, InMemorySampleCache, SampleCache};
pub use cpu::{CoreUsage, CpuAccountingFiles, CpuSampler};
pub use memory::{MemoryFiles, MemorySampler, MemoryUsage};

/// Accounting files of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCgroup {
    /// CPU counters.
    pub cpu: CpuAccountingFiles,
    /// Memory counters.
    pub memory: MemoryFiles,
}

impl ContainerCgroup {
    /// Resolves the accounting files of a docker container under `root`.
    #[must_use]
    pub fn resolve(root: &Path, layout: CgroupLayout, id: &ContainerId) -> Self {
        match layout {
            CgroupLayout::V1 => {
                let cpu_dir = root.join("cpuacct").join("docker").join(id.as_str());
                let mem_dir = root.join("memory").join("docker").join(id.as_str());
                Self {
                    cpu: CpuAccountingFiles {
                        usage: cpu_dir.join("cpuacct.usage_percpu"),
                        stat: cpu_dir.join("cpuacct.stat"),
                        layout,
                    },
                    memory: MemoryFiles {
                        stat: mem_dir.join("memory.stat"),
                        limit: mem_dir.join("memory.limit_in_bytes"),
                        usage: mem_dir.join("memory.usage_in_bytes"),
                        layout,
                    },
                }
            }
            CgroupLayout::V2 => {
                let dir = root
                    .join("system.slice")
                    .join(format!("docker-{}.scope", id.as_str()));
                Self {
                    cpu: CpuAccountingFiles {
                        usage: dir.join("cpu.stat"),
                        stat: dir.join("cpu.stat"),
                        layout,
                    },
                    memory: MemoryFiles {
                        stat: dir.join("memory.stat"),
                        limit: dir.join("memory.max"),
                        usage: dir.join("memory.current"),
                        layout,
                    },
                }
            }
        }
    }
}

/// Reads a pseudo-file, attaching the path to the error message.
pub(crate) fn read_file(path: &Path) -> io::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

/// Parses `key value` lines, ignoring lines whose value is not an integer.
pub(crate) fn parse_keyed(content: &str) -> HashMap<&str, u64> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let key = fields.next()?;
            let value = fields.next()?.parse().ok()?;
            Some((key, value))
        })
        .collect()
}

/// Parses a single integer value, as found in `memory.usage_in_bytes`.
pub(crate) fn parse_single(path: &Path, content: &str) -> io::Result<u64> {
    content.trim().parse().map_err(|e| invalid_data(path, e))
}

pub(crate) fn invalid_data(path: &Path, detail: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {detail}", path.display()),
    )
}

pub(crate) fn missing_key(path: &Path, key: &str) -> io::Error {
    invalid_data(path, format_args!("missing key {key}"))
}

/// Writes a fixture file, creating parent directories.
#[cfg(test)]
pub(crate) fn write_fixture(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn v1_layout_uses_per_controller_docker_dirs() {
        let cg = ContainerCgroup::resolve(
            Path::new("/sys/fs/cgroup"),
            CgroupLayout::V1,
            &ContainerId::new("abc"),
        );
        assert_eq!(
            cg.cpu.usage,
            PathBuf::from("/sys/fs/cgroup/cpuacct/docker/abc/cpuacct.usage_percpu")
        );
        assert_eq!(
            cg.memory.limit,
            PathBuf::from("/sys/fs/cgroup/memory/docker/abc/memory.limit_in_bytes")
        );
    }

    #[test]
    fn v2_layout_uses_systemd_scope() {
        let cg = ContainerCgroup::resolve(
            Path::new("/sys/fs/cgroup"),
            CgroupLayout::V2,
            &ContainerId::new("abc"),
        );
        assert_eq!(
            cg.cpu.stat,
            PathBuf::from("/sys/fs/cgroup/system.slice/docker-abc.scope/cpu.stat")
        );
        assert_eq!(
            cg.memory.usage,
            PathBuf::from("/sys/fs/cgroup/system.slice/docker-abc.scope/memory.current")
        );
    }

    #[test]
    fn keyed_parser_skips_malformed_lines() {
        let parsed = parse_keyed("user 10\nsystem 20\nbroken\nname value\n");
        assert_eq!(parsed.get("user"), Some(&10));
        assert_eq!(parsed.get("system"), Some(&20));
        assert_eq!(parsed.len(), 2);
    }
}
