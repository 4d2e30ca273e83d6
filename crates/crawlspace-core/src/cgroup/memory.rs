//! Memory usage of a cgroup-confined container.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crawlspace_common::config::CgroupLayout;
use crawlspace_common::error::{CrawlError, Result};
use crawlspace_common::types::ContainerId;
use serde::Serialize;

use super::{missing_key, parse_keyed, parse_single, read_file};
use crate::host::HostMemorySource;

/// Location and format of a container's memory counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFiles {
    /// `memory.stat`.
    pub stat: PathBuf,
    /// Byte limit: `memory.limit_in_bytes` (v1) or `memory.max` (v2).
    pub limit: PathBuf,
    /// Byte usage: `memory.usage_in_bytes` (v1) or `memory.current` (v2).
    pub usage: PathBuf,
    /// Which format the files are in.
    pub layout: CgroupLayout,
}

/// Memory figures of one container, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryUsage {
    /// Bytes charged to the container.
    pub used: u64,
    /// Bytes the container could still use.
    pub free: u64,
    /// Active file-backed pages.
    pub buffered: u64,
    /// Page cache.
    pub cached: u64,
    /// `used / (used + free)` in percent; `None` when both are zero.
    pub utilization: Option<f64>,
}

/// Reads container memory counters and derives free memory from the
/// container limit and the host's free memory.
pub struct MemorySampler {
    host: Arc<dyn HostMemorySource>,
}

impl MemorySampler {
    /// Creates a sampler borrowing free memory from `host`.
    pub fn new(host: Arc<dyn HostMemorySource>) -> Self {
        Self { host }
    }

    /// Samples the container's memory counters.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::ResourceSample`] if the stat, limit, or usage
    /// file (or host free memory) cannot be read. No partial result is
    /// returned.
    pub fn sample(&self, id: &ContainerId, files: &MemoryFiles) -> Result<MemoryUsage> {
        self.read(files).map_err(|e| CrawlError::ResourceSample {
            container: id.to_string(),
            message: e.to_string(),
        })
    }

    fn read(&self, files: &MemoryFiles) -> io::Result<MemoryUsage> {
        let stat = read_file(&files.stat)?;
        let keyed = parse_keyed(&stat);
        let (cache_key, active_key) = match files.layout {
            CgroupLayout::V1 => ("total_cache", "total_active_file"),
            CgroupLayout::V2 => ("file", "active_file"),
        };
        let cached = keyed
            .get(cache_key)
            .copied()
            .ok_or_else(|| missing_key(&files.stat, cache_key))?;
        let buffered = keyed
            .get(active_key)
            .copied()
            .ok_or_else(|| missing_key(&files.stat, active_key))?;

        let limit_raw = read_file(&files.limit)?;
        let limit = if limit_raw.trim() == "max" {
            u64::MAX
        } else {
            parse_single(&files.limit, &limit_raw)?
        };
        let used = parse_single(&files.usage, &read_file(&files.usage)?)?;
        let host_free = self.host.free_bytes()?;

        Ok(derive_usage(used, limit, host_free, cached, buffered))
    }
}

/// Applies `total = used + min(host_free, limit - used)` and `free = total - used`.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn derive_usage(used: u64, limit: u64, host_free: u64, cached: u64, buffered: u64) -> MemoryUsage {
    let headroom = host_free.min(limit.saturating_sub(used));
    let total = used.saturating_add(headroom);
    let free = total - used;
    let denominator = used.saturating_add(free);
    let utilization = (denominator > 0).then(|| used as f64 * 100.0 / denominator as f64);
    MemoryUsage {
        used,
        free,
        buffered,
        cached,
        utilization,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::cgroup::write_fixture;

    struct FixedFree(u64);

    impl HostMemorySource for FixedFree {
        fn free_bytes(&self) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    fn v1_files(dir: &Path) -> MemoryFiles {
        MemoryFiles {
            stat: dir.join("memory.stat"),
            limit: dir.join("memory.limit_in_bytes"),
            usage: dir.join("memory.usage_in_bytes"),
            layout: CgroupLayout::V1,
        }
    }

    #[test]
    fn free_is_bounded_by_limit() {
        let usage = derive_usage(2, 10, 10, 0, 0);
        assert_eq!(usage.free, 8);
        assert_eq!(usage.utilization, Some(20.0));
    }

    #[test]
    fn free_is_bounded_by_host() {
        let usage = derive_usage(2, 100, 3, 0, 0);
        assert_eq!(usage.free, 3);
        assert_eq!(usage.utilization, Some(40.0));
    }

    #[test]
    fn usage_over_limit_leaves_no_headroom() {
        let usage = derive_usage(12, 10, 10, 0, 0);
        assert_eq!(usage.free, 0);
        assert_eq!(usage.utilization, Some(100.0));
    }

    #[test]
    fn empty_container_has_unknown_utilization() {
        assert_eq!(derive_usage(0, 0, 10, 0, 0).utilization, None);
    }

    #[test]
    fn v1_files_are_read_into_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let files = v1_files(dir.path());
        write_fixture(&files.stat, "cache 1\ntotal_cache 300\ntotal_active_file 40\n");
        write_fixture(&files.limit, "10\n");
        write_fixture(&files.usage, "2\n");

        let usage = MemorySampler::new(Arc::new(FixedFree(10)))
            .sample(&ContainerId::new("c1"), &files)
            .unwrap();
        assert_eq!(usage.used, 2);
        assert_eq!(usage.free, 8);
        assert_eq!(usage.cached, 300);
        assert_eq!(usage.buffered, 40);
        assert!(usage.utilization.is_some());
    }

    #[test]
    fn v2_unlimited_max_uses_host_free() {
        let dir = tempfile::tempdir().unwrap();
        let files = MemoryFiles {
            stat: dir.path().join("memory.stat"),
            limit: dir.path().join("memory.max"),
            usage: dir.path().join("memory.current"),
            layout: CgroupLayout::V2,
        };
        write_fixture(&files.stat, "anon 5\nfile 7\nactive_file 3\n");
        write_fixture(&files.limit, "max\n");
        write_fixture(&files.usage, "100\n");

        let usage = MemorySampler::new(Arc::new(FixedFree(50)))
            .sample(&ContainerId::new("c1"), &files)
            .unwrap();
        assert_eq!(usage.free, 50);
        assert_eq!(usage.cached, 7);
        assert_eq!(usage.buffered, 3);
    }

    #[test]
    fn any_missing_file_fails_the_whole_sample() {
        let dir = tempfile::tempdir().unwrap();
        let files = v1_files(dir.path());
        write_fixture(&files.stat, "total_cache 1\ntotal_active_file 1\n");
        write_fixture(&files.usage, "2\n");

        let err = MemorySampler::new(Arc::new(FixedFree(10)))
            .sample(&ContainerId::new("c1"), &files)
            .unwrap_err();
        assert!(matches!(err, CrawlError::ResourceSample { .. }));
    }
}
