//! Per-core CPU utilization of a cgroup-confined container.
//!
//! Utilization is the delta of two cumulative counter reads over the wall
//! clock between them. The previous read of each container is kept in a
//! [`SampleCache`]; on a cold cache the sampler takes both reads itself,
//! separated by a short forced wait, rather than report a meaningless rate.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crawlspace_common::config::CgroupLayout;
use crawlspace_common::constants::{DEFAULT_COLD_START_INTERVAL_MS, NANOS_PER_SEC};
use crawlspace_common::error::{CrawlError, Result};
use crawlspace_common::types::ContainerId;
use serde::Serialize;

use super::cache::{ContainerCpuSample, SampleCache};
use super::{invalid_data, missing_key, parse_keyed, read_file};
use crate::clock::Clock;
use crate::host::{HostCoreTimes, HostCpuSource};

/// Denominator used when a container has no user or system ticks at all.
const EMPTY_TICKS_DENOMINATOR: f64 = 0.1;

/// Location and format of a container's CPU counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuAccountingFiles {
    /// Cumulative usage: per-core or aggregate nanoseconds (v1), or `cpu.stat` (v2).
    pub usage: PathBuf,
    /// User/system breakdown: `cpuacct.stat` ticks (v1) or `cpu.stat` microseconds (v2).
    pub stat: PathBuf,
    /// Which format the files are in.
    pub layout: CgroupLayout,
}

impl CpuAccountingFiles {
    /// Reads the cumulative usage counters, one per logical core.
    ///
    /// An aggregate counter yields a single entry.
    ///
    /// # Errors
    ///
    /// Returns the I/O or parse error.
    pub fn read_usage(&self) -> io::Result<Vec<u64>> {
        let content = read_file(&self.usage)?;
        match self.layout {
            CgroupLayout::V1 => content
                .split_whitespace()
                .map(|v| v.parse::<u64>().map_err(|e| invalid_data(&self.usage, e)))
                .collect(),
            CgroupLayout::V2 => {
                let usec = parse_keyed(&content)
                    .get("usage_usec")
                    .copied()
                    .ok_or_else(|| missing_key(&self.usage, "usage_usec"))?;
                Ok(vec![usec.saturating_mul(1000)])
            }
        }
    }

    /// Reads the cumulative user and system time, in the file's native unit.
    ///
    /// # Errors
    ///
    /// Returns the I/O error, or `InvalidData` if a key is missing.
    pub fn read_user_system(&self) -> io::Result<(u64, u64)> {
        let content = read_file(&self.stat)?;
        let keyed = parse_keyed(&content);
        let (user_key, system_key) = match self.layout {
            CgroupLayout::V1 => ("user", "system"),
            CgroupLayout::V2 => ("user_usec", "system_usec"),
        };
        let user = keyed
            .get(user_key)
            .copied()
            .ok_or_else(|| missing_key(&self.stat, user_key))?;
        let system = keyed
            .get(system_key)
            .copied()
            .ok_or_else(|| missing_key(&self.stat, system_key))?;
        Ok((user, system))
    }
}

/// Utilization of one logical core over the sampled interval, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CoreUsage {
    /// `100 - utilization`.
    pub idle: f64,
    /// Host value for the same core.
    pub nice: f64,
    /// Share of utilization attributed to user time.
    pub user: f64,
    /// Host iowait for the same core.
    pub wait: f64,
    /// Share of utilization attributed to system time.
    pub system: f64,
    /// Host interrupt time for the same core.
    pub interrupt: f64,
    /// Host steal time for the same core.
    pub steal: f64,
    /// Container busy time, clamped to `[0, 100]`.
    pub utilization: f64,
}

/// Computes [`CoreUsage`] per core for containers.
pub struct CpuSampler {
    cache: Arc<dyn SampleCache>,
    clock: Arc<dyn Clock>,
    host: Arc<dyn HostCpuSource>,
    cold_start_interval: Duration,
}

impl CpuSampler {
    /// Creates a sampler over the given cache, clock, and host source.
    pub fn new(
        cache: Arc<dyn SampleCache>,
        clock: Arc<dyn Clock>,
        host: Arc<dyn HostCpuSource>,
    ) -> Self {
        Self {
            cache,
            clock,
            host,
            cold_start_interval: Duration::from_millis(DEFAULT_COLD_START_INTERVAL_MS),
        }
    }

    /// Overrides the forced wait used on a cold cache.
    #[must_use]
    pub const fn with_cold_start_interval(mut self, interval: Duration) -> Self {
        self.cold_start_interval = interval;
        self
    }

    /// Samples the container's CPU counters and returns per-core usage.
    ///
    /// When the two reads enumerate a different number of cores, the
    /// result covers the shorter of the two.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::ResourceSample`] if any cgroup file cannot be
    /// read or parsed. No partial result is returned.
    pub fn sample(&self, id: &ContainerId, files: &CpuAccountingFiles) -> Result<Vec<CoreUsage>> {
        let fail = |e: io::Error| CrawlError::ResourceSample {
            container: id.to_string(),
            message: e.to_string(),
        };

        let previous = self.cache.get(id);
        let now = self.clock.now();
        let warm = previous.and_then(|p| {
            let interval = now.checked_duration_since(p.sampled_at)?;
            (!interval.is_zero()).then_some((p.per_core_cumulative_ns, interval))
        });

        let (before, current, sampled_at, interval) = match warm {
            Some((before, interval)) => {
                let current = files.read_usage().map_err(fail)?;
                (before, current, now, interval)
            }
            None => {
                tracing::debug!(container = %id, wait = ?self.cold_start_interval, "no previous CPU sample");
                let before = files.read_usage().map_err(fail)?;
                let start = self.clock.now();
                self.clock.sleep(self.cold_start_interval);
                let current = files.read_usage().map_err(fail)?;
                let end = self.clock.now();
                let interval = end
                    .checked_duration_since(start)
                    .filter(|d| !d.is_zero())
                    .unwrap_or(self.cold_start_interval);
                (before, current, end, interval)
            }
        };

        let (user_ticks, system_ticks) = files.read_user_system().map_err(fail)?;

        self.cache.put(ContainerCpuSample {
            container_id: id.clone(),
            per_core_cumulative_ns: current.clone(),
            sampled_at,
        });

        if before.len() != current.len() {
            tracing::warn!(
                container = %id,
                before = before.len(),
                after = current.len(),
                "core count changed between samples"
            );
        }

        let host = self.host.per_core().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "host CPU times unavailable");
            Vec::new()
        });

        Ok(compute_core_usage(
            &before,
            &current,
            interval,
            user_ticks,
            system_ticks,
            &host,
        ))
    }
}

/// Per-core usage from two cumulative nanosecond reads `interval` apart.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn compute_core_usage(
    before: &[u64],
    current: &[u64],
    interval: Duration,
    user_ticks: u64,
    system_ticks: u64,
    host: &[HostCoreTimes],
) -> Vec<CoreUsage> {
    let interval_s = interval.as_secs_f64();
    let mut tick_total = (user_ticks + system_ticks) as f64;
    if tick_total == 0.0 {
        tick_total = EMPTY_TICKS_DENOMINATOR;
    }
    let user_weight = user_ticks as f64 / tick_total;
    let system_weight = system_ticks as f64 / tick_total;

    before
        .iter()
        .zip(current)
        .enumerate()
        .map(|(i, (prev, cur))| {
            let usage_s = cur.saturating_sub(*prev) as f64 / NANOS_PER_SEC;
            let utilization = if interval_s > 0.0 {
                (usage_s / interval_s * 100.0).min(100.0)
            } else {
                0.0
            };
            let host_core = host.get(i).copied().unwrap_or_default();
            CoreUsage {
                idle: 100.0 - utilization,
                nice: host_core.nice,
                user: utilization * user_weight,
                wait: host_core.iowait,
                system: utilization * system_weight,
                interrupt: host_core.irq,
                steal: host_core.steal,
                utilization,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::cgroup::cache::InMemorySampleCache;
    use crate::cgroup::write_fixture;
    use crate::clock::ManualClock;

    struct FixedHost(Vec<HostCoreTimes>);

    impl HostCpuSource for FixedHost {
        fn per_core(&self) -> io::Result<Vec<HostCoreTimes>> {
            Ok(self.0.clone())
        }
    }

    fn v1_files(dir: &Path, usage: &str, stat: &str) -> CpuAccountingFiles {
        let files = CpuAccountingFiles {
            usage: dir.join("cpuacct.usage_percpu"),
            stat: dir.join("cpuacct.stat"),
            layout: CgroupLayout::V1,
        };
        write_fixture(&files.usage, usage);
        write_fixture(&files.stat, stat);
        files
    }

    fn sampler(
        cache: &Arc<InMemorySampleCache>,
        clock: &Arc<ManualClock>,
        host: Vec<HostCoreTimes>,
    ) -> CpuSampler {
        CpuSampler::new(cache.clone(), clock.clone(), Arc::new(FixedHost(host)))
    }

    #[test]
    fn ten_second_interval_gives_twenty_percent() {
        let usage = compute_core_usage(&[1_000_000_000], &[3_000_000_000], Duration::from_secs(10), 50, 50, &[]);
        assert_eq!(usage.len(), 1);
        assert!((usage[0].utilization - 20.0).abs() < 1e-9);
        assert!((usage[0].idle - 80.0).abs() < 1e-9);
        assert!((usage[0].user - 10.0).abs() < 1e-9);
        assert!((usage[0].system - 10.0).abs() < 1e-9);
    }

    #[test]
    fn utilization_is_clamped() {
        let usage = compute_core_usage(&[0], &[5_000_000_000], Duration::from_secs(1), 1, 0, &[]);
        assert_eq!(usage[0].utilization, 100.0);
        assert_eq!(usage[0].idle, 0.0);
        assert_eq!(usage[0].user, 100.0);
    }

    #[test]
    fn zero_ticks_do_not_divide_by_zero() {
        let usage = compute_core_usage(&[0], &[1_000_000_000], Duration::from_secs(2), 0, 0, &[]);
        assert!((usage[0].utilization - 50.0).abs() < 1e-9);
        assert_eq!(usage[0].user, 0.0);
        assert_eq!(usage[0].system, 0.0);
    }

    #[test]
    fn counter_wrap_reports_idle_core() {
        let usage = compute_core_usage(&[9], &[3], Duration::from_secs(1), 1, 1, &[]);
        assert_eq!(usage[0].utilization, 0.0);
        assert_eq!(usage[0].idle, 100.0);
    }

    #[test]
    fn mismatched_core_counts_truncate_to_shorter() {
        let usage = compute_core_usage(&[0, 0, 0], &[1, 1], Duration::from_secs(1), 1, 1, &[]);
        assert_eq!(usage.len(), 2);
    }

    #[test]
    fn host_only_fields_are_copied_per_core() {
        let host = vec![
            HostCoreTimes { nice: 1.0, iowait: 2.0, irq: 3.0, steal: 4.0 },
        ];
        let usage = compute_core_usage(&[0, 0], &[0, 0], Duration::from_secs(1), 1, 1, &host);
        assert_eq!(usage[0].nice, 1.0);
        assert_eq!(usage[0].wait, 2.0);
        assert_eq!(usage[0].interrupt, 3.0);
        assert_eq!(usage[0].steal, 4.0);
        assert_eq!(usage[1], CoreUsage { idle: 100.0, ..CoreUsage::default() });
    }

    #[test]
    fn cold_cache_sleeps_once_and_stores_sample() {
        let dir = tempfile::tempdir().unwrap();
        let files = v1_files(dir.path(), "100 200\n", "user 10\nsystem 30\n");
        let cache = Arc::new(InMemorySampleCache::new());
        let clock = Arc::new(ManualClock::new());
        let id = ContainerId::new("c1");

        let usage = sampler(&cache, &clock, Vec::new()).sample(&id, &files).unwrap();

        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|c| c.utilization.is_finite()));
        let stored = cache.get(&id).unwrap();
        assert_eq!(stored.per_core_cumulative_ns, vec![100, 200]);
        assert_eq!(stored.sampled_at, clock.now());
    }

    #[test]
    fn warm_cache_uses_previous_sample_without_sleeping() {
        let dir = tempfile::tempdir().unwrap();
        let files = v1_files(dir.path(), "3000000000\n", "user 50\nsystem 50\n");
        let cache = Arc::new(InMemorySampleCache::new());
        let clock = Arc::new(ManualClock::new());
        let id = ContainerId::new("c1");
        cache.put(ContainerCpuSample {
            container_id: id.clone(),
            per_core_cumulative_ns: vec![1_000_000_000],
            sampled_at: clock.now(),
        });
        clock.advance(Duration::from_secs(10));

        let usage = sampler(&cache, &clock, Vec::new()).sample(&id, &files).unwrap();

        assert!(clock.sleeps().is_empty());
        assert!((usage[0].utilization - 20.0).abs() < 1e-9);
        assert!((usage[0].user - 10.0).abs() < 1e-9);
        assert_eq!(cache.get(&id).unwrap().per_core_cumulative_ns, vec![3_000_000_000]);
    }

    #[test]
    fn zero_interval_falls_back_to_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let files = v1_files(dir.path(), "5\n", "user 1\nsystem 1\n");
        let cache = Arc::new(InMemorySampleCache::new());
        let clock = Arc::new(ManualClock::new());
        let id = ContainerId::new("c1");
        cache.put(ContainerCpuSample {
            container_id: id.clone(),
            per_core_cumulative_ns: vec![1],
            sampled_at: clock.now(),
        });

        let _ = sampler(&cache, &clock, Vec::new()).sample(&id, &files).unwrap();
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn unreadable_stat_is_one_sample_failure() {
        let dir = tempfile::tempdir().unwrap();
        let files = v1_files(dir.path(), "5\n", "user 1\n");
        let cache = Arc::new(InMemorySampleCache::new());
        let clock = Arc::new(ManualClock::new());

        let err = sampler(&cache, &clock, Vec::new())
            .sample(&ContainerId::new("c1"), &files)
            .unwrap_err();
        assert!(matches!(err, CrawlError::ResourceSample { .. }));
    }

    #[test]
    fn v2_cpu_stat_yields_single_aggregate_core() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu.stat");
        write_fixture(
            &path,
            "usage_usec 2000000\nuser_usec 1500000\nsystem_usec 500000\nnr_periods 0\n",
        );
        let files = CpuAccountingFiles {
            usage: path.clone(),
            stat: path,
            layout: CgroupLayout::V2,
        };
        assert_eq!(files.read_usage().unwrap(), vec![2_000_000_000]);
        assert_eq!(files.read_user_system().unwrap(), (1_500_000, 500_000));
    }
}
