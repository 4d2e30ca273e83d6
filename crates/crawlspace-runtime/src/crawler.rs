//! One crawl cycle over many containers.
//!
//! Every target gets a report; a failing feature is recorded in that
//! target's report and never stops the cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crawlspace_common::config::{CrawlerConfig, Feature};
use crawlspace_common::error::Result;
use crawlspace_common::types::{ContainerId, CrawlTarget};
use crawlspace_core::cgroup::{ContainerCgroup, CpuSampler, InMemorySampleCache, MemorySampler};
use crawlspace_core::clock::SystemClock;
use crawlspace_core::host::{ProcMeminfoHost, ProcStatHostCpu};
use crawlspace_core::namespace::{NamespaceOps, SyscallNamespaceOps};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::IsolatedExecutor;
use crate::probes;

/// Result of collecting one feature for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FeatureOutcome {
    /// The feature was collected.
    Ok {
        /// Feature payload.
        value: serde_json::Value,
    },
    /// The feature could not be collected.
    Failed {
        /// Rendered error.
        error: String,
    },
}

impl FeatureOutcome {
    /// Whether the feature was collected.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Everything collected for one container in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerReport {
    /// Container the report is about.
    pub container_id: ContainerId,
    /// Pid used to reach the container's namespaces.
    pub pid: i32,
    /// Outcome per requested feature.
    pub features: BTreeMap<Feature, FeatureOutcome>,
}

/// One pass over all targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlCycle {
    /// Unique id of the cycle.
    pub id: Uuid,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// One report per target, in target order.
    pub containers: Vec<ContainerReport>,
}

/// Collects the configured features from containers.
pub struct Crawler<O: NamespaceOps = SyscallNamespaceOps> {
    config: CrawlerConfig,
    executor: IsolatedExecutor<O>,
    cpu: CpuSampler,
    memory: MemorySampler,
}

impl Crawler<SyscallNamespaceOps> {
    /// Builds a crawler against the real host described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn from_config(config: CrawlerConfig) -> Result<Self> {
        config.validate()?;
        let executor = IsolatedExecutor::new(SyscallNamespaceOps::new(&config.proc_root))
            .with_timeout(config.isolation_timeout());
        let cpu = CpuSampler::new(
            Arc::new(InMemorySampleCache::new()),
            Arc::new(SystemClock),
            Arc::new(ProcStatHostCpu::new(&config.proc_root)),
        )
        .with_cold_start_interval(config.cold_start_interval());
        let memory = MemorySampler::new(Arc::new(ProcMeminfoHost::new(&config.proc_root)));
        Ok(Self::new(config, executor, cpu, memory))
    }
}

impl<O: NamespaceOps> Crawler<O> {
    /// Assembles a crawler from parts.
    pub fn new(
        config: CrawlerConfig,
        executor: IsolatedExecutor<O>,
        cpu: CpuSampler,
        memory: MemorySampler,
    ) -> Self {
        Self {
            config,
            executor,
            cpu,
            memory,
        }
    }

    /// Configuration in use.
    pub const fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Crawls every target once.
    pub fn crawl(&self, targets: &[CrawlTarget]) -> CrawlCycle {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(cycle = %id, targets = targets.len(), "crawl cycle started");

        let containers: Vec<_> = targets.iter().map(|t| self.crawl_container(t)).collect();

        let failed = containers
            .iter()
            .flat_map(|c| c.features.values())
            .filter(|o| !o.is_ok())
            .count();
        tracing::info!(cycle = %id, failed, "crawl cycle finished");

        CrawlCycle {
            id,
            started_at,
            containers,
        }
    }

    /// Collects every configured feature for one container.
    pub fn crawl_container(&self, target: &CrawlTarget) -> ContainerReport {
        let features = self
            .config
            .features
            .iter()
            .map(|&feature| {
                let outcome = match self.collect(feature, target) {
                    Ok(value) => FeatureOutcome::Ok { value },
                    Err(err) => {
                        tracing::warn!(
                            container = %target.container_id,
                            %feature,
                            error = %err,
                            "feature failed"
                        );
                        FeatureOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                };
                (feature, outcome)
            })
            .collect();

        ContainerReport {
            container_id: target.container_id.clone(),
            pid: target.pid,
            features,
        }
    }

    fn collect(&self, feature: Feature, target: &CrawlTarget) -> Result<serde_json::Value> {
        let namespaces = &self.config.namespaces;
        let value = match feature {
            Feature::Os => {
                serde_json::to_value(self.executor.run(target.pid, namespaces, probes::os_info)?)?
            }
            Feature::Process => serde_json::to_value(self.executor.run_sequence(
                target.pid,
                namespaces,
                || probes::processes(&probes::container_proc_root()),
            )?)?,
            Feature::Cpu => {
                let cgroup = self.cgroup(&target.container_id);
                serde_json::to_value(self.cpu.sample(&target.container_id, &cgroup.cpu)?)?
            }
            Feature::Memory => {
                let cgroup = self.cgroup(&target.container_id);
                serde_json::to_value(self.memory.sample(&target.container_id, &cgroup.memory)?)?
            }
        };
        Ok(value)
    }

    fn cgroup(&self, id: &ContainerId) -> ContainerCgroup {
        ContainerCgroup::resolve(&self.config.cgroup_root, self.config.cgroup_layout, id)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    use crawlspace_common::config::CgroupLayout;
    use crawlspace_common::types::NamespaceKind;
    use crawlspace_core::clock::ManualClock;
    use crawlspace_core::host::{HostCoreTimes, HostCpuSource, HostMemorySource};
    use crawlspace_core::namespace::ProcRef;

    use super::*;
    use crate::preload::ModulePreloader;

    /// Namespace operations that never touch the kernel.
    struct NoopOps;

    impl NamespaceOps for NoopOps {
        type Handle = ();

        fn open_namespace(&self, _proc: ProcRef, _kind: NamespaceKind) -> io::Result<()> {
            Ok(())
        }

        fn enter(&self, _handle: &(), _kind: NamespaceKind) -> io::Result<()> {
            Ok(())
        }

        fn close(&self, _handle: ()) -> io::Result<()> {
            Ok(())
        }
    }

    struct IdleHost;

    impl HostCpuSource for IdleHost {
        fn per_core(&self) -> io::Result<Vec<HostCoreTimes>> {
            Ok(Vec::new())
        }
    }

    impl HostMemorySource for IdleHost {
        fn free_bytes(&self) -> io::Result<u64> {
            Ok(1 << 20)
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn crawler(cgroup_root: &Path, features: Vec<Feature>) -> Crawler<NoopOps> {
        let config = CrawlerConfig {
            cgroup_root: cgroup_root.to_path_buf(),
            cgroup_layout: CgroupLayout::V1,
            features,
            ..CrawlerConfig::default()
        };
        let executor = IsolatedExecutor::new(NoopOps)
            .with_timeout(Duration::from_secs(5))
            .with_preloader(ModulePreloader::empty());
        let cpu = CpuSampler::new(
            Arc::new(InMemorySampleCache::new()),
            Arc::new(ManualClock::new()),
            Arc::new(IdleHost),
        );
        let memory = MemorySampler::new(Arc::new(IdleHost));
        Crawler::new(config, executor, cpu, memory)
    }

    #[test]
    fn memory_feature_is_reported_per_container() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("memory/docker/abc");
        write(&dir.join("memory.stat"), "total_cache 10\ntotal_active_file 4\n");
        write(&dir.join("memory.limit_in_bytes"), "1000\n");
        write(&dir.join("memory.usage_in_bytes"), "250\n");

        let crawler = crawler(root.path(), vec![Feature::Memory]);
        let cycle = crawler.crawl(&["abc:1".parse().unwrap()]);

        assert_eq!(cycle.containers.len(), 1);
        let report = &cycle.containers[0];
        assert_eq!(report.container_id.as_str(), "abc");
        match &report.features[&Feature::Memory] {
            FeatureOutcome::Ok { value } => {
                assert_eq!(value["used"], 250);
                assert_eq!(value["free"], 750);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn failing_container_does_not_stop_the_cycle() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("memory/docker/good");
        write(&dir.join("memory.stat"), "total_cache 0\ntotal_active_file 0\n");
        write(&dir.join("memory.limit_in_bytes"), "10\n");
        write(&dir.join("memory.usage_in_bytes"), "5\n");

        let crawler = crawler(root.path(), vec![Feature::Memory, Feature::Cpu]);
        let targets = ["missing:1".parse().unwrap(), "good:2".parse().unwrap()];
        let cycle = crawler.crawl(&targets);

        assert_eq!(cycle.containers.len(), 2);
        assert!(cycle.containers[0].features.values().all(|o| !o.is_ok()));
        assert!(cycle.containers[1].features[&Feature::Memory].is_ok());
        assert!(!cycle.containers[1].features[&Feature::Cpu].is_ok());
    }

    #[test]
    fn isolated_os_feature_runs_in_worker() {
        let root = tempfile::tempdir().unwrap();
        let crawler = crawler(root.path(), vec![Feature::Os]);
        let report = crawler.crawl_container(&"self:1".parse().unwrap());

        match &report.features[&Feature::Os] {
            FeatureOutcome::Ok { value } => assert!(value["hostname"].is_string()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let failed = FeatureOutcome::Failed {
            error: "boom".into(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
