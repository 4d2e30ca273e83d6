//! `crawlspace sample`: Show cgroup CPU and memory usage of containers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use crawlspace_common::config::{CgroupLayout, CrawlerConfig};
use crawlspace_common::types::ContainerId;
use crawlspace_core::cgroup::{ContainerCgroup, CpuSampler, InMemorySampleCache, MemorySampler};
use crawlspace_core::clock::SystemClock;
use crawlspace_core::host::{ProcMeminfoHost, ProcStatHostCpu};

use crate::output::{format_bytes, format_percent};

/// Arguments for the `sample` command.
#[derive(Args, Debug)]
pub struct SampleArgs {
    /// Docker container id (full length). Repeatable.
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Cgroup filesystem mount point.
    #[arg(long)]
    pub cgroup_root: Option<PathBuf>,

    /// Cgroup hierarchy layout (`v1` or `v2`).
    #[arg(long, value_parser = parse_layout)]
    pub layout: Option<CgroupLayout>,
}

fn parse_layout(s: &str) -> Result<CgroupLayout, String> {
    match s {
        "v1" => Ok(CgroupLayout::V1),
        "v2" => Ok(CgroupLayout::V2),
        other => Err(format!("unknown cgroup layout: {other}")),
    }
}

/// Executes the `sample` command.
///
/// Each container is sampled once on a cold cache, so every CPU figure
/// covers the configured cold-start interval.
///
/// # Errors
///
/// Returns an error if the configuration is invalid. A container whose
/// counters cannot be read is reported inline.
pub fn execute(args: SampleArgs, mut config: CrawlerConfig) -> anyhow::Result<()> {
    if let Some(root) = args.cgroup_root {
        config.cgroup_root = root;
    }
    if let Some(layout) = args.layout {
        config.cgroup_layout = layout;
    }
    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

    let cpu = CpuSampler::new(
        Arc::new(InMemorySampleCache::new()),
        Arc::new(SystemClock),
        Arc::new(ProcStatHostCpu::new(&config.proc_root)),
    )
    .with_cold_start_interval(config.cold_start_interval());
    let memory = MemorySampler::new(Arc::new(ProcMeminfoHost::new(&config.proc_root)));

    println!(
        "{:<16} {:>6} {:>10} {:>12} {:>12} {:>8}",
        "CONTAINER", "CORES", "CPU", "MEM USED", "MEM FREE", "MEM"
    );
    for raw in &args.containers {
        let id = ContainerId::new(raw.as_str());
        let cgroup = ContainerCgroup::resolve(&config.cgroup_root, config.cgroup_layout, &id);
        let short: String = raw.chars().take(12).collect();

        let cores = match cpu.sample(&id, &cgroup.cpu) {
            Ok(cores) => cores,
            Err(e) => {
                println!("{short:<16} error: {e}");
                continue;
            }
        };
        #[allow(clippy::cast_precision_loss)]
        let avg = if cores.is_empty() {
            0.0
        } else {
            cores.iter().map(|c| c.utilization).sum::<f64>() / cores.len() as f64
        };

        match memory.sample(&id, &cgroup.memory) {
            Ok(mem) => println!(
                "{short:<16} {:>6} {:>10} {:>12} {:>12} {:>8}",
                cores.len(),
                format_percent(Some(avg)),
                format_bytes(mem.used),
                format_bytes(mem.free),
                format_percent(mem.utilization),
            ),
            Err(e) => println!(
                "{short:<16} {:>6} {:>10} error: {e}",
                cores.len(),
                format_percent(Some(avg)),
            ),
        }
    }
    Ok(())
}
