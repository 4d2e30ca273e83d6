//! Host-wide CPU and memory figures.
//!
//! Some per-container values cannot be derived from cgroup counters
//! (nice, iowait, interrupt, and steal time; free memory). The samplers
//! borrow them from the host through these sources.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Host per-core time shares that have no per-container equivalent, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostCoreTimes {
    /// Time spent on niced user processes.
    pub nice: f64,
    /// Time spent waiting for I/O.
    pub iowait: f64,
    /// Time spent servicing hardware and soft interrupts.
    pub irq: f64,
    /// Time stolen by the hypervisor.
    pub steal: f64,
}

/// Source of host per-core time shares.
pub trait HostCpuSource: Send + Sync {
    /// Returns one entry per logical core, in core order.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if host counters cannot be read.
    fn per_core(&self) -> io::Result<Vec<HostCoreTimes>>;
}

/// Source of host free memory.
pub trait HostMemorySource: Send + Sync {
    /// Free host memory in bytes.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if host counters cannot be read.
    fn free_bytes(&self) -> io::Result<u64>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CoreTicks {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CoreTicks {
    const fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

/// Per-core shares from successive reads of `/proc/stat`.
///
/// Each call reports the shares since the previous call; the first call
/// reports the shares since boot.
///
/// The window is shared by every caller, not kept per container. When one
/// source serves several containers in a cycle, the first container sees
/// the window since the previous cycle and later ones see only the few
/// milliseconds since the preceding container was sampled. Host shares are
/// an approximation of per-container nice, iowait, irq and steal, and
/// short windows make that approximation coarser.
#[derive(Debug)]
pub struct ProcStatHostCpu {
    path: PathBuf,
    last: Mutex<Vec<CoreTicks>>,
}

impl ProcStatHostCpu {
    /// Reads `<proc_root>/stat`.
    #[must_use]
    pub fn new(proc_root: &Path) -> Self {
        Self {
            path: proc_root.join("stat"),
            last: Mutex::new(Vec::new()),
        }
    }
}

impl HostCpuSource for ProcStatHostCpu {
    fn per_core(&self) -> io::Result<Vec<HostCoreTimes>> {
        let content = std::fs::read_to_string(&self.path)?;
        let current = parse_proc_stat(&content);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let shares = current
            .iter()
            .enumerate()
            .map(|(i, now)| {
                let before = last.get(i).copied().unwrap_or_default();
                shares_between(before, *now)
            })
            .collect();
        *last = current;
        Ok(shares)
    }
}

fn parse_proc_stat(content: &str) -> Vec<CoreTicks> {
    content
        .lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .map(|line| {
            let v: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .map(|f| f.parse().unwrap_or(0))
                .collect();
            let at = |i: usize| v.get(i).copied().unwrap_or(0);
            CoreTicks {
                user: at(0),
                nice: at(1),
                system: at(2),
                idle: at(3),
                iowait: at(4),
                irq: at(5),
                softirq: at(6),
                steal: at(7),
            }
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn shares_between(before: CoreTicks, now: CoreTicks) -> HostCoreTimes {
    let total = now.total().saturating_sub(before.total());
    if total == 0 {
        return HostCoreTimes::default();
    }
    let pct = |a: u64, b: u64| a.saturating_sub(b) as f64 / total as f64 * 100.0;
    HostCoreTimes {
        nice: pct(now.nice, before.nice),
        iowait: pct(now.iowait, before.iowait),
        irq: pct(now.irq + now.softirq, before.irq + before.softirq),
        steal: pct(now.steal, before.steal),
    }
}

/// Free memory from `/proc/meminfo` (`MemFree`).
#[derive(Debug, Clone)]
pub struct ProcMeminfoHost {
    path: PathBuf,
}

impl ProcMeminfoHost {
    /// Reads `<proc_root>/meminfo`.
    #[must_use]
    pub fn new(proc_root: &Path) -> Self {
        Self {
            path: proc_root.join("meminfo"),
        }
    }
}

impl HostMemorySource for ProcMeminfoHost {
    fn free_bytes(&self) -> io::Result<u64> {
        let content = std::fs::read_to_string(&self.path)?;
        content
            .lines()
            .find_map(|line| {
                let rest = line.strip_prefix("MemFree:")?;
                let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
                Some(kib * 1024)
            })
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: missing MemFree", self.path.display()),
                )
            })
    }
}
