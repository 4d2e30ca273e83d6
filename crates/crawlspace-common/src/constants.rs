//! System-wide constants and default paths.

/// Default procfs mount point.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Default cgroup filesystem mount point.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default wall-clock bound for one isolated call, in seconds.
pub const DEFAULT_ISOLATION_TIMEOUT_SECS: u64 = 30;

/// Forced wait between the two CPU samples when no previous sample exists.
pub const DEFAULT_COLD_START_INTERVAL_MS: u64 = 100;

/// Nanoseconds per second, the unit of cgroup v1 cumulative CPU counters.
pub const NANOS_PER_SEC: f64 = 1e9;

/// Upper bound on the encoded size of one worker result.
pub const MAX_WORKER_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Application name used in CLI output.
pub const APP_NAME: &str = "crawlspace";
