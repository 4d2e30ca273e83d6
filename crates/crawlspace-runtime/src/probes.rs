//! Built-in probes run inside a container's namespaces.
//!
//! Each probe reads the system as the container sees it: the hostname from
//! its UTS namespace, files and `/proc` from its mount namespace.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crawlspace_common::error::ProbeError;
use serde::{Deserialize, Serialize};

/// Operating system identity of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    /// Hostname in the container's UTS namespace.
    pub hostname: String,
    /// `ID` from os-release.
    pub id: Option<String>,
    /// `VERSION_ID` from os-release.
    pub version_id: Option<String>,
    /// `PRETTY_NAME` from os-release.
    pub pretty_name: Option<String>,
}

/// One process visible in the container's pid namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Process id in the container's pid namespace.
    pub pid: i32,
    /// Parent process id.
    pub ppid: i32,
    /// Command name (`comm`).
    pub command: String,
    /// Scheduler state letter.
    pub state: String,
}

const OS_RELEASE_PATHS: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

/// Reports hostname and os-release fields.
///
/// # Errors
///
/// Returns a probe error if the hostname cannot be read. A missing
/// os-release file only leaves the release fields empty.
pub fn os_info() -> Result<OsInfo, ProbeError> {
    let hostname = nix::unistd::gethostname()
        .map_err(|e| ProbeError::new("Hostname", e.to_string()))?
        .to_string_lossy()
        .into_owned();

    let release = OS_RELEASE_PATHS
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .map(|content| parse_os_release(&content))
        .unwrap_or_default();

    Ok(OsInfo {
        hostname,
        id: release.get("ID").cloned(),
        version_id: release.get("VERSION_ID").cloned(),
        pretty_name: release.get("PRETTY_NAME").cloned(),
    })
}

/// Parses `KEY=value` lines, stripping optional quotes.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

/// Lazily lists the processes under `proc_root`.
///
/// Entries that vanish or cannot be parsed while iterating are skipped.
///
/// # Errors
///
/// Returns a probe error if `proc_root` cannot be listed.
pub fn processes(
    proc_root: &Path,
) -> Result<impl Iterator<Item = ProcessRecord> + use<>, ProbeError> {
    let entries = fs::read_dir(proc_root)?;
    Ok(entries.filter_map(|entry| {
        let entry = entry.ok()?;
        let pid: i32 = entry.file_name().to_str()?.parse().ok()?;
        let stat = fs::read_to_string(entry.path().join("stat")).ok()?;
        parse_stat(pid, &stat)
    }))
}

/// Parses `/proc/<pid>/stat`, whose `comm` field may contain spaces and parentheses.
pub fn parse_stat(pid: i32, stat: &str) -> Option<ProcessRecord> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let command = stat.get(open + 1..close)?.to_string();
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.to_string();
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcessRecord {
        pid,
        ppid,
        command,
        state,
    })
}

/// Procfs as mounted inside the joined mount namespace.
#[must_use]
pub fn container_proc_root() -> PathBuf {
    PathBuf::from(crawlspace_common::constants::DEFAULT_PROC_ROOT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_strips_quotes_and_comments() {
        let parsed = parse_os_release(
            "# comment\nNAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID='3.19.1'\n\nBROKEN\n",
        );
        assert_eq!(parsed.get("NAME").map(String::as_str), Some("Alpine Linux"));
        assert_eq!(parsed.get("ID").map(String::as_str), Some("alpine"));
        assert_eq!(parsed.get("VERSION_ID").map(String::as_str), Some("3.19.1"));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn stat_with_spaces_in_comm_parses() {
        let record = parse_stat(12, "12 (my (odd) proc) S 1 12 12 0 -1").unwrap();
        assert_eq!(record.command, "my (odd) proc");
        assert_eq!(record.state, "S");
        assert_eq!(record.ppid, 1);
    }

    #[test]
    fn truncated_stat_is_skipped() {
        assert!(parse_stat(1, "1 (init").is_none());
        assert!(parse_stat(1, "1 (init) S").is_none());
    }

    #[test]
    fn process_listing_ignores_non_pid_entries() {
        let dir = tempfile::tempdir().unwrap();
        for (pid, stat) in [("1", "1 (init) S 0 1"), ("42", "42 (sh) R 1 42")] {
            fs::create_dir(dir.path().join(pid)).unwrap();
            fs::write(dir.path().join(pid).join("stat"), stat).unwrap();
        }
        fs::create_dir(dir.path().join("sys")).unwrap();
        fs::create_dir(dir.path().join("99")).unwrap();

        let mut records: Vec<_> = processes(dir.path()).unwrap().collect();
        records.sort_by_key(|r| r.pid);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].command, "sh");
        assert_eq!(records[1].ppid, 1);
    }

    #[test]
    fn own_os_info_has_hostname() {
        let info = os_info().unwrap();
        assert!(!info.hostname.is_empty());
    }
}
