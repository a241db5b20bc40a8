//! The daemon's read-only window into `/proc`.
//!
//! Individual processes vanish or deny access mid-scan all the time; those
//! failures are counted, not propagated, and the observer logs the aggregate
//! once per cycle.

use crate::utils::sanitize_file;
use crate::Error;
use procfs::process::MMapPath;
use procfs::ProcError;
use std::path::PathBuf;
use tracing::trace;

/// One running process as seen during a scan.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: libc::pid_t,
    pub ppid: libc::pid_t,
    pub path: PathBuf,
}

/// A file-backed mapping of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRegion {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Per-scan failure counters, logged once per cycle by the observer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanFailures {
    /// Process disappeared between enumeration and inspection.
    pub vanished: u32,
    /// Access denied (e.g. AppArmor-confined processes).
    pub denied: u32,
    /// Everything else, including unresolvable exe paths.
    pub other: u32,
}

impl ScanFailures {
    pub fn total(&self) -> u32 {
        self.vanished + self.denied + self.other
    }

    fn record(&mut self, err: &ProcError) {
        match err {
            ProcError::NotFound(_) => self.vanished += 1,
            ProcError::PermissionDenied(_) => self.denied += 1,
            _ => self.other += 1,
        }
    }
}

/// One scan's worth of process observations.
#[derive(Debug, Default, Clone)]
pub struct ProcSnapshot {
    pub processes: Vec<ProcessRecord>,
    pub failures: ScanFailures,
}

impl ProcSnapshot {
    pub fn collect() -> Result<Self, Error> {
        let mut failures = ScanFailures::default();
        let processes = snapshot_running(&mut failures)?;
        Ok(Self {
            processes,
            failures,
        })
    }
}

/// Enumerate running processes, resolving each executable path.
///
/// Resolution first follows the `exe` symlink; on failure it falls back to
/// the first `cmdline` token validated with `realpath`. Processes failing
/// both are omitted.
pub fn snapshot_running(failures: &mut ScanFailures) -> Result<Vec<ProcessRecord>, Error> {
    let own_pid = std::process::id() as libc::pid_t;
    let mut records = Vec::new();

    for process in procfs::process::all_processes()? {
        let process = match process {
            Ok(p) => p,
            Err(err) => {
                failures.record(&err);
                continue;
            }
        };
        let pid = process.pid;
        if pid == own_pid {
            continue;
        }

        let exe_path = match process.exe() {
            Ok(path) => path,
            Err(err) => match exe_from_cmdline(&process) {
                Some(path) => path,
                None => {
                    failures.record(&err);
                    continue;
                }
            },
        };
        let Some(exe_path) = sanitize_file(&exe_path) else {
            continue;
        };

        let ppid = match process.stat() {
            Ok(stat) => stat.ppid,
            Err(err) => {
                failures.record(&err);
                continue;
            }
        };

        records.push(ProcessRecord {
            pid,
            ppid,
            path: exe_path.to_path_buf(),
        });
    }

    trace!(num_processes = records.len(), "process snapshot collected");
    Ok(records)
}

fn exe_from_cmdline(process: &procfs::process::Process) -> Option<PathBuf> {
    let cmdline = process.cmdline().ok()?;
    let first = cmdline.first()?;
    let candidate = PathBuf::from(first);
    if !candidate.has_root() {
        return None;
    }
    std::fs::canonicalize(candidate).ok()
}

/// Read the file-backed mappings of a process.
///
/// Anonymous regions, `[heap]`, `[stack]`, `[vdso]` and other pseudo paths
/// are skipped. Regions whose address range is inverted are rejected.
pub fn read_maps(pid: libc::pid_t) -> Result<Vec<MapRegion>, Error> {
    let process = procfs::process::Process::new(pid)?;
    let maps = process.maps()?;

    let mut regions = Vec::new();
    for map in maps {
        let MMapPath::Path(path) = map.pathname else {
            continue;
        };
        let Some(path) = sanitize_file(&path) else {
            continue;
        };
        let (start, end) = map.address;
        let Some(length) = end.checked_sub(start) else {
            continue;
        };
        if length == 0 {
            continue;
        }
        regions.push(MapRegion {
            path: path.to_path_buf(),
            offset: map.offset,
            length,
        });
    }

    Ok(regions)
}

/// Read the `comm` name of a process, if it is still alive.
pub fn comm(pid: libc::pid_t) -> Option<String> {
    let process = procfs::process::Process::new(pid).ok()?;
    let stat = process.stat().ok()?;
    Some(stat.comm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_excludes_self_and_resolves_paths() {
        let mut failures = ScanFailures::default();
        let records = snapshot_running(&mut failures).unwrap();
        // Our own pid is excluded, but the snapshot should not be empty on
        // any live system.
        assert!(!records.is_empty());
        let own_pid = std::process::id() as libc::pid_t;
        assert!(records.iter().all(|r| r.pid != own_pid));
        assert!(records.iter().all(|r| r.path.has_root()));
    }

    #[test]
    fn read_maps_of_self_finds_file_regions() {
        let own_pid = std::process::id() as libc::pid_t;
        let regions = read_maps(own_pid).unwrap();
        assert!(!regions.is_empty());
        assert!(regions.iter().all(|r| r.length > 0 && r.path.has_root()));
    }

    #[test]
    fn comm_of_self_is_nonempty() {
        let own_pid = std::process::id() as libc::pid_t;
        let name = comm(own_pid).unwrap();
        assert!(!name.is_empty());
    }
}
