#![allow(clippy::mutable_key_type)]

use crate::{ExeMap, Markov};
use educe::Educe;
use rustc_hash::FxHashMap;
use std::{collections::HashSet, path::PathBuf};

/// Which pool an exe belongs to. Only priority-pool exes participate in
/// markov edges and correlation-driven prediction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    #[default]
    Observation,
    Priority,
}

impl Pool {
    pub const fn as_u8(self) -> u8 {
        match self {
            Pool::Observation => 0,
            Pool::Priority => 1,
        }
    }
}

impl From<u8> for Pool {
    fn from(value: u8) -> Self {
        // unknown pool values from old state files degrade to observation
        match value {
            1 => Pool::Priority,
            _ => Pool::Observation,
        }
    }
}

/// Per-pid bookkeeping for a running instance of an exe.
#[derive(Debug, Clone, Copy)]
pub struct ProcInfo {
    pub pid: libc::pid_t,
    pub ppid: libc::pid_t,
    /// Model time the pid was first observed.
    pub start_time: u64,
    /// Model time weighted launches were last accrued for this pid.
    pub last_weight_update: u64,
    pub user_initiated: bool,
}

/// Launch weight of a run of `duration_sec` seconds.
///
/// Long-running, user-initiated processes dominate; sub-five-second blips
/// and background children are discounted.
pub fn launch_weight(duration_sec: f64, user_initiated: bool) -> f64 {
    let base = (1.0 + duration_sec / 60.0).ln();
    let initiated = if user_initiated { 1.0 } else { 0.3 };
    let short_lived = if duration_sec < 5.0 { 0.3 } else { 1.0 };
    base * initiated * short_lived
}

#[derive(Default, Educe)]
#[educe(Debug)]
pub struct ExeInner {
    pub path: PathBuf,

    pub seq: Option<u64>,

    pub pool: Pool,

    /// Registered through the manual-app list; preloaded unconditionally.
    pub manual: bool,

    #[educe(Debug(ignore))]
    pub exemaps: HashSet<ExeMap>,

    /// Sum of map lengths across all exemaps.
    pub size: u64,

    /// Total seconds this exe has ever been observed running (model clock).
    pub time: u64,

    pub update_time: Option<u64>,

    pub running_timestamp: Option<u64>,

    pub change_timestamp: u64,

    pub lnprob: f32,

    #[educe(Debug(ignore))]
    pub markovs: Vec<Markov>,

    pub running_pids: FxHashMap<libc::pid_t, ProcInfo>,

    pub weighted_launches: f64,

    pub raw_launches: u64,

    pub total_duration_sec: u64,
}

impl ExeInner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_change_timestamp(&mut self, change_timestamp: u64) -> &mut Self {
        self.change_timestamp = change_timestamp;
        self
    }

    pub fn with_exemaps(&mut self, exemaps: HashSet<ExeMap>) -> &mut Self {
        self.exemaps = exemaps;
        self.size = self
            .exemaps
            .iter()
            .map(|m| m.map.length())
            .fold(0, |acc, x| acc.wrapping_add(x));
        self
    }

    pub fn is_running(&self) -> bool {
        !self.running_pids.is_empty()
    }

    /// Start tracking a pid. Counts as one raw launch.
    pub fn track_start(&mut self, info: ProcInfo) {
        if self.running_pids.insert(info.pid, info).is_none() {
            self.raw_launches += 1;
        }
    }

    /// Start tracking a pid that was already running when the daemon came
    /// up. Does not count as a launch.
    pub fn adopt_pid(&mut self, info: ProcInfo) {
        self.running_pids.entry(info.pid).or_insert(info);
    }

    /// Accrue weighted launches for a still-running pid.
    ///
    /// The increment is the delta of the weight function evaluated at
    /// cumulative duration, so over a whole run the accruals sum to exactly
    /// `launch_weight(total_duration, ui)`.
    pub fn accrue_weight(&mut self, pid: libc::pid_t, now: u64) {
        let Some(info) = self.running_pids.get_mut(&pid) else {
            return;
        };
        if now <= info.last_weight_update {
            return;
        }
        let prev = info.last_weight_update.saturating_sub(info.start_time) as f64;
        let current = now.saturating_sub(info.start_time) as f64;
        self.weighted_launches +=
            launch_weight(current, info.user_initiated) - launch_weight(prev, info.user_initiated);
        info.last_weight_update = now;
    }

    /// Drop pids that are no longer observed. Returns true if the exe just
    /// transitioned to not-running.
    pub fn prune_exited(&mut self, alive: &rustc_hash::FxHashSet<libc::pid_t>, now: u64) -> bool {
        let was_running = self.is_running();
        let exited: Vec<_> = self
            .running_pids
            .keys()
            .copied()
            .filter(|pid| !alive.contains(pid))
            .collect();
        for pid in exited {
            if let Some(info) = self.running_pids.remove(&pid) {
                self.total_duration_sec += now.saturating_sub(info.start_time);
            }
        }
        was_running && !self.is_running()
    }
}
