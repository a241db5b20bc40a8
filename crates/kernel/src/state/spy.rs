//! The observer half: diff the running set against the model, drive
//! start/exit events, and fold newly discovered exes into the graph.

use super::inner::{QueuedExe, StateInner};
use crate::exe::{Pool, ProcInfo};
use crate::proc::{self, MapRegion, ProcSnapshot};
use crate::utils::accept_file;
use crate::{Error, Exe, ExeMap};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Parent process names that mark a launch as user-initiated. Process names
/// from `/proc/<pid>/comm` are truncated to 15 bytes, so comparisons are too.
const USER_INITIATORS: &[&str] = &[
    "bash",
    "zsh",
    "fish",
    "sh",
    "dash",
    "ksh",
    "tcsh",
    "nu",
    "tmux",
    "tmux: server",
    "screen",
    "gnome-shell",
    "plasmashell",
    "ksmserver",
    "sway",
    "Hyprland",
    "i3",
    "xfce4-panel",
    "lxpanel",
    "gnome-terminal-server",
    "konsole",
    "xterm",
    "alacritty",
    "kitty",
    "foot",
    "wezterm",
    "terminator",
    "tilix",
    "urxvt",
];

fn is_launcher(name: &str) -> bool {
    USER_INITIATORS.iter().any(|known| {
        *known == name || (known.len() > 15 && &known[..15] == name)
    })
}

/// Source of `/proc/<pid>/maps` content; injectable for tests. `None` means
/// the process vanished or denied access.
pub(crate) type MapReader<'a> = &'a dyn Fn(libc::pid_t) -> Option<Vec<MapRegion>>;

pub(crate) fn default_map_reader(pid: libc::pid_t) -> Option<Vec<MapRegion>> {
    proc::read_maps(pid).ok()
}

impl StateInner {
    /// Scan half: apply one process snapshot to the running set.
    pub(crate) fn spy_scan(&mut self) -> Result<(), Error> {
        let snapshot = ProcSnapshot::collect()?;
        self.spy_scan_with(&snapshot);
        Ok(())
    }

    pub(crate) fn spy_scan_with(&mut self, snapshot: &ProcSnapshot) {
        self.new_running_exes.clear();
        self.state_changed_exes.clear();
        self.new_exes.clear();

        if snapshot.failures.total() > 0 {
            debug!(failures = ?snapshot.failures, "proc scan failures this cycle");
        }

        let by_pid: FxHashMap<libc::pid_t, &Path> = snapshot
            .processes
            .iter()
            .map(|r| (r.pid, r.path.as_path()))
            .collect();
        let mut pids_by_path: FxHashMap<&Path, FxHashSet<libc::pid_t>> = FxHashMap::default();
        for record in &snapshot.processes {
            pids_by_path
                .entry(record.path.as_path())
                .or_default()
                .insert(record.pid);
        }

        for record in &snapshot.processes {
            if let Some(exe) = self.exes.get(&record.path).cloned() {
                let was_running = exe.is_running();
                if exe.has_pid(record.pid) {
                    exe.accrue_weight(record.pid, self.time);
                } else {
                    let user_initiated = self.is_user_initiated(record, &by_pid);
                    exe.track_start(ProcInfo {
                        pid: record.pid,
                        ppid: record.ppid,
                        start_time: self.time,
                        last_weight_update: self.time,
                        user_initiated,
                    });
                }
                exe.update_running_timestamp(self.time);
                if !was_running {
                    // fresh start of a known exe
                    self.new_running_exes.push_back(exe.clone());
                    self.state_changed_exes.push_back(exe);
                }
            } else if !self.bad_exes.contains_key(&record.path)
                && accept_file(&record.path, &self.config.system.exeprefix)
            {
                let user_initiated = self.is_user_initiated(record, &by_pid);
                self.new_exes.insert(
                    record.path.clone(),
                    QueuedExe {
                        pid: record.pid,
                        ppid: record.ppid,
                        user_initiated,
                    },
                );
            }
        }

        self.last_running_timestamp = self.time;

        // figure out who's not running anymore; pids that exec'd into a
        // different binary count as exited for their old exe
        let previously_running = std::mem::take(&mut self.running_exes);
        trace!(
            num_running_exes = previously_running.len(),
            "running exes before scan"
        );
        let empty = FxHashSet::default();
        for exe in previously_running {
            let alive = pids_by_path
                .get(exe.path().as_path())
                .unwrap_or(&empty);
            let stopped = exe.prune_exited(alive, self.time);
            if exe.is_running() {
                self.new_running_exes.push_back(exe);
            } else if stopped {
                self.state_changed_exes.push_back(exe);
            }
        }

        trace!(num_new_running_exes = self.new_running_exes.len());
        self.running_exes = std::mem::take(&mut self.new_running_exes);
    }

    fn is_user_initiated(
        &self,
        record: &proc::ProcessRecord,
        by_pid: &FxHashMap<libc::pid_t, &Path>,
    ) -> bool {
        if self.desktop.has_entry(&record.path) {
            return true;
        }
        let parent_name = by_pid
            .get(&record.ppid)
            .and_then(|path| path.file_name())
            .and_then(|name| name.to_str())
            .map(str::to_owned)
            .or_else(|| proc::comm(record.ppid));
        parent_name.is_some_and(|name| is_launcher(&name))
    }

    /// Update half: register queued exes, refresh relaunched ones, settle
    /// markov transitions, and do the time accounting.
    pub(crate) fn spy_update_model(&mut self) -> Result<(), Error> {
        self.spy_update_model_with(&default_map_reader)
    }

    pub(crate) fn spy_update_model_with(&mut self, read_maps: MapReader<'_>) -> Result<(), Error> {
        // register newly discovered exes
        let new_exes = std::mem::take(&mut self.new_exes);
        for (path, queued) in new_exes {
            self.new_exe_callback(path, queued, read_maps)?;
        }

        // adjust state for exes that changed state; relaunches get their
        // maps re-read so exemap probabilities track observed frequency
        let state_changed_exes = std::mem::take(&mut self.state_changed_exes);
        trace!(num = state_changed_exes.len(), "exes that changed state");
        for exe in &state_changed_exes {
            if exe.is_running() {
                if let Some(regions) = exe.any_running_pid().and_then(read_maps) {
                    self.refresh_exemaps(exe, regions);
                }
            }
            exe.set_change_timestamp(self.time);
            exe.markov_state_changed(self.time)?;
        }

        // accounting
        let period = self.time - self.last_accounting_timestamp;
        if period > 0 {
            for exe in self.exes.values() {
                if exe.is_running() {
                    exe.increase_time(period);
                }
            }
            for exe in self.exes.values() {
                exe.increase_markov_time(period)?;
            }
        }
        self.last_accounting_timestamp = self.time;
        Ok(())
    }

    fn new_exe_callback(
        &mut self,
        path: PathBuf,
        queued: QueuedExe,
        read_maps: MapReader<'_>,
    ) -> Result<(), Error> {
        let regions: Vec<MapRegion> = read_maps(queued.pid)
            .unwrap_or_default()
            .into_iter()
            .filter(|r| accept_file(&r.path, &self.config.system.mapprefix))
            .collect();
        let size: u64 = regions.iter().map(|r| r.length).sum();
        let manual = self.manual_apps.contains(&path);
        trace!(?path, size, "gathered new exe");

        if regions.is_empty() && !manual {
            // permission denied or the process died before the update half
            self.bad_exes.insert(path, self.time);
            return Ok(());
        }
        if size < self.config.model.minsize && !manual {
            trace!(?path, size, "exe is too small to be considered");
            self.bad_exes.insert(path, self.time);
            return Ok(());
        }

        let exe = Exe::new(&path).with_change_timestamp(self.time);
        exe.set_pool(self.classify_pool(&path));
        if manual {
            exe.set_manual(true);
            exe.set_pool(Pool::Priority);
        }
        exe.track_start(ProcInfo {
            pid: queued.pid,
            ppid: queued.ppid,
            start_time: self.time,
            last_weight_update: self.time,
            user_initiated: queued.user_initiated,
        });
        exe.update_running_timestamp(self.time);

        if regions.is_empty() {
            // manual app whose maps cannot be read: preload at least the
            // binary itself
            self.synthesize_whole_file_exemap(&exe);
        } else {
            let mut exemaps = HashSet::new();
            for region in regions {
                let map = self.lookup_or_new_map(&region);
                self.ref_map(&map);
                exemaps.insert(ExeMap::new(map));
            }
            exe.replace_exemaps(exemaps);
        }

        self.register_exe(exe.clone(), true)?;
        self.running_exes.push_front(exe);
        Ok(())
    }

    /// Attach a single exemap covering the whole binary.
    pub(crate) fn synthesize_whole_file_exemap(&mut self, exe: &Exe) {
        let path = exe.path();
        let length = match path.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot stat manual app");
                return;
            }
        };
        let region = MapRegion {
            path,
            offset: 0,
            length,
        };
        let map = self.lookup_or_new_map(&region);
        self.attach_map(exe, map);
    }

    /// Fold a fresh map listing into an exe's exemaps as one more launch
    /// observation.
    fn refresh_exemaps(&mut self, exe: &Exe, regions: Vec<MapRegion>) {
        let runs = exe.raw_launches().max(1);
        let regions: Vec<MapRegion> = regions
            .into_iter()
            .filter(|r| accept_file(&r.path, &self.config.system.mapprefix))
            .collect();
        let present: HashSet<(PathBuf, u64, u64)> = regions
            .iter()
            .map(|r| (r.path.clone(), r.offset, r.length))
            .collect();

        let mut exemaps = HashSet::new();
        let mut covered = HashSet::new();
        for exemap in exe.exemaps_snapshot() {
            let key = (
                exemap.map.path().to_path_buf(),
                exemap.map.offset(),
                exemap.map.length(),
            );
            let seen = present.contains(&key);
            covered.insert(key);
            exemaps.insert(exemap.observe(seen, runs));
        }
        for region in regions {
            if covered.contains(&(region.path.clone(), region.offset, region.length)) {
                continue;
            }
            let map = self.lookup_or_new_map(&region);
            self.ref_map(&map);
            exemaps.insert(ExeMap::new(map).with_prob(1.0 / runs as f64));
        }
        exe.replace_exemaps(exemaps);
    }

    /// Adopt already-running processes right after a state load, without
    /// counting them as launches, and settle all markov states.
    pub(crate) fn sync_running(&mut self, snapshot: &ProcSnapshot) -> Result<(), Error> {
        let by_pid: FxHashMap<libc::pid_t, &Path> = snapshot
            .processes
            .iter()
            .map(|r| (r.pid, r.path.as_path()))
            .collect();

        for record in &snapshot.processes {
            let Some(exe) = self.exes.get(&record.path).cloned() else {
                continue;
            };
            let user_initiated = self.is_user_initiated(record, &by_pid);
            exe.adopt_pid(ProcInfo {
                pid: record.pid,
                ppid: record.ppid,
                start_time: self.time,
                last_weight_update: self.time,
                user_initiated,
            });
            exe.update_running_timestamp(self.time);
        }
        self.last_running_timestamp = self.time;

        self.running_exes = self
            .exes
            .values()
            .filter(|exe| exe.is_running())
            .cloned()
            .collect();

        for exe in self.exes.values() {
            for markov in exe.markovs_a_side() {
                markov.set_state_from_exes()?;
            }
        }
        Ok(())
    }
}
