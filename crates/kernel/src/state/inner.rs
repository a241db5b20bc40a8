use crate::desktop::DesktopRegistry;
use crate::exe::Pool;
use crate::family::Family;
use crate::pattern::PatternSet;
use crate::pause::PauseGate;
use crate::proc::MapRegion;
use crate::session::SessionBoost;
use crate::statefile::{self, StateImage};
use crate::{Error, Exe, ExeMap, Map, MemStat};
use config::Config;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// A new exe queued during the scan half, registered during the update half.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedExe {
    pub pid: libc::pid_t,
    pub ppid: libc::pid_t,
    pub user_initiated: bool,
}

#[derive(Debug)]
pub(crate) struct StateInner {
    /// Configuration is created by the user and (probably) loaded from a file.
    pub(crate) config: Config,

    /// Anything changed since the last successful save?
    pub(crate) dirty: bool,

    /// Scan data waiting to be folded into the model by the update half.
    pub(crate) model_dirty: bool,

    /// The virtual clock: monotonic seconds accumulated across the daemon's
    /// lifetime, advanced by cycle/2 per half-tick. All model math uses this
    /// clock, never wall time.
    pub(crate) time: u64,

    pub(crate) last_running_timestamp: u64,

    pub(crate) last_accounting_timestamp: u64,

    pub(crate) map_seq: u64,

    pub(crate) exe_seq: u64,

    pub(crate) maps: rustc_hash::FxHashSet<Map>,

    pub(crate) exes: FxHashMap<PathBuf, Exe>,

    /// Exes whose maps were too small to track, with the model time of the
    /// verdict. Rechecked every boot and cleared after every save.
    pub(crate) bad_exes: FxHashMap<PathBuf, u64>,

    pub(crate) families: FxHashMap<String, Family>,

    pub(crate) running_exes: VecDeque<Exe>,

    pub(crate) new_running_exes: VecDeque<Exe>,

    pub(crate) state_changed_exes: VecDeque<Exe>,

    pub(crate) new_exes: FxHashMap<PathBuf, QueuedExe>,

    pub(crate) exclude: PatternSet,

    pub(crate) manual_apps: Vec<PathBuf>,

    pub(crate) desktop: DesktopRegistry,

    pub(crate) pause: PauseGate,

    pub(crate) session: SessionBoost,

    pub(crate) memstat: MemStat,

    pub(crate) memstat_timestamp: u64,

    pub(crate) readahead_pool: rayon::ThreadPool,

    pub(crate) statefile: Option<PathBuf>,
}

impl StateInner {
    pub fn new(config: Config, statefile: Option<PathBuf>) -> Result<Self, Error> {
        let exclude = PatternSet::compile(&config.preheat.exclude).unwrap_or_else(|err| {
            warn!(%err, "ignoring exclude patterns");
            PatternSet::default()
        });
        let readahead_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.system.maxprocs)
            .thread_name(|i| format!("readahead-{i}"))
            .build()
            .map_err(|err| Error::FileIOFailed(std::io::Error::other(err)))?;
        let session = SessionBoost::new(config.preheat.bootwindow, config.preheat.boostapps);
        let pause = PauseGate::new(config.preheat.pausefile.clone());

        Ok(Self {
            config,
            dirty: false,
            model_dirty: false,
            time: 0,
            last_running_timestamp: 0,
            last_accounting_timestamp: 0,
            map_seq: 0,
            exe_seq: 0,
            maps: Default::default(),
            exes: Default::default(),
            bad_exes: Default::default(),
            families: Default::default(),
            running_exes: Default::default(),
            new_running_exes: Default::default(),
            state_changed_exes: Default::default(),
            new_exes: Default::default(),
            exclude,
            manual_apps: Vec::new(),
            desktop: DesktopRegistry::default(),
            pause,
            session,
            memstat: MemStat::default(),
            memstat_timestamp: 0,
            readahead_pool,
            statefile,
        })
    }

    /// Fetch the registry map for a region, or mint a new one.
    pub(crate) fn lookup_or_new_map(&self, region: &MapRegion) -> Map {
        let probe = Map::new(&region.path, region.offset, region.length, self.time);
        match self.maps.get(&probe) {
            Some(existing) => existing.clone(),
            None => probe,
        }
    }

    /// Take an exemap reference on a map, registering it on the first one.
    pub(crate) fn ref_map(&mut self, map: &Map) {
        if map.inc_ref() == 1 {
            self.map_seq += 1;
            map.set_seq(self.map_seq);
            self.maps.insert(map.clone());
        }
    }

    /// Attach a map to an exe through a fresh exemap, maintaining the
    /// registry refcount.
    pub(crate) fn attach_map(&mut self, exe: &Exe, map: Map) {
        self.ref_map(&map);
        exe.add_exemap(ExeMap::new(map));
    }

    /// Register an exe, assigning its sequence number and, for priority-pool
    /// exes, creating markov edges to every existing priority-pool peer.
    pub(crate) fn register_exe(&mut self, exe: Exe, create_markovs: bool) -> Result<(), Error> {
        self.exe_seq += 1;
        exe.set_seq(self.exe_seq);
        trace!(path = ?exe.path(), seq = self.exe_seq, pool = ?exe.pool(), "registering exe");

        if create_markovs && exe.pool() == Pool::Priority {
            for other in self.exes.values().filter(|o| o.pool() == Pool::Priority) {
                exe.build_markov_chain_with(other, self.time)?;
            }
        }
        self.exes.insert(exe.path(), exe);
        Ok(())
    }

    /// Ensure every priority-pool exe has a markov edge to every other
    /// priority-pool exe. Invoked after any bulk seeding: state load, manual
    /// app registration, config reload.
    pub(crate) fn build_priority_mesh(&mut self) -> Result<(), Error> {
        let priority: Vec<Exe> = self
            .exes
            .values()
            .filter(|e| e.pool() == Pool::Priority)
            .cloned()
            .collect();

        let mut created = 0u32;
        for (i, a) in priority.iter().enumerate() {
            for b in priority.iter().skip(i + 1) {
                if !a.has_markov_with(b) {
                    a.build_markov_chain_with(b, self.time)?;
                    created += 1;
                }
            }
        }
        if created > 0 {
            debug!(created, "priority mesh completed");
        }
        Ok(())
    }

    /// Classify a path into its pool.
    pub(crate) fn classify_pool(&self, path: &Path) -> Pool {
        if self.exclude.matches_any(path) {
            return Pool::Observation;
        }
        if crate::pattern::under_any(path, &self.config.preheat.userapps)
            || self.desktop.has_entry(path)
            || self.manual_apps.iter().any(|p| p == path)
        {
            return Pool::Priority;
        }
        Pool::Observation
    }

    /// (Re)load the manual-app list and register entries that were never
    /// observed running, so they can be preloaded anyway.
    pub(crate) fn register_manual_apps(&mut self) -> Result<(), Error> {
        let Some(list_path) = self.config.system.manualapps.clone() else {
            self.manual_apps.clear();
            return Ok(());
        };
        let content = match std::fs::read_to_string(&list_path) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %list_path.display(), %err, "cannot read manual app list");
                return Ok(());
            }
        };

        self.manual_apps = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(PathBuf::from)
            .collect();

        let mut registered = 0u32;
        for path in self.manual_apps.clone() {
            if let Some(exe) = self.exes.get(&path) {
                exe.set_manual(true);
                exe.set_pool(Pool::Priority);
                continue;
            }
            let exe = Exe::new(&path).with_change_timestamp(self.time);
            exe.set_manual(true);
            exe.set_pool(Pool::Priority);
            self.register_exe(exe.clone(), false)?;
            // no maps until the app runs for the first time; warm at least
            // the binary itself
            self.synthesize_whole_file_exemap(&exe);
            registered += 1;
        }
        if registered > 0 {
            debug!(registered, "manual apps registered");
            self.dirty = true;
        }
        self.build_priority_mesh()
    }

    /// Fold a loaded state image into this (empty) state.
    pub(crate) fn absorb_image(&mut self, image: StateImage) {
        self.time = image.time;
        self.last_accounting_timestamp = image.time;
        self.last_running_timestamp = image.time;
        self.map_seq = image.map_seq;
        self.exe_seq = image.exe_seq;
        self.maps = image.maps;
        self.exes = image.exes;
        self.bad_exes = image.bad_exes;
        self.families = image.families;
    }

    /// Snapshot the persistent slice of the model for the writer.
    pub(crate) fn image(&self) -> StateImage {
        StateImage {
            time: self.time,
            map_seq: self.map_seq,
            exe_seq: self.exe_seq,
            maps: self.maps.clone(),
            exes: self.exes.clone(),
            bad_exes: self.bad_exes.clone(),
            families: self.families.clone(),
        }
    }

    /// Persist if dirty. Returns whether a save actually happened. A failed
    /// save keeps the dirty flag so the next autosave retries.
    pub(crate) fn write(&mut self) -> Result<bool, Error> {
        let Some(statefile) = self.statefile.clone() else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }

        statefile::save(&self.image(), &statefile)?;
        self.dirty = false;

        // clean up bad exes once in a while: small binaries get another
        // chance after every save
        self.bad_exes.clear();
        Ok(true)
    }

    /// Swap in a freshly loaded configuration and rebuild everything
    /// derived from it.
    pub(crate) fn apply_config(&mut self, config: Config) -> Result<(), Error> {
        self.config = config;
        self.exclude = PatternSet::compile(&self.config.preheat.exclude).unwrap_or_else(|err| {
            warn!(%err, "ignoring exclude patterns");
            PatternSet::default()
        });
        self.readahead_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.system.maxprocs)
            .thread_name(|i| format!("readahead-{i}"))
            .build()
            .map_err(|err| Error::FileIOFailed(std::io::Error::other(err)))?;
        self.register_manual_apps()?;
        debug!(?self.config, "loaded new config");
        Ok(())
    }

    pub(crate) fn dump_log(&self) {
        debug!(
            time = self.time,
            exe_seq = self.exe_seq,
            map_seq = self.map_seq,
            num_exes = self.exes.len(),
            num_bad_exes = self.bad_exes.len(),
            num_maps = self.maps.len(),
            num_running_exes = self.running_exes.len(),
            "state dump",
        )
    }
}
