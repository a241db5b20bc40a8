mod inner;
mod prophet;
mod spy;

use crate::desktop::DesktopRegistry;
use crate::proc::ProcSnapshot;
use crate::statefile;
use crate::{Error, MemStat};
use config::Config;
use inner::StateInner;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time};
use tracing::{debug, enabled, info, warn, Level};

/// The daemon's global state: model graph, observer and predictor.
///
/// Owned by `main` and threaded through the tick loop and the signal
/// handlers explicitly; cheap to clone.
#[derive(Debug, Clone)]
pub struct State {
    inner: Arc<RwLock<StateInner>>,
}

impl State {
    /// Build a state with an empty model. The state file is neither read
    /// nor required to exist.
    pub fn try_new(config: Config, statefile: Option<PathBuf>) -> Result<Self, Error> {
        Ok(Self {
            inner: Arc::new(RwLock::new(StateInner::new(config, statefile)?)),
        })
    }

    /// Bring up a live state: load the persisted model, adopt already
    /// running processes, register manual apps and complete the markov mesh
    /// among priority exes.
    pub fn load(config: Config, statefile: Option<PathBuf>) -> Result<Self, Error> {
        let mut inner = StateInner::new(config, statefile)?;

        if let Some(path) = inner.statefile.clone() {
            let image = statefile::load(&path)?;
            inner.absorb_image(image);
        }
        inner.desktop = DesktopRegistry::scan_system();

        match ProcSnapshot::collect() {
            Ok(snapshot) => inner.sync_running(&snapshot)?,
            Err(err) => warn!(%err, "cannot scan processes at startup"),
        }
        inner.register_manual_apps()?;
        inner.build_priority_mesh()?;

        match MemStat::try_new() {
            Ok(memstat) => {
                inner.memstat = memstat;
                inner.memstat_timestamp = inner.time;
            }
            Err(err) => warn!(%err, "cannot read meminfo at startup"),
        }

        info!(
            exes = inner.exes.len(),
            maps = inner.maps.len(),
            time = inner.time,
            "state ready"
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    pub async fn dump_info(&self) {
        self.inner.read().await.dump_log();
    }

    pub async fn reload_config(&self, config: Config) -> Result<(), Error> {
        self.inner.write().await.apply_config(config)
    }

    pub async fn scan_and_predict(&self) -> Result<(), Error> {
        self.inner.write().await.scan_and_predict()
    }

    pub async fn update(&self) -> Result<(), Error> {
        self.inner.write().await.update()
    }

    /// Persist the model if dirty. Returns whether a save happened.
    pub async fn write(&self) -> Result<bool, Error> {
        self.inner.write().await.write()
    }

    /// Drive the tick loop forever: scan/predict, half a cycle of sleep,
    /// model update, the other half of sleep.
    pub async fn start(self) -> Result<(), Error> {
        let state = self.inner;
        loop {
            state.write().await.scan_and_predict()?;
            let cycle = state.read().await.config.model.cycle;
            time::sleep(cycle / 2).await;

            state.write().await.update()?;
            let cycle = state.read().await.config.model.cycle;
            time::sleep((cycle + Duration::from_secs(1)) / 2).await;
        }
    }
}

impl StateInner {
    /// Scan half of the tick: observe processes, then predict (unless the
    /// pause gate is closed). Advances the virtual clock by half a cycle.
    pub(crate) fn scan_and_predict(&mut self) -> Result<(), Error> {
        if self.config.system.doscan {
            match self.spy_scan() {
                Ok(()) => {
                    self.dirty = true;
                    self.model_dirty = true;
                }
                // transient: count it, keep the model unchanged
                Err(err) => warn!(%err, "process scan failed this cycle"),
            }
        }
        if enabled!(Level::DEBUG) {
            self.dump_log();
        }
        if self.config.system.dopredict {
            if self.pause.is_active() {
                debug!("preloading paused, skipping prediction");
            } else {
                self.prophet_predict()?;
            }
        }

        self.time += self.config.model.cycle.as_secs() / 2;
        Ok(())
    }

    /// Update half of the tick: fold the scan into the model. Advances the
    /// virtual clock by the other half of the cycle.
    pub(crate) fn update(&mut self) -> Result<(), Error> {
        if self.model_dirty {
            self.spy_update_model()?;
            self.model_dirty = false;
        }

        self.time += self.config.model.cycle.as_secs().div_ceil(2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::spy::tests::{map_reader, region, snapshot, DEAD_PPID};
    use super::*;
    use crate::exe::Pool;
    use crate::markov::MarkovState;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn test_state() -> StateInner {
        let mut config = Config::default();
        config.system.maxprocs = 2;
        config.preheat.bootwindow = Duration::ZERO;
        config.preheat.userapps = vec!["/usr/bin".into()];
        StateInner::new(config, None).unwrap()
    }

    /// Run one full tick against a canned snapshot.
    fn tick(
        state: &mut StateInner,
        processes: &[(libc::pid_t, libc::pid_t, &str)],
        maps: &HashMap<libc::pid_t, Vec<crate::proc::MapRegion>>,
    ) {
        let cycle = state.config.model.cycle.as_secs();
        state.spy_scan_with(&snapshot(processes));
        state.time += cycle / 2;
        let reader = map_reader(maps.clone());
        state.spy_update_model_with(&reader).unwrap();
        state.time += cycle.div_ceil(2);
    }

    #[test]
    fn markov_states_follow_observed_transitions() {
        let mut state = test_state();
        let maps = HashMap::from([
            (1, vec![region("/usr/bin/A", 0, 4_000_000)]),
            (2, vec![region("/usr/bin/B", 0, 4_000_000)]),
        ]);

        // A starts alone
        tick(&mut state, &[(1, DEAD_PPID, "/usr/bin/A")], &maps);
        // B joins
        tick(
            &mut state,
            &[(1, DEAD_PPID, "/usr/bin/A"), (2, DEAD_PPID, "/usr/bin/B")],
            &maps,
        );
        let a = state.exes[Path::new("/usr/bin/A")].clone();
        let b = state.exes[Path::new("/usr/bin/B")].clone();
        // the edge was created while registering B, so B is its `a` side
        let markov = b.markovs_a_side().pop().expect("edge exists");
        assert!(markov.is_a_side(&b.path()).unwrap());
        assert_eq!(markov.state(), MarkovState::BothRunning);

        // both keep running: both-running time accumulates
        tick(
            &mut state,
            &[(1, DEAD_PPID, "/usr/bin/A"), (2, DEAD_PPID, "/usr/bin/B")],
            &maps,
        );
        assert!(markov.time() > 0);
        assert!(markov.time() <= a.time().min(b.time()));

        // A exits; B (the edge's `a` side) keeps running
        tick(&mut state, &[(2, DEAD_PPID, "/usr/bin/B")], &maps);
        assert_eq!(markov.state(), MarkovState::ExeARunning);

        // everything exits
        tick(&mut state, &[], &maps);
        assert_eq!(markov.state(), MarkovState::NeitherRunning);

        // both observed transitions are recorded: Both → AOnly → Neither
        // (in edge orientation, B is the `a` endpoint)
        let (_, _, weight) = markov.sojourn_stats();
        assert_eq!(weight[3][1], 1);
        assert_eq!(weight[1][0], 1);
    }

    #[test]
    fn predictor_scores_correlated_idle_exe() {
        let mut state = test_state();
        let maps = HashMap::from([
            (1, vec![region("/usr/bin/A", 0, 4_000_000)]),
            (2, vec![region("/usr/bin/B", 0, 4_000_000)]),
        ]);

        // teach the model that A and B run together, several times
        for _ in 0..5 {
            tick(&mut state, &[(1, DEAD_PPID, "/usr/bin/A")], &maps);
            tick(
                &mut state,
                &[(1, DEAD_PPID, "/usr/bin/A"), (2, DEAD_PPID, "/usr/bin/B")],
                &maps,
            );
            tick(
                &mut state,
                &[(1, DEAD_PPID, "/usr/bin/A"), (2, DEAD_PPID, "/usr/bin/B")],
                &maps,
            );
            tick(&mut state, &[], &maps);
        }

        // now A is running alone; the model should consider B likely
        state.spy_scan_with(&snapshot(&[(1, DEAD_PPID, "/usr/bin/A")]));
        state.time += 10;
        let reader = map_reader(maps.clone());
        state.spy_update_model_with(&reader).unwrap();
        state.prophet_predict_scores_only().unwrap();

        let a = &state.exes[Path::new("/usr/bin/A")];
        let b = &state.exes[Path::new("/usr/bin/B")];
        assert_eq!(a.lnprob(), 0.0, "running exe receives no bid");
        assert!(b.lnprob() < 0.0, "idle correlated exe is scored");

        // and only B's map is a preload candidate
        let selected = state.select_maps(u64::MAX);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].path(), Path::new("/usr/bin/B"));
    }

    #[test]
    fn image_roundtrip_preserves_referential_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let statefile_path = dir.path().join("preheat.state");
        let mut state = test_state();
        state.statefile = Some(statefile_path.clone());

        let shared = region("/usr/lib/libshared.so", 0, 2_000_000);
        let maps = HashMap::from([
            (1, vec![region("/usr/bin/A", 0, 4_000_000), shared.clone()]),
            (2, vec![region("/usr/bin/B", 0, 4_000_000), shared.clone()]),
        ]);
        tick(
            &mut state,
            &[(1, DEAD_PPID, "/usr/bin/A"), (2, DEAD_PPID, "/usr/bin/B")],
            &maps,
        );
        tick(&mut state, &[], &maps);

        state.dirty = true;
        assert!(state.write().unwrap());

        let mut restored = test_state();
        restored.absorb_image(crate::statefile::load(&statefile_path).unwrap());

        assert_eq!(restored.exes.len(), state.exes.len());
        assert_eq!(restored.maps.len(), state.maps.len());
        assert_eq!(restored.time, state.time);

        // registry refcounts equal the number of referencing exemaps
        for map in &restored.maps {
            let refs: u32 = restored
                .exes
                .values()
                .map(|exe| {
                    exe.exemaps_snapshot()
                        .iter()
                        .filter(|em| em.map == *map)
                        .count() as u32
                })
                .sum();
            assert_eq!(map.refcount(), refs);
            assert!(refs > 0);
        }

        // every markov edge is recorded in exactly its two endpoints
        for exe in restored.exes.values() {
            for markov in exe.markovs_a_side() {
                assert!(markov.involves(&exe.path()).unwrap());
            }
        }
        let a = &restored.exes[Path::new("/usr/bin/A")];
        assert_eq!(a.markov_count(), 1);
        assert_eq!(a.pool(), Pool::Priority);
    }

    #[test]
    fn scan_and_predict_respects_pause() {
        let dir = tempfile::tempdir().unwrap();
        let pausefile = dir.path().join("pause");
        std::fs::write(&pausefile, "0\n").unwrap();

        let mut config = Config::default();
        config.system.maxprocs = 1;
        config.system.doscan = false;
        config.preheat.pausefile = pausefile;
        let mut state = StateInner::new(config, None).unwrap();

        // with the gate closed the predict phase is skipped entirely, so
        // even a poisoned meminfo path cannot be reached; the clock still
        // advances
        state.scan_and_predict().unwrap();
        assert_eq!(state.time, 10);
    }

    #[test]
    fn disabled_scan_keeps_model_clean() {
        let mut config = Config::default();
        config.system.maxprocs = 1;
        config.system.doscan = false;
        config.system.dopredict = false;
        let mut state = StateInner::new(config, None).unwrap();

        state.scan_and_predict().unwrap();
        state.update().unwrap();
        assert!(!state.dirty);
        assert!(state.exes.is_empty());
        assert_eq!(state.time, 20);
    }

    proptest! {
        /// Invariant: after arbitrary tick sequences every markov edge's
        /// state matches its endpoints' running flags.
        #[test]
        fn markov_state_is_consistent_after_ticks(
            steps in prop::collection::vec(prop::collection::vec(0u8..4, 0..3), 1..10)
        ) {
            let mut state = test_state();
            let universe = ["/usr/bin/a", "/usr/bin/b", "/usr/bin/c", "/usr/bin/d"];
            let mut maps = HashMap::new();
            for (i, path) in universe.iter().enumerate() {
                maps.insert(i as libc::pid_t + 1, vec![region(path, 0, 4_000_000)]);
            }

            for alive in steps {
                let processes: Vec<(libc::pid_t, libc::pid_t, &str)> = alive
                    .iter()
                    .map(|i| ((*i as libc::pid_t) + 1, DEAD_PPID, universe[*i as usize]))
                    .collect();
                tick(&mut state, &processes, &maps);

                for exe in state.exes.values() {
                    for markov in exe.markovs_a_side() {
                        let expected = {
                            let a_running = exe.is_running();
                            // resolve the peer through the edge itself
                            let peer = state
                                .exes
                                .values()
                                .find(|other| {
                                    other.path() != exe.path()
                                        && markov.involves(&other.path()).unwrap()
                                })
                                .expect("peer exists");
                            MarkovState::from_running(a_running, peer.is_running())
                        };
                        prop_assert_eq!(markov.state(), expected);
                    }
                }
            }
        }
    }
}
