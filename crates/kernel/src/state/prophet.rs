//! The predictor half: score running probabilities, pick the map set worth
//! warming under the memory budget, and hand it to the kernel.

use super::inner::StateInner;
use crate::exe::Pool;
use crate::utils::{kb, readahead};
use crate::{Error, Map, MemStat};
use config::SortStrategy;
use humansize::{format_size_i, DECIMAL};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tracing::{debug, trace, warn};

/// lnprob of an exe that is considered certain to run: manual apps and
/// session-boosted apps. Any markov bid is dwarfed by it.
const CERTAIN_LNPROB: f32 = -1.0e9;

impl StateInner {
    /// Predict phase. The pause gate has already been consulted by the
    /// caller.
    pub(crate) fn prophet_predict(&mut self) -> Result<(), Error> {
        self.prophet_predict_scores_only()?;
        self.prophet_readahead()
    }

    /// The scoring part of the predict phase, separated from the I/O so it
    /// can be exercised on its own.
    pub(crate) fn prophet_predict_scores_only(&mut self) -> Result<(), Error> {
        // reset the probabilities we are about to compute
        for exe in self.exes.values() {
            exe.zero_lnprob();
        }
        for map in &self.maps {
            map.zero_lnprob();
        }

        let cycle = self.config.model.cycle.as_secs_f32();
        let use_correlation = self.config.model.usecorrelation;
        for exe in self.exes.values() {
            exe.markov_bid_in_exes(use_correlation, self.time, cycle)?;
        }
        trace!("markov edges are done bidding in exes");

        // manual apps are certain; session boost promotes the most-used
        // priority apps to the same rank during the boot window
        for exe in self.exes.values() {
            if exe.is_manual() && !exe.is_running() {
                exe.force_lnprob(CERTAIN_LNPROB);
            }
        }
        if self.session.in_boot_window() {
            debug!(
                remaining = self.session.remaining().as_secs(),
                "session boot window active"
            );
            let mut idle_priority: Vec<_> = self
                .exes
                .values()
                .filter(|e| e.pool() == Pool::Priority && !e.is_running())
                .collect();
            idle_priority.sort_by(|a, b| {
                b.weighted_launches()
                    .partial_cmp(&a.weighted_launches())
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.seq().cmp(&b.seq()))
            });
            for exe in idle_priority.into_iter().take(self.session.top_apps()) {
                exe.force_lnprob(CERTAIN_LNPROB);
            }
        }

        // maps: running exes poison theirs so nothing already warm is
        // re-read; idle priority exes bid theirs in
        for exe in self.exes.values() {
            if exe.is_running() {
                exe.poison_maps();
            }
        }
        for exe in self.exes.values() {
            if !exe.is_running() && exe.pool() == Pool::Priority {
                exe.bid_in_maps();
            }
        }
        Ok(())
    }

    fn prophet_readahead(&mut self) -> Result<(), Error> {
        self.memstat = MemStat::try_new()?;
        self.memstat_timestamp = self.time;

        let budget = Self::readahead_budget(&self.config.model, &self.memstat);
        if budget == 0 {
            debug!("no memory budget, skipping preload");
            return Ok(());
        }

        let selected = self.select_maps(budget);
        if selected.is_empty() {
            debug!("nothing to readahead");
            return Ok(());
        }

        let selected_bytes: u64 = selected.iter().map(|m| m.length()).sum();
        trace!(
            "{} available for preloading, using {} of it",
            format_size_i(budget as f64, DECIMAL),
            format_size_i(selected_bytes as f64, DECIMAL),
        );

        let num_selected = selected.len();
        let num_done = self.dispatch_readahead(selected);
        debug!(
            num_done,
            num_selected,
            num_maps = self.maps.len(),
            "readahead issued"
        );
        Ok(())
    }

    /// Byte budget for this cycle:
    /// `max(0, memtotal% · total + memfree% · free + memcached% · cached)`.
    pub(crate) fn readahead_budget(model: &config::Model, mem: &MemStat) -> u64 {
        let pct = |p: i32, v: u64| i64::from(p.clamp(-100, 100)) * (v / 100) as i64;
        let budget = pct(model.memtotal, mem.total)
            + pct(model.memfree, mem.free)
            + pct(model.memcached, mem.cached);
        budget.max(0) as u64
    }

    /// Greedily pick the best maps under the byte budget.
    ///
    /// Candidates are maps with a negative lnprob, i.e. maps some idle
    /// priority exe bid for and no running exe owns. Higher score per byte
    /// wins; ties break on the stable map sequence number.
    pub(crate) fn select_maps(&self, budget: u64) -> Vec<Map> {
        let mut candidates: Vec<(f64, Map)> = self
            .maps
            .iter()
            .filter(|map| map.lnprob() < 0.0)
            .map(|map| {
                let score = -f64::from(map.lnprob());
                let ratio = score / map.length().max(1) as f64;
                (ratio, map.clone())
            })
            .collect();

        candidates.sort_by(|(ratio_a, map_a), (ratio_b, map_b)| {
            ratio_b
                .partial_cmp(ratio_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| map_a.seq().cmp(&map_b.seq()))
        });

        let mut remaining = budget;
        let mut selected = Vec::new();
        for (_, map) in candidates {
            let length = map.length();
            if length > remaining {
                continue;
            }
            remaining -= length;
            selected.push(map);
        }
        selected
    }

    /// Order the maps for efficient I/O and issue readahead through the
    /// worker pool. Per-file failures are ignored. Returns the number of
    /// maps successfully hinted.
    pub(crate) fn dispatch_readahead(&self, mut maps: Vec<Map>) -> u64 {
        let strategy = self.config.system.sortstrategy;
        match strategy {
            SortStrategy::None => {}
            SortStrategy::Path => {
                maps.sort_by(|a, b| a.path().cmp(b.path()).then(a.offset().cmp(&b.offset())));
            }
            SortStrategy::Block | SortStrategy::BlockThenPath => {
                // populate missing hints, best effort; failures leave the
                // sentinel so they are not retried
                for map in maps.iter().filter(|m| m.block().is_none()) {
                    if let Err(err) = map.set_block() {
                        trace!(?err, path = ?map.path(), "failed to probe block");
                    }
                }
                let all_hinted = maps.iter().all(|m| m.block().is_some_and(|b| b > 0));
                if strategy == SortStrategy::Block || all_hinted {
                    maps.sort_by_key(|m| (m.block().unwrap_or(0), m.offset()));
                } else {
                    maps.sort_by(|a, b| a.path().cmp(b.path()).then(a.offset().cmp(&b.offset())));
                }
            }
        }

        let num_done = AtomicU64::new(0);
        self.readahead_pool.install(|| {
            maps.par_iter().for_each(|map| {
                match readahead(map.path(), map.offset() as i64, map.length() as i64) {
                    Ok(()) => {
                        num_done.fetch_add(1, AtomicOrdering::Relaxed);
                        trace!(path = ?map.path(), kb = kb(map.length()), "readahead done");
                    }
                    Err(error) => {
                        warn!(path = ?map.path(), %error, "failed to readahead");
                    }
                }
            });
        });
        num_done.load(AtomicOrdering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exe::{Exe, ProcInfo};
    use crate::proc::MapRegion;
    use crate::state::inner::StateInner;
    use config::Config;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn test_state() -> StateInner {
        let mut config = Config::default();
        config.system.maxprocs = 2;
        config.preheat.bootwindow = std::time::Duration::ZERO;
        StateInner::new(config, None).unwrap()
    }

    fn add_exe(state: &mut StateInner, path: &str, pool: Pool, maps: &[(&str, u64, u64)]) -> Exe {
        let exe = Exe::new(path);
        exe.set_pool(pool);
        for (map_path, offset, length) in maps {
            let map = state.lookup_or_new_map(&MapRegion {
                path: PathBuf::from(map_path),
                offset: *offset,
                length: *length,
            });
            state.attach_map(&exe, map);
        }
        state.register_exe(exe.clone(), false).unwrap();
        exe
    }

    fn run(exe: &Exe, pid: libc::pid_t) {
        exe.track_start(ProcInfo {
            pid,
            ppid: 1,
            start_time: 0,
            last_weight_update: 0,
            user_initiated: false,
        });
    }

    #[test]
    fn budget_formula_matches_contract() {
        let model = config::Model::default(); // memtotal -10, memfree 50
        let mem = MemStat {
            total: 8_000_000,
            free: 2_000_000,
            cached: 1_000_000,
            buffers: 0,
        };
        // -10% of total + 50% of free + 0% of cached
        let expected = (-800_000i64 + 1_000_000) as u64;
        assert_eq!(StateInner::readahead_budget(&model, &mem), expected);
    }

    #[test]
    fn budget_is_zero_when_memory_is_tight() {
        let model = config::Model::default();
        let mem = MemStat {
            total: 8_000_000,
            free: 0,
            cached: 0,
            buffers: 0,
        };
        // max(0, -10% of total) = 0: prediction is disabled this tick
        assert_eq!(StateInner::readahead_budget(&model, &mem), 0);
    }

    #[test]
    fn out_of_range_percentages_are_clamped() {
        let mut model = config::Model::default();
        model.memtotal = 0;
        model.memfree = 500; // clamped to 100
        model.memcached = 0;
        let mem = MemStat {
            total: 0,
            free: 5_000,
            cached: 0,
            buffers: 0,
        };
        assert_eq!(StateInner::readahead_budget(&model, &mem), 5_000);
    }

    #[test]
    fn running_exe_maps_are_never_selected() {
        let mut state = test_state();
        let running = add_exe(
            &mut state,
            "/usr/bin/running",
            Pool::Priority,
            &[("/usr/bin/running", 0, 4096), ("/lib/shared.so", 0, 8192)],
        );
        let idle = add_exe(
            &mut state,
            "/usr/bin/idle",
            Pool::Priority,
            &[("/usr/bin/idle", 0, 4096), ("/lib/shared.so", 0, 8192)],
        );
        run(&running, 77);

        // bias the idle exe so its maps have a real score
        for exe in state.exes.values() {
            exe.zero_lnprob();
        }
        for map in &state.maps {
            map.zero_lnprob();
        }
        idle.force_lnprob(-2.0);
        for exe in state.exes.values() {
            if exe.is_running() {
                exe.poison_maps();
            }
        }
        for exe in state.exes.values() {
            if !exe.is_running() && exe.pool() == Pool::Priority {
                exe.bid_in_maps();
            }
        }

        let selected = state.select_maps(u64::MAX);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].path(), std::path::Path::new("/usr/bin/idle"));
    }

    #[test]
    fn observation_pool_exes_do_not_bid() {
        let mut state = test_state();
        let obs = add_exe(
            &mut state,
            "/usr/libexec/worker",
            Pool::Observation,
            &[("/usr/libexec/worker", 0, 4096)],
        );
        obs.force_lnprob(-5.0);

        for exe in state.exes.values() {
            if !exe.is_running() && exe.pool() == Pool::Priority {
                exe.bid_in_maps();
            }
        }
        assert!(state.select_maps(u64::MAX).is_empty());
    }

    #[test]
    fn selection_prefers_score_per_byte_and_respects_budget() {
        let mut state = test_state();
        let small = add_exe(
            &mut state,
            "/usr/bin/small",
            Pool::Priority,
            &[("/usr/bin/small", 0, 1000)],
        );
        let large = add_exe(
            &mut state,
            "/usr/bin/large",
            Pool::Priority,
            &[("/usr/bin/large", 0, 100_000)],
        );
        small.force_lnprob(-1.0);
        large.force_lnprob(-1.0);
        for exe in state.exes.values() {
            exe.bid_in_maps();
        }

        // both fit
        let selected = state.select_maps(101_000);
        assert_eq!(selected.len(), 2);
        // equal scores: the smaller map has the better ratio
        assert_eq!(selected[0].path(), std::path::Path::new("/usr/bin/small"));

        // only the small one fits; the large is skipped, not blocking
        let selected = state.select_maps(2_000);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].path(), std::path::Path::new("/usr/bin/small"));

        let total: u64 = selected.iter().map(|m| m.length()).sum();
        assert!(total <= 2_000);
    }

    #[test]
    fn manual_apps_rank_first() {
        let mut state = test_state();
        let manual = add_exe(
            &mut state,
            "/opt/app/bin/app",
            Pool::Priority,
            &[("/opt/app/bin/app", 0, 4096)],
        );
        manual.set_manual(true);
        let other = add_exe(
            &mut state,
            "/usr/bin/other",
            Pool::Priority,
            &[("/usr/bin/other", 0, 4096)],
        );
        other.force_lnprob(-0.5);

        for exe in state.exes.values() {
            exe.zero_lnprob();
        }
        for map in &state.maps {
            map.zero_lnprob();
        }
        state.prophet_predict_scores_only().unwrap();

        assert!(manual.lnprob() < other.lnprob());
        let selected = state.select_maps(4096);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].path(), std::path::Path::new("/opt/app/bin/app"));
    }

    #[test]
    fn session_boost_promotes_most_used_apps() {
        let mut config = Config::default();
        config.system.maxprocs = 1;
        config.preheat.boostapps = 1;
        config.preheat.bootwindow = std::time::Duration::from_secs(3600);
        let mut state = StateInner::new(config, None).unwrap();

        let favourite = add_exe(
            &mut state,
            "/usr/bin/favourite",
            Pool::Priority,
            &[("/usr/bin/favourite", 0, 4096)],
        );
        favourite.restore_launch_stats(12.5, 30, 7200);
        let rare = add_exe(
            &mut state,
            "/usr/bin/rare",
            Pool::Priority,
            &[("/usr/bin/rare", 0, 4096)],
        );
        rare.restore_launch_stats(0.3, 1, 30);

        state.prophet_predict_scores_only().unwrap();

        assert_eq!(favourite.lnprob(), CERTAIN_LNPROB);
        assert!(rare.lnprob() > CERTAIN_LNPROB);
    }

    #[test]
    fn dispatch_readahead_hints_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = test_state();

        let mut maps = Vec::new();
        for i in 0..3 {
            let path = dir.path().join(format!("blob{i}"));
            std::fs::write(&path, vec![0u8; 8192]).unwrap();
            let map = state.lookup_or_new_map(&MapRegion {
                path: path.clone(),
                offset: 0,
                length: 8192,
            });
            state.ref_map(&map);
            maps.push(map);
        }
        // one vanished file: per-file errors are ignored
        let ghost = state.lookup_or_new_map(&MapRegion {
            path: dir.path().join("ghost"),
            offset: 0,
            length: 4096,
        });
        state.ref_map(&ghost);
        maps.push(ghost);

        let done = state.dispatch_readahead(maps);
        assert_eq!(done, 3);
    }

    proptest! {
        #[test]
        fn selection_never_exceeds_budget(
            lengths in prop::collection::vec(1u64..200_000, 1..30),
            scores in prop::collection::vec(0.01f32..10.0, 30),
            budget in 0u64..1_000_000,
        ) {
            let mut state = test_state();
            for (i, length) in lengths.iter().enumerate() {
                let exe = add_exe(
                    &mut state,
                    &format!("/usr/bin/exe{i}"),
                    Pool::Priority,
                    &[(&format!("/usr/bin/exe{i}") as &str, 0, *length)],
                );
                exe.force_lnprob(-scores[i % scores.len()]);
            }
            for exe in state.exes.values() {
                exe.bid_in_maps();
            }

            let selected = state.select_maps(budget);
            let total: u64 = selected.iter().map(|m| m.length()).sum();
            prop_assert!(total <= budget);

            // deterministic: same inputs, same selection
            let again = state.select_maps(budget);
            let seqs: Vec<_> = selected.iter().map(|m| m.seq()).collect();
            let seqs_again: Vec<_> = again.iter().map(|m| m.seq()).collect();
            prop_assert_eq!(seqs, seqs_again);
        }
    }
}
