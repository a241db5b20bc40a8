#![allow(clippy::mutable_key_type)]

mod inner;

use crate::{ExeMap, Markov};
pub(crate) use inner::ExeInner;
pub use inner::{launch_weight, Pool, ProcInfo};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Weak},
};

/// A tracked executable, shared between the state registries and its markov
/// edges.
#[derive(Debug, Default, Clone)]
pub struct Exe(pub(crate) Arc<Mutex<ExeInner>>);

/// Weak handle held by markov edges so the edge never keeps an exe alive.
#[derive(Debug, Default, Clone)]
pub struct ExeForMarkov(pub(crate) Weak<Mutex<ExeInner>>);

impl Exe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(Arc::new(Mutex::new(ExeInner::new(path))))
    }

    pub fn path(&self) -> PathBuf {
        self.0.lock().path.clone()
    }

    /// Sequence number assigned by the state at registration.
    pub fn seq(&self) -> Option<u64> {
        self.0.lock().seq
    }

    pub fn set_seq(&self, seq: u64) {
        self.0.lock().seq.replace(seq);
    }

    pub fn pool(&self) -> Pool {
        self.0.lock().pool
    }

    pub fn set_pool(&self, pool: Pool) {
        self.0.lock().pool = pool;
    }

    pub fn is_manual(&self) -> bool {
        self.0.lock().manual
    }

    pub fn set_manual(&self, manual: bool) {
        self.0.lock().manual = manual;
    }

    pub(crate) fn for_markov(&self) -> ExeForMarkov {
        ExeForMarkov(Arc::downgrade(&self.0))
    }

    pub fn is_running(&self) -> bool {
        self.0.lock().is_running()
    }

    pub fn has_pid(&self, pid: libc::pid_t) -> bool {
        self.0.lock().running_pids.contains_key(&pid)
    }

    pub fn running_pid_count(&self) -> usize {
        self.0.lock().running_pids.len()
    }

    /// Any currently tracked pid, used to re-read maps on relaunch.
    pub fn any_running_pid(&self) -> Option<libc::pid_t> {
        self.0.lock().running_pids.keys().next().copied()
    }

    pub fn track_start(&self, info: ProcInfo) {
        self.0.lock().track_start(info);
    }

    pub fn adopt_pid(&self, info: ProcInfo) {
        self.0.lock().adopt_pid(info);
    }

    pub fn accrue_weight(&self, pid: libc::pid_t, now: u64) {
        self.0.lock().accrue_weight(pid, now);
    }

    pub fn prune_exited(&self, alive: &FxHashSet<libc::pid_t>, now: u64) -> bool {
        self.0.lock().prune_exited(alive, now)
    }

    pub fn update_running_timestamp(&self, running_timestamp: u64) {
        let mut inner = self.0.lock();
        inner.running_timestamp.replace(running_timestamp);
        inner.update_time.replace(running_timestamp);
    }

    pub fn update_time(&self) -> Option<u64> {
        self.0.lock().update_time
    }

    pub fn set_update_time(&self, update_time: u64) {
        self.0.lock().update_time.replace(update_time);
    }

    pub fn change_timestamp(&self) -> u64 {
        self.0.lock().change_timestamp
    }

    pub fn set_change_timestamp(&self, change_timestamp: u64) {
        self.0.lock().change_timestamp = change_timestamp;
    }

    pub fn with_change_timestamp(self, change_timestamp: u64) -> Self {
        self.0.lock().with_change_timestamp(change_timestamp);
        self
    }

    pub fn time(&self) -> u64 {
        self.0.lock().time
    }

    pub fn set_time(&self, time: u64) {
        self.0.lock().time = time;
    }

    pub fn increase_time(&self, period: u64) {
        self.0.lock().time += period;
    }

    pub fn size(&self) -> u64 {
        self.0.lock().size
    }

    pub fn lnprob(&self) -> f32 {
        self.0.lock().lnprob
    }

    pub fn zero_lnprob(&self) {
        self.0.lock().lnprob = 0.0;
    }

    pub fn force_lnprob(&self, lnprob: f32) {
        self.0.lock().lnprob = lnprob;
    }

    pub fn weighted_launches(&self) -> f64 {
        self.0.lock().weighted_launches
    }

    pub fn raw_launches(&self) -> u64 {
        self.0.lock().raw_launches
    }

    pub fn total_duration_sec(&self) -> u64 {
        self.0.lock().total_duration_sec
    }

    /// Restore persisted launch statistics, used by the state-file reader.
    pub fn restore_launch_stats(&self, weighted: f64, raw: u64, duration: u64) {
        let mut inner = self.0.lock();
        inner.weighted_launches = weighted;
        inner.raw_launches = raw;
        inner.total_duration_sec = duration;
    }

    pub fn try_with_exemaps(self, exemaps: HashSet<ExeMap>) -> Result<Self, crate::Error> {
        self.0.lock().with_exemaps(exemaps);
        Ok(self)
    }

    /// Replace the exemap set, recomputing the exe size.
    pub fn replace_exemaps(&self, exemaps: HashSet<ExeMap>) {
        self.0.lock().with_exemaps(exemaps);
    }

    pub fn add_exemap(&self, exemap: ExeMap) {
        let mut inner = self.0.lock();
        let length = exemap.map.length();
        if inner.exemaps.insert(exemap) {
            inner.size = inner.size.wrapping_add(length);
        }
    }

    pub fn exemaps_snapshot(&self) -> Vec<ExeMap> {
        self.0.lock().exemaps.iter().cloned().collect()
    }

    pub fn exemap_count(&self) -> usize {
        self.0.lock().exemaps.len()
    }

    pub fn add_markov(&self, markov: Markov) {
        self.0.lock().markovs.push(markov);
    }

    /// Whether a markov edge to `other` already exists (either direction).
    pub fn has_markov_with(&self, other: &Exe) -> bool {
        let markovs = std::mem::take(&mut self.0.lock().markovs);
        let other_path = other.path();
        let found = markovs
            .iter()
            .any(|markov| markov.involves(&other_path).unwrap_or(false));
        self.0.lock().markovs = markovs;
        found
    }

    /// Build a markov edge to `other_exe` and record it in both endpoints.
    pub fn build_markov_chain_with(
        &self,
        other_exe: &Exe,
        state_time: u64,
    ) -> Result<Option<Markov>, crate::Error> {
        if self.path() == other_exe.path() {
            return Ok(None);
        }
        let markov =
            Markov::new(self.for_markov(), other_exe.for_markov()).with_initialize(state_time)?;
        self.add_markov(markov.clone());
        other_exe.add_markov(markov.clone());
        Ok(Some(markov))
    }

    /// Notify all edges that this exe's running state may have flipped.
    pub fn markov_state_changed(&self, state_time: u64) -> Result<(), crate::Error> {
        // take the markovs out because the markov locks the exe back;
        // holding our lock across the call would deadlock
        let markovs = std::mem::take(&mut self.0.lock().markovs);
        let res = markovs
            .iter()
            .try_for_each(|markov| markov.state_changed(state_time));
        self.0.lock().markovs = markovs;
        res
    }

    /// Advance both-running time on edges where this exe is endpoint `a`
    /// (each edge is shared by two exes and must be visited once).
    pub fn increase_markov_time(&self, period: u64) -> Result<(), crate::Error> {
        let markovs = std::mem::take(&mut self.0.lock().markovs);
        let path = self.path();
        let res = markovs.iter().try_for_each(|markov| {
            if markov.is_a_side(&path)? {
                markov.increase_time(period);
            }
            Ok(())
        });
        self.0.lock().markovs = markovs;
        res
    }

    /// Let the edges where this exe is endpoint `a` bid into both endpoints'
    /// running probability.
    pub fn markov_bid_in_exes(
        &self,
        use_correlation: bool,
        state_time: u64,
        cycle: f32,
    ) -> Result<(), crate::Error> {
        let markovs = std::mem::take(&mut self.0.lock().markovs);
        let path = self.path();
        let res = markovs.iter().try_for_each(|markov| {
            if markov.is_a_side(&path)? {
                markov.bid_in_exes(use_correlation, state_time, cycle)?;
            }
            Ok(())
        });
        self.0.lock().markovs = markovs;
        res
    }

    pub fn markov_count(&self) -> usize {
        self.0.lock().markovs.len()
    }

    /// Markov edges where this exe is endpoint `a`, for persistence.
    pub fn markovs_a_side(&self) -> Vec<Markov> {
        let markovs = std::mem::take(&mut self.0.lock().markovs);
        let path = self.path();
        let owned = markovs
            .iter()
            .filter(|markov| markov.is_a_side(&path).unwrap_or(false))
            .cloned()
            .collect();
        self.0.lock().markovs = markovs;
        owned
    }

    /// Mark every map of a running exe ineligible for preloading.
    pub fn poison_maps(&self) {
        let inner = self.0.lock();
        for exemap in &inner.exemaps {
            exemap.map.set_lnprob(1.0);
        }
    }

    /// Accumulate this exe's need into its maps' scores. Maps already
    /// poisoned by a running exe are skipped.
    pub fn bid_in_maps(&self) {
        let inner = self.0.lock();
        for exemap in &inner.exemaps {
            if exemap.map.lnprob() > 0.0 {
                continue;
            }
            exemap.map.increase_lnprob(exemap.prob as f32 * inner.lnprob);
        }
    }
}
