mod inner;
mod markov_state;

use crate::{exe::ExeForMarkov, extract_exe, Error};
use inner::MarkovInner;
pub use markov_state::MarkovState;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// An unordered pair of distinct exes with a 4-state continuous-time model
/// over their joint running status.
///
/// Every edge is recorded in both endpoints' markov sets; construction via
/// [`Exe::build_markov_chain_with`](crate::Exe::build_markov_chain_with)
/// enforces the twin registration.
#[derive(Debug, Clone)]
pub struct Markov(pub(crate) Arc<Mutex<MarkovInner>>);

impl Markov {
    pub(crate) fn new(exe_a: ExeForMarkov, exe_b: ExeForMarkov) -> Self {
        Self(Arc::new(Mutex::new(MarkovInner::new(exe_a, exe_b))))
    }

    pub(crate) fn with_initialize(self, state_time: u64) -> Result<Markov, Error> {
        self.0.lock().initialize(state_time)?;
        Ok(self)
    }

    pub fn state(&self) -> MarkovState {
        self.0.lock().state
    }

    pub fn time(&self) -> u64 {
        self.0.lock().time
    }

    pub fn change_timestamp(&self) -> u64 {
        self.0.lock().change_timestamp
    }

    pub fn state_changed(&self, state_time: u64) -> Result<(), Error> {
        self.0.lock().state_changed(state_time)
    }

    pub fn set_state_from_exes(&self) -> Result<(), Error> {
        self.0.lock().set_state_from_exes()
    }

    /// Advance the both-running clock; a no-op in any other state.
    pub fn increase_time(&self, period: u64) {
        let mut markov = self.0.lock();
        if markov.state == MarkovState::BothRunning {
            markov.time += period;
        }
    }

    pub fn bid_in_exes(
        &self,
        use_correlation: bool,
        state_time: u64,
        cycle: f32,
    ) -> Result<(), Error> {
        self.0
            .lock()
            .bid_in_exes(use_correlation, state_time, cycle)
    }

    pub fn correlation(&self, state_time: u64) -> Result<f64, Error> {
        self.0.lock().correlation(state_time)
    }

    /// Whether `path` is this edge's `a` endpoint. Iterations that must see
    /// each edge exactly once filter on the `a` side.
    pub fn is_a_side(&self, path: &Path) -> Result<bool, Error> {
        let inner = self.0.lock();
        let a = extract_exe!(inner.exe_a);
        let is_a = a.lock().path == path;
        Ok(is_a)
    }

    /// Whether `path` is either endpoint of this edge.
    pub fn involves(&self, path: &Path) -> Result<bool, Error> {
        let inner = self.0.lock();
        let a = extract_exe!(inner.exe_a);
        if a.lock().path == path {
            return Ok(true);
        }
        let b = extract_exe!(inner.exe_b);
        let is_b = b.lock().path == path;
        Ok(is_b)
    }

    /// Sequence numbers of both endpoints, for persistence.
    pub fn endpoint_seqs(&self) -> Result<Option<(u64, u64)>, Error> {
        let inner = self.0.lock();
        let a = extract_exe!(inner.exe_a);
        let a_seq = a.lock().seq;
        let b = extract_exe!(inner.exe_b);
        let b_seq = b.lock().seq;
        Ok(a_seq.zip(b_seq))
    }

    pub fn sojourn_stats(&self) -> (u64, [f64; 4], [[u32; 4]; 4]) {
        let inner = self.0.lock();
        (inner.time, inner.time_to_leave, inner.weight)
    }

    /// Restore persisted statistics, used by the state-file reader.
    pub fn restore_stats(&self, time: u64, time_to_leave: [f64; 4], weight: [[u32; 4]; 4]) {
        let mut inner = self.0.lock();
        inner.time = time;
        inner.time_to_leave = time_to_leave;
        inner.weight = weight;
    }
}
