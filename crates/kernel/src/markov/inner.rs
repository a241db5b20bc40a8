use super::MarkovState;
use crate::{exe::ExeForMarkov, extract_exe, Error};

#[derive(Debug, Default, Clone)]
pub struct MarkovInner {
    pub exe_a: ExeForMarkov,

    pub exe_b: ExeForMarkov,

    /// Seconds both exes were simultaneously running (time spent in state 3).
    pub time: u64,

    /// Running mean of sojourn time per state.
    pub time_to_leave: [f64; 4],

    /// Transition counts; the diagonal counts sojourns in a state and is the
    /// denominator of the sojourn mean.
    pub weight: [[u32; 4]; 4],

    pub state: MarkovState,

    /// Model time of the last recorded transition.
    pub change_timestamp: u64,
}

impl MarkovInner {
    pub fn new(exe_a: ExeForMarkov, exe_b: ExeForMarkov) -> Self {
        Self {
            exe_a,
            exe_b,
            ..Default::default()
        }
    }

    /// Initialize a freshly created edge: state mirrors the endpoints'
    /// current running status, all counters start at zero.
    pub fn initialize(&mut self, state_time: u64) -> Result<(), Error> {
        self.set_state_from_exes()?;
        self.change_timestamp = state_time;
        self.time = 0;
        self.time_to_leave = [0.0; 4];
        self.weight = [[0; 4]; 4];
        Ok(())
    }

    /// Recompute the state from the endpoints' running status without
    /// touching any statistics. Used after loading persisted edges.
    pub fn set_state_from_exes(&mut self) -> Result<(), Error> {
        let a = extract_exe!(self.exe_a);
        let b = extract_exe!(self.exe_b);
        let a_running = a.lock().is_running();
        let b_running = b.lock().is_running();
        self.state = MarkovState::from_running(a_running, b_running);
        Ok(())
    }

    /// Record a state transition at `state_time`.
    ///
    /// Calls within the same model instant coalesce, and a recomputed state
    /// equal to the current one is a no-op (both endpoints notify their
    /// edges, so every transition is seen twice).
    pub fn state_changed(&mut self, state_time: u64) -> Result<(), Error> {
        if self.change_timestamp == state_time {
            // already taken care of
            return Ok(());
        }

        let a = extract_exe!(self.exe_a);
        let b = extract_exe!(self.exe_b);
        let new_state =
            MarkovState::from_running(a.lock().is_running(), b.lock().is_running());
        let old_state = self.state;

        if old_state == new_state {
            return Ok(());
        }

        let old_ix = old_state.index();
        let new_ix = new_state.index();

        self.weight[old_ix][old_ix] += 1;
        self.time_to_leave[old_ix] += ((state_time - self.change_timestamp) as f64
            - self.time_to_leave[old_ix])
            / f64::from(self.weight[old_ix][old_ix]);

        self.weight[old_ix][new_ix] += 1;
        self.state = new_state;
        self.change_timestamp = state_time;

        Ok(())
    }

    /// Let this edge bid into the running probability of each endpoint that
    /// is currently not running.
    pub fn bid_in_exes(
        &mut self,
        use_correlation: bool,
        state_time: u64,
        cycle: f32,
    ) -> Result<(), Error> {
        let state_ix = self.state.index();
        if self.weight[state_ix][state_ix] == 0 {
            return Ok(());
        }

        let correlation = if use_correlation {
            self.correlation(state_time)?
        } else {
            1.0
        };

        if !self.state.contains(MarkovState::ExeARunning) {
            let exe = std::mem::take(&mut self.exe_a);
            self.bid_for_exe(&exe, MarkovState::ExeARunning, correlation, cycle)?;
            self.exe_a = exe;
        }
        if !self.state.contains(MarkovState::ExeBRunning) {
            let exe = std::mem::take(&mut self.exe_b);
            self.bid_for_exe(&exe, MarkovState::ExeBRunning, correlation, cycle)?;
            self.exe_b = exe;
        }
        Ok(())
    }

    fn bid_for_exe(
        &mut self,
        exe: &ExeForMarkov,
        ystate: MarkovState,
        correlation: f64,
        cycle: f32,
    ) -> Result<(), Error> {
        let state_ix = self.state.index();
        let ystate_ix = ystate.index();

        if self.weight[state_ix][state_ix] == 0 || self.time_to_leave[state_ix] <= 1.0 {
            return Ok(());
        }

        // p_state_change is the probability that the edge leaves its current
        // state within the next period (taken as 1.5 cycles):
        //
        //                                          -period/ttl
        //   p(state changes in time < period) = 1 - e
        let p_state_change = {
            let period = f64::from(cycle) * 1.5;
            1.0 - (-period / self.time_to_leave[state_ix]).exp()
        };

        // p_y_runs_next is the probability that Y runs given a state change,
        // estimated from transition counts out of this state; regularized by
        // a small constant in the denominator.
        let p_y_runs_next = {
            let numerator =
                f64::from(self.weight[state_ix][ystate_ix] + self.weight[state_ix][3]);
            numerator / (f64::from(self.weight[state_ix][state_ix]) + 0.01)
        };

        let p_runs =
            (correlation.abs() * p_state_change * p_y_runs_next).clamp(0.0, 1.0 - 1e-9);
        let bid = (1.0 - p_runs).ln() as f32;

        let target = extract_exe!(exe);
        target.lock().lnprob += bid;
        Ok(())
    }

    /// Pearson correlation between the two exes' running indicators over the
    /// model lifetime `[0, state_time]`.
    pub fn correlation(&self, state_time: u64) -> Result<f64, Error> {
        let t = state_time;
        let a = {
            let exe = extract_exe!(self.exe_a);
            let time = exe.lock().time;
            time
        };
        let b = {
            let exe = extract_exe!(self.exe_b);
            let time = exe.lock().time;
            time
        };
        let ab = self.time;

        let correlation = if a == 0 || a == t || b == 0 || b == t {
            0.0
        } else {
            let numerator = (t as f64 * ab as f64) - (a as f64 * b as f64);
            let denominator2 = a as f64 * b as f64 * (t - a) as f64 * (t - b) as f64;
            numerator / denominator2.sqrt()
        };

        debug_assert!(correlation.abs() <= 1.00001);
        Ok(correlation.clamp(-1.0, 1.0))
    }
}

mod macros {
    /// Upgrade an [`ExeForMarkov`](crate::exe::ExeForMarkov) weak handle,
    /// erroring out if the exe has been deallocated.
    #[macro_export]
    macro_rules! extract_exe {
        ($exe:expr) => {
            $exe.0
                .upgrade()
                .ok_or($crate::Error::ExeMarkovDeallocated)?
        };
    }
}
