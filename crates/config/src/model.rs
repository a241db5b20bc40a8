use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;
use tracing::warn;

/// Shortest tick period the daemon accepts. Anything below this turns the
/// scan loop into a CPU burner.
const MIN_CYCLE: Duration = Duration::from_secs(2);

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Model {
    /// The quantum of time for preheat. The daemon gathers data and issues
    /// predictions once every cycle. Use an even number. **Measured in
    /// seconds**.
    ///
    /// ## Note
    ///
    /// Setting this parameter too low may reduce system performance and
    /// stability.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub cycle: Duration,

    /// Whether the correlation coefficient should be used in the prediction
    /// algorithm. There are arguments both for and against using it.
    /// Currently it's believed that using it results in more accurate
    /// prediction.
    pub usecorrelation: bool,

    /// Minimum sum of the length of the maps of a process for preheat to
    /// consider tracking the application.
    ///
    /// ## Note
    ///
    /// Setting this parameter too high makes preheat less effective, while
    /// setting it too low makes it eat quadratically more resources as it
    /// tracks more processes.
    pub minsize: u64,

    /// The following control how much memory preheat is allowed to use for
    /// preloading in each cycle. All values are signed percentages and are
    /// clamped to -100..=100. The byte budget is:
    ///
    /// ```text
    /// max(0, TOTAL * memtotal + FREE * memfree + CACHED * memcached)
    /// ```
    ///
    /// where TOTAL, FREE, and CACHED are read from `/proc/meminfo` at
    /// prediction time.
    pub memtotal: i32,

    /// Percentage of free memory.
    pub memfree: i32,

    /// Percentage of cached memory.
    pub memcached: i32,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(20),
            usecorrelation: true,
            minsize: 2_000_000,
            memtotal: -10,
            memfree: 50,
            memcached: 0,
        }
    }
}

impl Model {
    /// Replace out-of-range values with defaults. The daemon never aborts on
    /// bad configuration.
    pub(crate) fn validate(&mut self) {
        let defaults = Model::default();
        if self.cycle < MIN_CYCLE {
            warn!(
                cycle = self.cycle.as_secs(),
                "model.cycle below minimum, using default"
            );
            self.cycle = defaults.cycle;
        }
        for (name, value) in [
            ("memtotal", &mut self.memtotal),
            ("memfree", &mut self.memfree),
            ("memcached", &mut self.memcached),
        ] {
            if !(-100..=100).contains(value) {
                warn!(key = name, value = *value, "percentage out of range, clamping");
                *value = (*value).clamp(-100, 100);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn validate_restores_cycle_default() {
        let mut model = Model {
            cycle: Duration::from_secs(1),
            ..Default::default()
        };
        model.validate();
        assert_eq!(model.cycle, Duration::from_secs(20));
    }

    #[test]
    fn validate_clamps_percentages() {
        let mut model = Model {
            memtotal: -500,
            memfree: 500,
            ..Default::default()
        };
        model.validate();
        assert_eq!(model.memtotal, -100);
        assert_eq!(model.memfree, 100);
    }
}
