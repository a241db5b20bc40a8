use crate::sort_strategy::SortStrategy;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Upper bound on readahead workers; more than this only adds contention.
const MAX_MAXPROCS: usize = 256;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct System {
    /// Whether the observer scans `/proc` each cycle.
    pub doscan: bool,

    /// Whether the predictor runs each cycle.
    pub dopredict: bool,

    /// Autosave interval for state persistence.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub autosave: Duration,

    /// Map path prefixes ("!" means deny). Only maps under an accepted prefix
    /// are tracked.
    pub mapprefix: Vec<String>,

    /// Exe path prefixes ("!" means deny).
    pub exeprefix: Vec<String>,

    /// Cap on parallel readahead workers per predict phase.
    pub maxprocs: usize,

    /// I/O sort strategy: 0 none, 1 path, 2 block, 3 block-then-path.
    pub sortstrategy: SortStrategy,

    /// Path to a newline-separated list of exes forced into the priority
    /// pool, preloaded even if never observed running.
    pub manualapps: Option<PathBuf>,
}

impl Default for System {
    fn default() -> Self {
        Self {
            doscan: true,
            dopredict: true,
            autosave: Duration::from_secs(3600),
            mapprefix: Vec::new(),
            exeprefix: Vec::new(),
            maxprocs: 30,
            sortstrategy: SortStrategy::default(),
            manualapps: None,
        }
    }
}

impl System {
    pub(crate) fn validate(&mut self) {
        let defaults = System::default();
        if self.autosave.is_zero() {
            warn!("system.autosave of zero disables persistence, using default");
            self.autosave = defaults.autosave;
        }
        if self.maxprocs == 0 || self.maxprocs > MAX_MAXPROCS {
            warn!(
                maxprocs = self.maxprocs,
                "system.maxprocs out of range, using default"
            );
            self.maxprocs = defaults.maxprocs;
        }
    }
}
