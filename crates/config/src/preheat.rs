use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Preheat {
    /// Glob patterns (where `*` does not cross `/`) matching exes that must
    /// stay in the observation pool regardless of other classification.
    pub exclude: Vec<String>,

    /// Directory prefixes whose exes are promoted into the priority pool.
    pub userapps: Vec<String>,

    /// How many top priority-pool apps the session boost preloads.
    pub boostapps: usize,

    /// Length of the boot window after daemon start during which the session
    /// boost is active. Zero disables boosting.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub bootwindow: Duration,

    /// Pause flag file consulted at the top of every predict phase.
    pub pausefile: PathBuf,
}

impl Default for Preheat {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            userapps: Vec::new(),
            boostapps: 5,
            bootwindow: Duration::from_secs(120),
            pausefile: PathBuf::from("/run/preheat.pause"),
        }
    }
}

impl Preheat {
    pub(crate) fn validate(&mut self) {
        if self.pausefile.as_os_str().is_empty() {
            warn!("preheat.pausefile is empty, using default");
            self.pausefile = Preheat::default().pausefile;
        }
    }
}
