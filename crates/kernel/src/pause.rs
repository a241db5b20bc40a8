//! The externally toggled pause gate.
//!
//! The control tool writes an expiry unix timestamp into the pause file
//! (`0` means until reboot). The daemon consults the file at the top of
//! every predict phase; an expired file is removed so preloading resumes
//! seamlessly.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PauseGate {
    path: PathBuf,
}

impl PauseGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether prediction is currently suppressed.
    pub fn is_active(&self) -> bool {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return false,
        };

        let Ok(expiry) = content.trim().parse::<u64>() else {
            warn!(path = %self.path.display(), "invalid pause file, removing");
            let _ = std::fs::remove_file(&self.path);
            return false;
        };

        if expiry == 0 {
            // until reboot
            return true;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now >= expiry {
            debug!("pause expired, resuming preloading");
            let _ = std::fs::remove_file(&self.path);
            return false;
        }
        true
    }
}
