//! Named groupings of related executables (firefox + firefox-esr, code +
//! code-insiders) for aggregate statistics. Not on any hot path.

use crate::Exe;
use rustc_hash::FxHashMap;
use std::path::PathBuf;

/// How a family came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMethod {
    #[default]
    Config,
    Auto,
    Manual,
}

impl DiscoveryMethod {
    pub const fn as_u8(self) -> u8 {
        match self {
            DiscoveryMethod::Config => 0,
            DiscoveryMethod::Auto => 1,
            DiscoveryMethod::Manual => 2,
        }
    }
}

impl From<u8> for DiscoveryMethod {
    fn from(value: u8) -> Self {
        match value {
            1 => DiscoveryMethod::Auto,
            2 => DiscoveryMethod::Manual,
            _ => DiscoveryMethod::Config,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Family {
    pub id: String,
    pub method: DiscoveryMethod,
    pub members: Vec<PathBuf>,
    pub total_weighted_launches: f64,
    pub total_raw_launches: u64,
    pub last_used: u64,
}

impl Family {
    pub fn new(id: impl Into<String>, method: DiscoveryMethod) -> Self {
        Self {
            id: id.into(),
            method,
            ..Default::default()
        }
    }

    pub fn add_member(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.members.contains(&path) {
            self.members.push(path);
        }
    }

    /// Recompute aggregate statistics from the member exes.
    pub fn update_stats(&mut self, exes: &FxHashMap<PathBuf, Exe>) {
        self.total_weighted_launches = 0.0;
        self.total_raw_launches = 0;
        self.last_used = 0;

        for member in &self.members {
            let Some(exe) = exes.get(member) else {
                continue;
            };
            self.total_weighted_launches += exe.weighted_launches();
            self.total_raw_launches += exe.raw_launches();
            if let Some(ts) = exe.update_time() {
                self.last_used = self.last_used.max(ts);
            }
        }
    }
}
