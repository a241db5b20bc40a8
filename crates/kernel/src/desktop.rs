//! Registry of executables that own a desktop entry.
//!
//! GUI applications get promoted to the priority pool and count as
//! user-initiated even when launched through a confinement helper whose
//! parent is not a shell.

use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const APPLICATION_DIRS: &[&str] = &[
    "/usr/share/applications",
    "/usr/local/share/applications",
];

#[derive(Debug, Default, Clone)]
pub struct DesktopRegistry {
    /// Absolute paths and bare binary names seen in `Exec=` lines.
    exec_paths: FxHashSet<PathBuf>,
    exec_names: FxHashSet<String>,
}

impl DesktopRegistry {
    /// Scan the standard application directories once.
    pub fn scan_system() -> Self {
        let mut registry = Self::default();
        let home_apps = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share/applications"));
        let dirs = APPLICATION_DIRS
            .iter()
            .copied()
            .map(PathBuf::from)
            .chain(home_apps);
        for dir in dirs {
            registry.scan_dir(&dir);
        }
        debug!(
            paths = registry.exec_paths.len(),
            names = registry.exec_names.len(),
            "desktop registry built"
        );
        registry
    }

    pub fn scan_dir(&mut self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            self.index_entry(&content);
        }
    }

    fn index_entry(&mut self, content: &str) {
        for line in content.lines() {
            let Some(exec) = line.strip_prefix("Exec=") else {
                continue;
            };
            let Some(binary) = exec.split_whitespace().next() else {
                continue;
            };
            let binary = Path::new(binary);
            if binary.has_root() {
                self.exec_paths.insert(binary.to_path_buf());
            }
            if let Some(name) = binary.file_name().and_then(|n| n.to_str()) {
                self.exec_names.insert(name.to_owned());
            }
        }
    }

    /// Whether `exe_path` is launched by some desktop entry, either by full
    /// path or by binary name.
    pub fn has_entry(&self, exe_path: &Path) -> bool {
        if self.exec_paths.contains(exe_path) {
            return true;
        }
        exe_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.exec_names.contains(name))
    }
}
