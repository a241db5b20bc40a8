//! Session boost window.
//!
//! For a short window after the daemon starts (which on a typical desktop
//! coincides with session login), the predictor treats the most-used
//! priority-pool applications as certain to run. The core only consults the
//! boolean; richer session detection lives outside the daemon.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SessionBoost {
    started_at: Instant,
    window: Duration,
    top_apps: usize,
}

impl SessionBoost {
    pub fn new(window: Duration, top_apps: usize) -> Self {
        Self {
            started_at: Instant::now(),
            window,
            top_apps,
        }
    }

    pub fn in_boot_window(&self) -> bool {
        self.top_apps > 0 && !self.window.is_zero() && self.started_at.elapsed() < self.window
    }

    pub fn remaining(&self) -> Duration {
        self.window.saturating_sub(self.started_at.elapsed())
    }

    pub fn top_apps(&self) -> usize {
        self.top_apps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_boost_is_inside_window() {
        let boost = SessionBoost::new(Duration::from_secs(120), 5);
        assert!(boost.in_boot_window());
        assert!(boost.remaining() <= Duration::from_secs(120));
    }

    #[test]
    fn zero_window_never_boosts() {
        let boost = SessionBoost::new(Duration::ZERO, 5);
        assert!(!boost.in_boot_window());
    }

    #[test]
    fn zero_top_apps_never_boosts() {
        let boost = SessionBoost::new(Duration::from_secs(120), 0);
        assert!(!boost.in_boot_window());
    }
}
