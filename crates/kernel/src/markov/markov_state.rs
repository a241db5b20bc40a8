use bitflags::bitflags;

bitflags! {
    /// Joint running state of a markov edge's two endpoints.
    ///
    /// The bit pattern doubles as the state index 0..=3 used by the sojourn
    /// and transition tables.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
    pub struct MarkovState: u8 {
        const NeitherRunning = 0b00;
        const ExeARunning = 0b01;
        const ExeBRunning = 0b10;
        const BothRunning = 0b11;
    }
}

impl Default for MarkovState {
    fn default() -> Self {
        Self::NeitherRunning
    }
}

impl MarkovState {
    pub const fn from_running(a_running: bool, b_running: bool) -> Self {
        match (a_running, b_running) {
            (false, false) => MarkovState::NeitherRunning,
            (true, false) => MarkovState::ExeARunning,
            (false, true) => MarkovState::ExeBRunning,
            (true, true) => MarkovState::BothRunning,
        }
    }

    pub const fn index(self) -> usize {
        self.bits() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_flags_compose() {
        assert_eq!(
            MarkovState::BothRunning,
            MarkovState::ExeARunning | MarkovState::ExeBRunning
        );
    }

    #[test]
    fn index_matches_bit_encoding() {
        assert_eq!(MarkovState::NeitherRunning.index(), 0);
        assert_eq!(MarkovState::ExeARunning.index(), 1);
        assert_eq!(MarkovState::ExeBRunning.index(), 2);
        assert_eq!(MarkovState::BothRunning.index(), 3);
    }

    #[test]
    fn from_running_covers_all_combinations() {
        assert_eq!(
            MarkovState::from_running(true, false),
            MarkovState::ExeARunning
        );
        assert_eq!(
            MarkovState::from_running(false, true),
            MarkovState::ExeBRunning
        );
        assert_eq!(
            MarkovState::from_running(true, true),
            MarkovState::BothRunning
        );
        assert_eq!(MarkovState::default(), MarkovState::NeitherRunning);
    }
}
