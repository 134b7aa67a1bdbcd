/// The run that started a streak of consecutive timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HangCandidate {
    pub run: u64,
    pub seed: u64,
}

/// Counters carried between runs. Owned by the fuzz loop and handed by `&mut` to
/// the scheduler and the outcome machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationState {
    /// Current run number.
    pub counter: u64,
    /// Consecutive crash reports for the current run.
    pub failure_count: u32,
    pub potential_crash: Option<HangCandidate>,
    /// Consecutive timeout aborts since `potential_crash` was recorded.
    pub potential_crash_count: u32,
    /// First run number of the current round-robin window.
    pub seed_base: u64,
}

impl IterationState {
    pub fn starting_at(run: u64) -> Self {
        Self {
            counter: run,
            seed_base: run,
            ..Self::default()
        }
    }

    pub fn clear_potential_crash(&mut self) {
        self.potential_crash = None;
        self.potential_crash_count = 0;
    }
}
