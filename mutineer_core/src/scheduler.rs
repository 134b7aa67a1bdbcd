use crate::session::{FuzzIndex, Session, SessionError};
use crate::state::IterationState;
use thiserror::Error;

/// Errors that can occur while choosing the next run.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A finite seed loop needs at least one seed.
    #[error("Seed loop is empty")]
    EmptySeedLoop,
    #[error("Round-robin window must be at least 1")]
    EmptyWindow,
    /// Round-robin needs something to rotate through.
    #[error("Session has no fuzzable messages")]
    NoTargets,
    #[error("Scheduler could not update fuzz targets: {0}")]
    Session(#[from] SessionError),
}

/// Inclusive run-number bounds. `max == None` runs until stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunBounds {
    pub min: u64,
    pub max: Option<u64>,
}

impl RunBounds {
    pub fn single(run: u64) -> Self {
        Self {
            min: run,
            max: Some(run),
        }
    }
}

/// How seeds are derived from the run counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleMode {
    /// `seed = counter`.
    Sequential,
    /// `seed = seeds[counter % seeds.len()]`.
    FiniteLoop(Vec<u64>),
    /// Every `window` runs the active fuzz target rotates; a full rotation advances
    /// the seed base by `window`.
    RoundRobin { window: u64 },
    /// One case with a fixed seed (raw dump or emulation).
    Single(u64),
}

/// What the next run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iteration {
    pub run: u64,
    pub seed: u64,
    /// The active target in round-robin mode.
    pub target: Option<FuzzIndex>,
}

/// Picks the seed (and, in round-robin mode, the fuzz target) for each run.
#[derive(Debug, Clone)]
pub struct Scheduler {
    mode: ScheduleMode,
    bounds: RunBounds,
}

impl Scheduler {
    pub fn new(mode: ScheduleMode, bounds: RunBounds) -> Result<Self, SchedulerError> {
        match &mode {
            ScheduleMode::FiniteLoop(seeds) if seeds.is_empty() => {
                return Err(SchedulerError::EmptySeedLoop);
            }
            ScheduleMode::RoundRobin { window: 0 } => return Err(SchedulerError::EmptyWindow),
            _ => {}
        }
        Ok(Self { mode, bounds })
    }

    pub fn mode(&self) -> &ScheduleMode {
        &self.mode
    }

    pub fn bounds(&self) -> RunBounds {
        self.bounds
    }

    pub fn is_single(&self) -> bool {
        matches!(self.mode, ScheduleMode::Single(_))
    }

    pub fn initial_state(&self) -> IterationState {
        IterationState::starting_at(self.bounds.min)
    }

    /// Marks the session's fuzz targets for the chosen mode: only the current target
    /// in round-robin mode, every eligible target otherwise.
    pub fn prepare(&self, session: &mut Session) -> Result<(), SchedulerError> {
        match self.mode {
            ScheduleMode::RoundRobin { .. } => {
                if session.targets().is_empty() {
                    return Err(SchedulerError::NoTargets);
                }
                session.focus_current_target()?;
            }
            _ => {
                let targets = session.targets().to_vec();
                session.set_targets(targets)?;
            }
        }
        Ok(())
    }

    /// Computes the next iteration, rotating the round-robin target first when the
    /// current window is used up.
    pub fn next(
        &self,
        state: &mut IterationState,
        session: &mut Session,
    ) -> Result<Iteration, SchedulerError> {
        let seed = match &self.mode {
            ScheduleMode::Sequential => state.counter,
            ScheduleMode::Single(seed) => *seed,
            ScheduleMode::FiniteLoop(seeds) => {
                let len = seeds.len() as u64;
                seeds[(state.counter % len) as usize]
            }
            ScheduleMode::RoundRobin { window } => {
                if state.counter >= state.seed_base.saturating_add(*window) {
                    if session.rotate_target() {
                        state.seed_base += window;
                    }
                    state.counter = state.seed_base;
                    session.focus_current_target()?;
                    tracing::info!(
                        target_index = ?session.current_target(),
                        seed_base = state.seed_base,
                        "rotated fuzz target"
                    );
                }
                state.counter
            }
        };

        let target = match self.mode {
            ScheduleMode::RoundRobin { .. } => session.current_target(),
            _ => None,
        };
        Ok(Iteration {
            run: state.counter,
            seed,
            target,
        })
    }

    /// True once the counter has moved past the configured maximum.
    pub fn is_exhausted(&self, state: &IterationState) -> bool {
        self.bounds.max.is_some_and(|max| state.counter > max)
    }
}
