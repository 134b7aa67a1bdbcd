//! Turns whatever a run produced into a single `RunOutcome`, and a `RunOutcome`
//! into the fuzz loop's next move.

use crate::executor::RunStatus;
use crate::hooks::ExceptionProcessor;
use crate::signal::{RunError, RunSignal};
use crate::state::{HangCandidate, IterationState};
use crate::transport::TransportError;
use std::time::Duration;

/// Timeouts needed to confirm a hang, per unit of failure threshold.
pub const HANG_CONFIRMATION_FACTOR: u32 = 3;

/// The one result of a run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    CrashDetected,
    AbortRun { is_timeout: bool },
    RetryRun,
    Halt,
    HaltWithoutLogging,
    HaltWithoutLoggingLast,
    SleepUntilResumed,
    /// Server mode accepted a peer that is not the target.
    SpuriousConnection,
    /// The operator asked to stop while the run was blocked.
    Interrupted,
}

impl From<&RunSignal> for RunOutcome {
    fn from(signal: &RunSignal) -> Self {
        match signal {
            RunSignal::LogCrash(_) => RunOutcome::CrashDetected,
            RunSignal::AbortRun { timeout, .. } => RunOutcome::AbortRun {
                is_timeout: *timeout,
            },
            RunSignal::RetryRun(_) => RunOutcome::RetryRun,
            RunSignal::LogAndHalt(_) => RunOutcome::HaltWithoutLogging,
            RunSignal::LogLastAndHalt(_) => RunOutcome::HaltWithoutLoggingLast,
            RunSignal::LogSleepGo(_) => RunOutcome::SleepUntilResumed,
            RunSignal::Halt(_) => RunOutcome::Halt,
        }
    }
}

/// Classifies a finished run.
///
/// A raised monitor crash flag takes precedence over anything the run returned.
/// Errors that are neither signals nor fatal are offered to `processor`: if it
/// returns `Ok` the error is logged and the loop moves on, if it returns a signal
/// that signal decides the outcome, and any other error is returned as fatal.
pub fn classify(
    result: Result<RunStatus, RunError>,
    crash_flag_raised: bool,
    processor: &mut dyn ExceptionProcessor,
) -> Result<RunOutcome, RunError> {
    if crash_flag_raised {
        if let Err(e) = &result {
            tracing::debug!(error = %e, "run error superseded by monitor crash signal");
        }
        return Ok(RunOutcome::CrashDetected);
    }

    let error = match result {
        Ok(RunStatus::Completed) => return Ok(RunOutcome::Success),
        Ok(RunStatus::SpuriousConnection { peer }) => {
            tracing::warn!(%peer, "ignoring connection from unexpected peer");
            return Ok(RunOutcome::SpuriousConnection);
        }
        Err(RunError::Signal(signal)) => {
            tracing::info!(%signal, "run raised signal");
            return Ok(RunOutcome::from(&signal));
        }
        Err(RunError::Transport(TransportError::Interrupted)) => {
            return Ok(RunOutcome::Interrupted);
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => e,
    };

    match processor.process_exception(&error) {
        Ok(()) => {
            tracing::warn!(error = %error, "exception ignored");
            Ok(RunOutcome::AbortRun { is_timeout: false })
        }
        Err(RunError::Signal(signal)) => {
            tracing::info!(%signal, original = %error, "exception processor raised signal");
            Ok(RunOutcome::from(&signal))
        }
        Err(fatal) => Err(fatal),
    }
}

/// What the fuzz loop does after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move on; the counter has already been advanced.
    Next,
    /// Run the same iteration again immediately.
    Repeat,
    /// Sleep, then run the same iteration again.
    RepeatAfter(Duration),
    /// The failure threshold was reached on `run`; the counter has been advanced.
    CrashConfirmed { run: u64, seed: u64 },
    /// A streak of timeouts confirmed a hang; the counter has been rewound past it.
    HangConfirmed(HangCandidate),
    /// Block on the monitor until the target is back, then repeat.
    AwaitResume,
    Stop,
    Shutdown,
}

/// Applies an outcome to the iteration counters.
#[derive(Debug, Clone)]
pub struct OutcomeMachine {
    failure_threshold: u32,
    failure_delay: Duration,
    min_run: u64,
}

impl OutcomeMachine {
    pub fn new(failure_threshold: u32, failure_delay: Duration, min_run: u64) -> Self {
        Self {
            failure_threshold,
            failure_delay,
            min_run,
        }
    }

    pub fn hang_threshold(&self) -> u32 {
        self.failure_threshold.saturating_mul(HANG_CONFIRMATION_FACTOR)
    }

    pub fn apply(&self, outcome: RunOutcome, seed: u64, state: &mut IterationState) -> Transition {
        match outcome {
            RunOutcome::Success => {
                state.failure_count = 0;
                state.clear_potential_crash();
                state.counter += 1;
                Transition::Next
            }
            RunOutcome::CrashDetected => {
                state.clear_potential_crash();
                state.failure_count += 1;
                if state.failure_count < self.failure_threshold {
                    tracing::warn!(
                        failures = state.failure_count,
                        threshold = self.failure_threshold,
                        seed,
                        "failure allowed, retrying after {:?}",
                        self.failure_delay
                    );
                    Transition::RepeatAfter(self.failure_delay)
                } else {
                    tracing::warn!(
                        failures = state.failure_count,
                        seed,
                        "failure threshold reached, moving to next case"
                    );
                    let run = state.counter;
                    state.failure_count = 0;
                    state.counter += 1;
                    Transition::CrashConfirmed { run, seed }
                }
            }
            RunOutcome::AbortRun { is_timeout: true } => {
                let candidate = *state.potential_crash.get_or_insert(HangCandidate {
                    run: state.counter,
                    seed,
                });
                state.potential_crash_count += 1;
                if state.potential_crash_count >= self.hang_threshold() {
                    tracing::warn!(
                        seed = candidate.seed,
                        run = candidate.run,
                        "timeout threshold hit, rewinding past candidate"
                    );
                    state.counter = candidate.run + 1;
                    state.clear_potential_crash();
                    Transition::HangConfirmed(candidate)
                } else {
                    state.counter += 1;
                    Transition::Next
                }
            }
            RunOutcome::AbortRun { is_timeout: false } => {
                state.counter += 1;
                Transition::Next
            }
            RunOutcome::RetryRun | RunOutcome::SpuriousConnection => Transition::Repeat,
            RunOutcome::SleepUntilResumed => {
                if state.counter > self.min_run {
                    Transition::AwaitResume
                } else {
                    Transition::Stop
                }
            }
            RunOutcome::Halt
            | RunOutcome::HaltWithoutLogging
            | RunOutcome::HaltWithoutLoggingLast => Transition::Stop,
            RunOutcome::Interrupted => Transition::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{DefaultExceptionProcessor, PassthroughProcessor};
    use crate::mutator::MutationError;

    /// Redirects every error to a fixed signal, or fails with a plain error.
    struct Redirect(Option<RunSignal>);

    impl ExceptionProcessor for Redirect {
        fn process_exception(&mut self, _error: &RunError) -> Result<(), RunError> {
            match &self.0 {
                Some(signal) => Err(signal.clone().into()),
                None => Err(anyhow::anyhow!("processor rejected error").into()),
            }
        }
    }

    fn machine(threshold: u32) -> OutcomeMachine {
        OutcomeMachine::new(threshold, Duration::from_millis(10), 0)
    }

    #[test]
    fn classifies_completed_runs_as_success() {
        let outcome = classify(Ok(RunStatus::Completed), false, &mut PassthroughProcessor).unwrap();
        assert_eq!(outcome, RunOutcome::Success);
    }

    #[test]
    fn crash_flag_wins_over_run_result() {
        for result in [
            Ok(RunStatus::Completed),
            Err(RunError::from(RunSignal::Halt("stop".into()))),
        ] {
            let outcome = classify(result, true, &mut PassthroughProcessor).unwrap();
            assert_eq!(outcome, RunOutcome::CrashDetected);
        }
    }

    #[test]
    fn signals_map_to_outcomes() {
        let cases = [
            (RunSignal::LogCrash("x".into()), RunOutcome::CrashDetected),
            (RunSignal::abort("timed out"), RunOutcome::AbortRun { is_timeout: true }),
            (RunSignal::abort("bad reply"), RunOutcome::AbortRun { is_timeout: false }),
            (RunSignal::RetryRun("x".into()), RunOutcome::RetryRun),
            (RunSignal::LogAndHalt("x".into()), RunOutcome::HaltWithoutLogging),
            (RunSignal::LogLastAndHalt("x".into()), RunOutcome::HaltWithoutLoggingLast),
            (RunSignal::LogSleepGo("x".into()), RunOutcome::SleepUntilResumed),
            (RunSignal::Halt("x".into()), RunOutcome::Halt),
        ];
        for (signal, expected) in cases {
            let outcome = classify(Err(signal.into()), false, &mut PassthroughProcessor).unwrap();
            assert_eq!(outcome, expected);
        }
    }

    #[test]
    fn transport_errors_go_through_exception_processor() {
        let outcome = classify(
            Err(TransportError::ReceiveTimeout(1).into()),
            false,
            &mut DefaultExceptionProcessor,
        )
        .unwrap();
        assert_eq!(outcome, RunOutcome::AbortRun { is_timeout: true });
    }

    #[test]
    fn ignored_errors_log_and_continue() {
        let outcome = classify(
            Err(anyhow::anyhow!("odd hook error").into()),
            false,
            &mut PassthroughProcessor,
        )
        .unwrap();
        assert_eq!(outcome, RunOutcome::AbortRun { is_timeout: false });
    }

    #[test]
    fn processor_signal_redirects_outcome() {
        let mut processor = Redirect(Some(RunSignal::RetryRun("flaky".into())));
        let outcome = classify(
            Err(TransportError::ConnectionClosed(0).into()),
            false,
            &mut processor,
        )
        .unwrap();
        assert_eq!(outcome, RunOutcome::RetryRun);
    }

    #[test]
    fn processor_raising_plain_error_is_fatal() {
        let mut processor = Redirect(None);
        let result = classify(
            Err(TransportError::ConnectionClosed(0).into()),
            false,
            &mut processor,
        );
        assert!(matches!(result, Err(RunError::Other(_))));
    }

    #[test]
    fn fatal_errors_skip_the_processor() {
        let mut processor = Redirect(Some(RunSignal::RetryRun("never".into())));
        let result = classify(
            Err(MutationError::EmptyCommand.into()),
            false,
            &mut processor,
        );
        assert!(matches!(result, Err(RunError::Mutation(_))));
    }

    #[test]
    fn interrupts_and_spurious_peers_are_their_own_outcomes() {
        let outcome = classify(
            Err(TransportError::Interrupted.into()),
            false,
            &mut PassthroughProcessor,
        )
        .unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        let outcome = classify(
            Ok(RunStatus::SpuriousConnection {
                peer: "10.9.9.9:5000".into(),
            }),
            false,
            &mut PassthroughProcessor,
        )
        .unwrap();
        assert_eq!(outcome, RunOutcome::SpuriousConnection);
    }

    #[test]
    fn crash_below_threshold_retries_same_seed_then_advances() {
        let machine = machine(3);
        let mut state = IterationState::starting_at(42);

        assert_eq!(
            machine.apply(RunOutcome::CrashDetected, 42, &mut state),
            Transition::RepeatAfter(Duration::from_millis(10))
        );
        assert_eq!(state.counter, 42);
        assert_eq!(
            machine.apply(RunOutcome::CrashDetected, 42, &mut state),
            Transition::RepeatAfter(Duration::from_millis(10))
        );
        assert_eq!(state.counter, 42);
        assert_eq!(state.failure_count, 2);

        assert_eq!(
            machine.apply(RunOutcome::CrashDetected, 42, &mut state),
            Transition::CrashConfirmed { run: 42, seed: 42 }
        );
        assert_eq!(state.counter, 43);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn success_clears_failure_streak() {
        let machine = machine(3);
        let mut state = IterationState::starting_at(0);
        machine.apply(RunOutcome::CrashDetected, 0, &mut state);
        assert_eq!(machine.apply(RunOutcome::Success, 0, &mut state), Transition::Next);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.counter, 1);
    }

    #[test]
    fn six_consecutive_timeouts_confirm_hang_with_threshold_two() {
        let machine = machine(2);
        let mut state = IterationState::starting_at(10);

        for seed in 10..15 {
            assert_eq!(
                machine.apply(RunOutcome::AbortRun { is_timeout: true }, seed, &mut state),
                Transition::Next
            );
            assert_eq!(state.counter, seed + 1);
        }
        assert_eq!(state.potential_crash_count, 5);

        let transition = machine.apply(RunOutcome::AbortRun { is_timeout: true }, 15, &mut state);
        assert_eq!(
            transition,
            Transition::HangConfirmed(HangCandidate { run: 10, seed: 10 })
        );
        assert_eq!(state.counter, 11);
        assert!(state.potential_crash.is_none());
        assert_eq!(state.potential_crash_count, 0);
    }

    #[test]
    fn success_breaks_timeout_streak() {
        let machine = machine(2);
        let mut state = IterationState::starting_at(0);
        machine.apply(RunOutcome::AbortRun { is_timeout: true }, 0, &mut state);
        machine.apply(RunOutcome::Success, 1, &mut state);
        assert!(state.potential_crash.is_none());
        machine.apply(RunOutcome::AbortRun { is_timeout: true }, 2, &mut state);
        assert_eq!(
            state.potential_crash,
            Some(HangCandidate { run: 2, seed: 2 })
        );
    }

    #[test]
    fn non_timeout_abort_advances_without_touching_streak() {
        let machine = machine(2);
        let mut state = IterationState::starting_at(5);
        machine.apply(RunOutcome::AbortRun { is_timeout: true }, 5, &mut state);
        assert_eq!(
            machine.apply(RunOutcome::AbortRun { is_timeout: false }, 6, &mut state),
            Transition::Next
        );
        assert_eq!(state.counter, 7);
        assert_eq!(state.potential_crash_count, 1);
    }

    #[test]
    fn retry_leaves_everything_untouched() {
        let machine = machine(2);
        let mut state = IterationState::starting_at(9);
        state.failure_count = 1;
        let before = state.clone();
        assert_eq!(machine.apply(RunOutcome::RetryRun, 9, &mut state), Transition::Repeat);
        assert_eq!(
            machine.apply(RunOutcome::SpuriousConnection, 9, &mut state),
            Transition::Repeat
        );
        assert_eq!(state, before);
    }

    #[test]
    fn halts_stop_and_interrupt_shuts_down() {
        let machine = machine(2);
        let mut state = IterationState::starting_at(1);
        for outcome in [
            RunOutcome::Halt,
            RunOutcome::HaltWithoutLogging,
            RunOutcome::HaltWithoutLoggingLast,
        ] {
            assert_eq!(machine.apply(outcome, 1, &mut state), Transition::Stop);
        }
        assert_eq!(
            machine.apply(RunOutcome::Interrupted, 1, &mut state),
            Transition::Shutdown
        );
    }

    #[test]
    fn resume_only_after_minimum_run() {
        let machine = OutcomeMachine::new(2, Duration::ZERO, 5);
        let mut state = IterationState::starting_at(5);
        assert_eq!(
            machine.apply(RunOutcome::SleepUntilResumed, 5, &mut state),
            Transition::Stop
        );
        state.counter = 6;
        assert_eq!(
            machine.apply(RunOutcome::SleepUntilResumed, 6, &mut state),
            Transition::AwaitResume
        );
    }
}
