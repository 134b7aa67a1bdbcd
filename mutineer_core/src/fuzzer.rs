use crate::executor::Executor;
use crate::findings::{Finding, write_findings};
use crate::hooks::{DefaultExceptionProcessor, ExceptionProcessor};
use crate::monitor::{
    CrashSignal, Monitor, MonitorError, NullMonitor, StopHandle, parse_endpoint_port,
};
use crate::outcome::{OutcomeMachine, Transition, classify};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::session::{FuzzedMessage, Session};
use crate::signal::RunError;
use crate::state::IterationState;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

const SLEEP_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Longest single pause; longer sleeps and failure delays are clamped to it.
const MAX_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum FuzzError {
    /// The summary holds everything confirmed before the error.
    #[error("Fatal error on seed {seed}: {source}")]
    Fatal {
        seed: u64,
        #[source]
        source: RunError,
        summary: Box<FuzzSummary>,
    },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The run range was exhausted.
    #[default]
    Exhausted,
    /// A halt signal ended the loop.
    Halted,
    /// The operator asked to stop.
    Interrupted,
    /// The single dump/emulate case finished.
    SingleCase,
    /// An error the exception processor could not handle.
    Fatal,
}

#[derive(Debug, Clone, Default)]
pub struct FuzzSummary {
    /// Run attempts, retries included.
    pub attempts: u64,
    /// Run counter when the loop stopped.
    pub last_run: u64,
    pub findings: Vec<Finding>,
    pub stop_reason: StopReason,
    /// Last mutated message, for exporting a reproducible session.
    pub last_fuzzed: Option<FuzzedMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Pause before every run.
    pub sleep_time: Duration,
    /// Wrap the loop in monitor harness-trace start/stop calls.
    pub harness_trace: bool,
    /// When set, `findings.json` in this directory is rewritten after every
    /// confirmed finding.
    pub findings_dir: Option<PathBuf>,
}

/// The single-threaded driver: schedule, run, classify, apply, repeat.
pub struct FuzzLoop {
    executor: Box<dyn Executor>,
    scheduler: Scheduler,
    exceptions: Box<dyn ExceptionProcessor>,
    monitor: Box<dyn Monitor>,
    options: LoopOptions,
    stop: StopHandle,
}

impl FuzzLoop {
    pub fn new(executor: Box<dyn Executor>, scheduler: Scheduler) -> Self {
        Self {
            executor,
            scheduler,
            exceptions: Box::new(DefaultExceptionProcessor),
            monitor: Box::new(NullMonitor::default()),
            options: LoopOptions::default(),
            stop: StopHandle::new(),
        }
    }

    pub fn with_exception_processor(mut self, exceptions: Box<dyn ExceptionProcessor>) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn with_monitor(mut self, monitor: Box<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Fuzzes `session` until the run range is exhausted, a halt signal arrives,
    /// or the operator interrupts. The executor is shut down on every path.
    pub fn run(&mut self, session: &mut Session) -> Result<FuzzSummary, FuzzError> {
        let result = self.traced(session);
        self.executor.shutdown();
        result
    }

    fn traced(&mut self, session: &mut Session) -> Result<FuzzSummary, FuzzError> {
        self.scheduler.prepare(session)?;
        tracing::info!(
            mode = ?self.scheduler.mode(),
            bounds = ?self.scheduler.bounds(),
            targets = session.targets().len(),
            "starting fuzz loop"
        );
        if self.options.harness_trace {
            self.monitor.start_trace()?;
        }

        let result = self.drive(session);

        if self.options.harness_trace {
            if let Err(e) = self.monitor.stop_trace() {
                tracing::warn!(error = %e, "failed to stop harness trace");
            }
        }
        result
    }

    fn drive(&mut self, session: &mut Session) -> Result<FuzzSummary, FuzzError> {
        let machine = OutcomeMachine::new(
            session.failure_threshold,
            session.failure_timeout,
            self.scheduler.bounds().min,
        );
        let crash_signal = self.monitor.crash_signal();
        let mut state = self.scheduler.initial_state();
        let mut summary = FuzzSummary::default();

        let stop_reason = loop {
            if self.scheduler.is_exhausted(&state) {
                break StopReason::Exhausted;
            }
            if !self.options.sleep_time.is_zero() {
                tracing::debug!("sleeping for {:?}", self.options.sleep_time);
                self.sleep(self.options.sleep_time);
            }
            if self.interrupted(&crash_signal) {
                break StopReason::Interrupted;
            }

            let iteration = self.scheduler.next(&mut state, session)?;
            tracing::info!(
                run = iteration.run,
                seed = iteration.seed,
                target = ?iteration.target,
                "fuzzing"
            );
            summary.attempts += 1;
            let result = self.executor.perform_run(session, Some(iteration.seed));

            let crashed = crash_signal.take();
            if crashed {
                tracing::warn!(seed = iteration.seed, "crash event detected");
                self.await_target(session);
            }

            let outcome = match classify(result, crashed, self.exceptions.as_mut()) {
                Ok(outcome) => outcome,
                Err(source) => {
                    summary.stop_reason = StopReason::Fatal;
                    self.close_summary(&mut summary, &state);
                    return Err(FuzzError::Fatal {
                        seed: iteration.seed,
                        source,
                        summary: Box::new(summary),
                    });
                }
            };
            let transition = machine.apply(outcome, iteration.seed, &mut state);
            tracing::debug!(?outcome, ?transition, "run finished");

            match transition {
                Transition::Next | Transition::Repeat => {}
                Transition::RepeatAfter(delay) => self.sleep(delay),
                Transition::CrashConfirmed { run, seed } => {
                    let finding = Finding::crash(run, seed, self.executor.last_fuzzed());
                    tracing::warn!(run, seed, "logged crash");
                    self.record(&mut summary, finding);
                }
                Transition::HangConfirmed(candidate) => {
                    tracing::warn!(run = candidate.run, seed = candidate.seed, "logged hang");
                    self.record(&mut summary, Finding::hang(candidate));
                }
                Transition::AwaitResume => {
                    tracing::warn!("locking execution until the monitor reports the target is back");
                    self.await_target(session);
                }
                Transition::Stop => break StopReason::Halted,
                Transition::Shutdown => break StopReason::Interrupted,
            }

            if self.scheduler.is_single() && transition != Transition::Repeat {
                break StopReason::SingleCase;
            }
        };

        summary.stop_reason = stop_reason;
        self.close_summary(&mut summary, &state);
        tracing::info!(
            attempts = summary.attempts,
            findings = summary.findings.len(),
            reason = ?summary.stop_reason,
            "fuzz loop stopped"
        );
        Ok(summary)
    }

    fn close_summary(&self, summary: &mut FuzzSummary, state: &IterationState) {
        summary.last_run = state.counter;
        summary.last_fuzzed = self.executor.last_fuzzed().cloned();
    }

    fn record(&self, summary: &mut FuzzSummary, finding: Finding) {
        summary.findings.push(finding);
        let Some(dir) = &self.options.findings_dir else {
            return;
        };
        match write_findings(dir, &summary.findings) {
            Ok(path) => tracing::debug!(path = %path.display(), "findings updated"),
            Err(e) => tracing::warn!(error = %e, "failed to persist findings"),
        }
    }

    /// An operator stop only counts when the monitor is not mid-crash.
    fn interrupted(&self, crash_signal: &CrashSignal) -> bool {
        self.stop.is_stop_requested() && !crash_signal.is_raised()
    }

    /// Blocks on the monitor and adopts the port it reports.
    fn await_target(&mut self, session: &mut Session) {
        match self
            .monitor
            .lock_execution()
            .and_then(|endpoint| parse_endpoint_port(&endpoint).map(|port| (endpoint, port)))
        {
            Ok((endpoint, port)) => {
                tracing::info!(%endpoint, "resuming fuzzing");
                session.port = port;
            }
            Err(e) => tracing::warn!(monitor = self.monitor.name(), error = %e, "monitor unavailable"),
        }
    }

    fn sleep(&self, duration: Duration) {
        if duration > MAX_SLEEP {
            tracing::warn!("clamping sleep of {duration:?} to {MAX_SLEEP:?}");
        }
        let start = Instant::now();
        let deadline = start.checked_add(duration.min(MAX_SLEEP)).unwrap_or(start);
        while !self.stop.is_stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SLEEP_POLL_INTERVAL));
        }
    }
}
