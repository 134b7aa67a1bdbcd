use crate::mutator::MutationError;
use crate::session::SessionError;
use crate::transport::TransportError;
use thiserror::Error;

/// Control signals a hook or exception processor can raise to steer the fuzz loop.
///
/// Each variant maps to exactly one `RunOutcome`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunSignal {
    /// The target misbehaved; counts against the failure threshold.
    #[error("crash reported: {0}")]
    LogCrash(String),
    /// Give up on this run and move on. Reasons starting with "timed out" feed the
    /// hang detector.
    #[error("run aborted: {reason}")]
    AbortRun { reason: String, timeout: bool },
    /// Run the same seed again without touching any counter.
    #[error("retry requested: {0}")]
    RetryRun(String),
    #[error("halt requested: {0}")]
    LogAndHalt(String),
    #[error("halt requested after last run: {0}")]
    LogLastAndHalt(String),
    /// Block until the monitor reports the target is back, then resume.
    #[error("waiting for target: {0}")]
    LogSleepGo(String),
    #[error("halt: {0}")]
    Halt(String),
}

impl RunSignal {
    /// Builds an abort, flagging it as a timeout when `reason` starts with "timed out".
    pub fn abort(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let timeout = reason.to_ascii_lowercase().starts_with("timed out");
        RunSignal::AbortRun { reason, timeout }
    }
}

/// Everything that can end a run early.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Signal(#[from] RunSignal),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Errors raised by user hooks that are not control signals.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    /// Errors that stop the process instead of being offered to the exception processor.
    pub fn is_fatal(&self) -> bool {
        match self {
            RunError::Mutation(_) | RunError::Session(_) => true,
            RunError::Transport(e) => e.is_fatal(),
            RunError::Signal(_) | RunError::Other(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_detects_timeout_reasons() {
        assert_eq!(
            RunSignal::abort("Timed out waiting for message 2"),
            RunSignal::AbortRun {
                reason: "Timed out waiting for message 2".to_string(),
                timeout: true,
            }
        );
        match RunSignal::abort("peer reset") {
            RunSignal::AbortRun { timeout, .. } => assert!(!timeout),
            other => panic!("Expected AbortRun, got {other:?}"),
        }
    }

    #[test]
    fn fatality_follows_error_source() {
        assert!(RunError::from(MutationError::EmptyCommand).is_fatal());
        assert!(RunError::from(TransportError::UnknownProtocol("x".into())).is_fatal());
        assert!(!RunError::from(TransportError::ConnectionClosed(1)).is_fatal());
        assert!(!RunError::from(RunSignal::Halt("stop".into())).is_fatal());
        assert!(!RunError::from(anyhow::anyhow!("hook blew up")).is_fatal());
    }
}
