use crate::signal::{RunError, RunSignal};
use crate::transport::TransportError;

/// User-supplied hooks that see and may rewrite message bytes at fixed points of a run.
///
/// Every method defaults to the identity transform, so an implementation only
/// overrides the points it cares about. Any hook may return a `RunSignal` (via
/// `RunError::Signal`) to steer the fuzz loop.
///
/// Within one outbound message the call order is always:
/// `pre_fuzz`/`pre_fuzz_subcomponent` → mutation → `pre_send_subcomponent` → `pre_send`.
pub trait MessageProcessor: Send {
    /// Called before each connection attempt. `seed` is `None` for unmutated runs.
    fn pre_connect(&mut self, _seed: Option<u64>, _host: &str, _port: u16) -> Result<(), RunError> {
        Ok(())
    }

    /// Whole-message hook for fuzzed single-region messages, before mutation.
    fn pre_fuzz(&mut self, bytes: Vec<u8>) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    /// Per-region hook for fuzzed multi-region messages, before mutation.
    ///
    /// `siblings` holds the current bytes of every region of the message, in order.
    fn pre_fuzz_subcomponent(
        &mut self,
        bytes: Vec<u8>,
        _siblings: &[Vec<u8>],
    ) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    /// Per-region hook for fuzzed multi-region messages, after mutation.
    fn pre_send_subcomponent(
        &mut self,
        bytes: Vec<u8>,
        _siblings: &[Vec<u8>],
    ) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    /// Final hook on the assembled bytes of every outbound message.
    fn pre_send(&mut self, bytes: Vec<u8>) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    /// Called with each received response and the bytes the session expected.
    fn post_receive(
        &mut self,
        _received: &[u8],
        _expected: &[u8],
        _message: usize,
    ) -> Result<(), RunError> {
        Ok(())
    }
}

/// Last chance to classify an error the run raised.
///
/// Returning `Ok(())` means the error is ignored and the loop moves on. Returning a
/// `RunError::Signal` redirects the outcome; any other error is fatal.
pub trait ExceptionProcessor: Send {
    fn process_exception(&mut self, error: &RunError) -> Result<(), RunError>;
}

/// Identity message processor that ignores every exception.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

impl MessageProcessor for PassthroughProcessor {}

impl ExceptionProcessor for PassthroughProcessor {
    fn process_exception(&mut self, _error: &RunError) -> Result<(), RunError> {
        Ok(())
    }
}

/// Maps socket errors onto control signals.
///
/// A refused connection halts after logging the last case, a receive timeout
/// aborts as a timeout, and any other socket failure aborts the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExceptionProcessor;

impl ExceptionProcessor for DefaultExceptionProcessor {
    fn process_exception(&mut self, error: &RunError) -> Result<(), RunError> {
        let RunError::Transport(transport) = error else {
            tracing::debug!(%error, "ignoring unclassified run error");
            return Ok(());
        };
        let signal = if transport.is_connection_refused() {
            RunSignal::LogLastAndHalt(format!("Connection refused: {transport}"))
        } else {
            match transport {
                TransportError::ReceiveTimeout(_) => RunSignal::abort(transport.to_string()),
                TransportError::ConnectionClosed(_) => {
                    RunSignal::abort(format!("Server closed the connection: {transport}"))
                }
                TransportError::Connect { .. }
                | TransportError::Send(_)
                | TransportError::Receive(_)
                | TransportError::Accept(_) => {
                    RunSignal::abort(format!("Socket error: {transport}"))
                }
                _ => {
                    tracing::debug!(%transport, "ignoring transport error");
                    return Ok(());
                }
            }
        };
        Err(signal.into())
    }
}
