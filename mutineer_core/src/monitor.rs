use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitor failed to lock execution: {0}")]
    Lock(String),
    #[error("Monitor returned malformed endpoint '{0}', expected 'host:port'")]
    MalformedEndpoint(String),
    #[error("Harness trace failed: {0}")]
    Trace(String),
}

/// Shared crash flag, raised asynchronously by a monitor and consumed by the fuzz loop.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CrashSignal(Arc<AtomicBool>);

impl CrashSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the target as crashed. Safe to call from any thread.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Operator interrupt flag, set from a signal handler and polled by blocking loops.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A `Monitor` watches the target out-of-band (a debugger, a process watcher, a
/// health probe) and reports crashes the network traffic alone cannot reveal.
///
/// The fuzz loop checks [`Monitor::crash_signal`] after every run. When it is
/// raised, the loop calls [`Monitor::lock_execution`], which blocks until the
/// target is back up and returns its (possibly new) `host:port` endpoint.
pub trait Monitor: Send {
    /// Returns a static string name identifying the monitor.
    fn name(&self) -> &'static str;

    /// The flag this monitor raises when it observes a crash.
    fn crash_signal(&self) -> CrashSignal;

    /// Blocks until the target has been restarted.
    ///
    /// # Returns
    /// The endpoint the target now listens on, as `host:port`.
    fn lock_execution(&mut self) -> Result<String, MonitorError>;

    /// Starts a harness trace for the upcoming run. Only called when tracing is enabled.
    fn start_trace(&mut self) -> Result<(), MonitorError> {
        Ok(())
    }

    /// Stops the harness trace started for the finished run.
    fn stop_trace(&mut self) -> Result<(), MonitorError> {
        Ok(())
    }
}

/// Extracts the port from a `host:port` endpoint. IPv6 hosts may be bracketed.
pub fn parse_endpoint_port(endpoint: &str) -> Result<u16, MonitorError> {
    endpoint
        .rsplit_once(':')
        .and_then(|(_, port)| port.trim().parse::<u16>().ok())
        .ok_or_else(|| MonitorError::MalformedEndpoint(endpoint.to_string()))
}

/// A `NullMonitor` never raises its crash flag on its own.
///
/// Its endpoint is fixed at construction and returned unchanged by `lock_execution`.
#[derive(Debug, Clone, Default)]
pub struct NullMonitor {
    signal: CrashSignal,
    endpoint: String,
}

impl NullMonitor {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            signal: CrashSignal::new(),
            endpoint: format!("{host}:{port}"),
        }
    }
}

impl Monitor for NullMonitor {
    fn name(&self) -> &'static str {
        "NullMonitor"
    }

    fn crash_signal(&self) -> CrashSignal {
        self.signal.clone()
    }

    fn lock_execution(&mut self) -> Result<String, MonitorError> {
        Ok(self.endpoint.clone())
    }
}
