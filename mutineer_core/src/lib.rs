pub mod config;
pub mod executor;
pub mod findings;
pub mod fuzzer;
pub mod hooks;
pub mod monitor;
pub mod mutator;
pub mod outcome;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod state;
pub mod transport;

pub use config::{MutineerConfig, SessionFile};
pub use executor::{Executor, ExecutorOptions, NetworkExecutor, RunStatus};
pub use findings::{Finding, FindingKind};
pub use fuzzer::{FuzzError, FuzzLoop, FuzzSummary, LoopOptions, StopReason};
pub use hooks::{
    DefaultExceptionProcessor, ExceptionProcessor, MessageProcessor, PassthroughProcessor,
};
pub use monitor::{CrashSignal, Monitor, MonitorError, NullMonitor, StopHandle};
pub use mutator::{ByteFlipEngine, CommandEngine, MutationEngine, MutationError, MutationGateway};
pub use outcome::{OutcomeMachine, RunOutcome, Transition, classify};
pub use scheduler::{Iteration, RunBounds, ScheduleMode, Scheduler, SchedulerError};
pub use session::{Direction, FuzzIndex, FuzzedMessage, Message, Session, SessionError, Subcomponent};
pub use signal::{RunError, RunSignal};
pub use state::IterationState;
pub use transport::{AddressFamily, Connection, Protocol, Transport, TransportError};
