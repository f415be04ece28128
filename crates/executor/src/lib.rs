//! Talking to a running server: the execution context, transports,
//! executors and the script interpreter that drives them.

#[cfg(feature = "apache-arrow")]
pub mod arrow;
pub mod context;
pub mod error;
pub mod executor;
pub mod interpreter;
pub mod log_tail;
pub mod transport;

pub use context::ExecutionContext;
pub use error::{ExecutorError, Halt, TransportError};
pub use executor::{Executor, HttpExecutor, StandardIoExecutor};
pub use interpreter::{run_script, run_test, RunOutcome};
