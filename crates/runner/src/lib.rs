//! Test orchestration: configuration, server supervision, the worker pool
//! and result reporting.

pub mod config;
pub mod error;
pub mod events;
pub mod reporter;
pub mod result;
pub mod scheduler;
pub mod server;
pub mod test_runner;
pub mod worker;

pub use config::TesterConfig;
pub use error::RunnerError;
pub use events::{EventBus, RunnerEvent, WorkerEvents};
pub use reporter::Reporter;
pub use result::{TestResult, TestStatus, TestSuitesResult};
pub use scheduler::{collect_tests, Scheduler};
pub use test_runner::{run_test_file, TestEntry};
