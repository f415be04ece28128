//! Transport-polymorphic command execution.
//!
//! [`Executor`] is implemented once per transport. Everything that does not
//! depend on the transport (timeouts, transcript logging, log tailing,
//! error policy) lives in [`driver`] and is shared by both.

pub mod driver;
pub mod http;
pub mod stdio;

use async_trait::async_trait;
use grntest_core::{Command, Interface};
use tokio::process::Child;

use crate::context::ExecutionContext;
use crate::error::ExecutorError;

pub use driver::execute_command;
pub use http::HttpExecutor;
pub use stdio::StandardIoExecutor;

#[async_trait]
pub trait Executor: Send {
    fn interface(&self) -> Interface;

    /// Send one command and return the raw response body.
    async fn send_command(
        &mut self,
        command: &Command,
        ctx: &ExecutionContext,
    ) -> Result<Vec<u8>, ExecutorError>;

    /// An executor for an included script, bound to the same server.
    fn create_sub_executor(&self) -> Box<dyn Executor>;

    /// Block until the server answers `status`.
    async fn ensure_ready(&mut self, ctx: &mut ExecutionContext) -> Result<(), ExecutorError> {
        driver::ensure_ready(self, ctx).await
    }

    /// Ask the server to exit and wait for the process. Returns `false`
    /// when the caller has to force termination.
    async fn shutdown(
        &mut self,
        ctx: &mut ExecutionContext,
        process: Option<&mut Child>,
    ) -> Result<bool, ExecutorError> {
        driver::shutdown(self, ctx, process).await
    }
}
