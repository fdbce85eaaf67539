//! The task executor seam.
//!
//! The dispatcher only knows that something turns a source locator into
//! artifact metadata plus a storage location. [`CommandExecutor`] does that by
//! running an external program; tests plug in closures via [`FnExecutor`].

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use jobrelay_core::ExecutionOutput;

/// Opaque executor failure. The text ends up in the job's `error_message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Runs one unit of work to completion.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, source_locator: &str) -> Result<ExecutionOutput, ExecutionError>;
}

#[async_trait]
impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    async fn execute(&self, source_locator: &str) -> Result<ExecutionOutput, ExecutionError> {
        (**self).execute(source_locator).await
    }
}

/// Adapts an async closure into an [`Executor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for FnExecutor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnExecutor")
    }
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send,
{
    async fn execute(&self, source_locator: &str) -> Result<ExecutionOutput, ExecutionError> {
        (self.f)(source_locator.to_string()).await
    }
}

/// Runs `program args… <source_locator>` and reads an [`ExecutionOutput`]
/// as JSON from its stdout.
///
/// A non-zero exit is a failure carrying stderr (or the exit code when stderr
/// is empty).
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn parse_output(output: std::process::Output) -> Result<ExecutionOutput, ExecutionError> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecutionError(if stderr.is_empty() {
                format!("exit code: {:?}", output.status.code())
            } else {
                stderr
            }));
        }

        let parsed: ExecutionOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| ExecutionError(format!("invalid executor output: {e}")))?;
        if parsed.result_locator.trim().is_empty() {
            return Err(ExecutionError::new("executor returned an empty result locator"));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, source_locator: &str) -> Result<ExecutionOutput, ExecutionError> {
        debug!(program = %self.program, source_locator, "running executor");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(source_locator)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                warn!(program = %self.program, error = %e, "failed to spawn executor");
                ExecutionError(format!("failed to run {}: {e}", self.program))
            })?;

        Self::parse_output(output)
    }
}
