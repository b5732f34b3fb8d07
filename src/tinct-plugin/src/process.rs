//! Running a plugin executable to completion.
//!
//! [`ProcessRunner`] is the seam the single-shot transport and the protocol
//! detector spawn processes through. [`RealProcessRunner`] backs it with
//! `tokio::process`; tests substitute [`crate::testing::ScriptedRunner`].

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::PluginError;

const PROCESS_TARGET: &str = "tinct_plugin::process";

/// Captured result of one process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs an executable with arguments and optional stdin, capturing stdout,
/// stderr and the exit code.
///
/// A non-zero exit is reported through [`ProcessOutput::exit_code`], never as
/// an error. Implementations must stop waiting and release the process as
/// soon as `ctx` ends, returning the matching `Cancelled` or
/// `DeadlineExceeded` error.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        ctx: &CallContext,
        path: &Path,
        args: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<ProcessOutput, PluginError>;
}

#[async_trait]
impl<R: ProcessRunner + ?Sized> ProcessRunner for Arc<R> {
    async fn run(
        &self,
        ctx: &CallContext,
        path: &Path,
        args: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<ProcessOutput, PluginError> {
        (**self).run(ctx, path, args, stdin).await
    }
}

/// [`ProcessRunner`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealProcessRunner;

#[async_trait]
impl ProcessRunner for RealProcessRunner {
    async fn run(
        &self,
        ctx: &CallContext,
        path: &Path,
        args: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<ProcessOutput, PluginError> {
        if let Some(err) = ctx.error() {
            return Err(PluginError::from_context(err, path, "run"));
        }

        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            target: PROCESS_TARGET,
            plugin = %path.display(),
            ?args,
            stdin_bytes = stdin.as_ref().map_or(0, Vec::len),
            "spawning plugin process"
        );

        let mut child = command.spawn().map_err(|source| PluginError::Spawn {
            path: path.to_path_buf(),
            source: Arc::new(source),
        })?;
        let pipe = child.stdin.take();

        // Dropping this future drops the child, and kill_on_drop reaps it.
        let work = async move {
            let (written, waited) =
                tokio::join!(feed_stdin(pipe, stdin), child.wait_with_output());
            written?;
            waited
        };

        match ctx.run(work).await {
            Ok(Ok(output)) => {
                debug!(
                    target: PROCESS_TARGET,
                    plugin = %path.display(),
                    exit_code = ?output.status.code(),
                    stdout_bytes = output.stdout.len(),
                    stderr_bytes = output.stderr.len(),
                    "plugin process exited"
                );
                Ok(ProcessOutput {
                    exit_code: output.status.code(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Ok(Err(source)) => Err(PluginError::io(path, source)),
            Err(err) => {
                warn!(
                    target: PROCESS_TARGET,
                    plugin = %path.display(),
                    reason = %err,
                    "killed plugin process before it exited"
                );
                Err(PluginError::from_context(err, path, "run"))
            }
        }
    }
}

/// Writes the payload and closes the pipe. A plugin that exits without
/// reading its input is not an error.
async fn feed_stdin(pipe: Option<ChildStdin>, payload: Option<Vec<u8>>) -> std::io::Result<()> {
    let (Some(mut pipe), Some(payload)) = (pipe, payload) else {
        return Ok(());
    };
    let result = async {
        pipe.write_all(&payload).await?;
        pipe.shutdown().await
    }
    .await;
    match result {
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}
