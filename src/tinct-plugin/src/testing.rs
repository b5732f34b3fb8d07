//! Scriptable [`ProcessRunner`] for exercising plugin hosts without real
//! executables.
//!
//! ```rust
//! use tinct_plugin::testing::{ScriptedReply, ScriptedRunner};
//!
//! let runner = ScriptedRunner::new()
//!     .on_args(&["--plugin-info"], ScriptedReply::ok(r#"{"name":"random","type":"input"}"#))
//!     .on_args(&[], ScriptedReply::ok(r#"{"colors":[{"r":1,"g":2,"b":3}]}"#));
//! assert_eq!(runner.call_count(), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::PluginError;
use crate::process::{ProcessOutput, ProcessRunner};

/// What a scripted invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReply {
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    delay: Duration,
    hang: bool,
    spawn_error: Option<String>,
}

impl Default for ScriptedReply {
    fn default() -> Self {
        Self::ok("{}")
    }
}

impl ScriptedReply {
    /// Exit 0 with the given stdout.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: Vec::new(),
            delay: Duration::ZERO,
            hang: false,
            spawn_error: None,
        }
    }

    /// Exit with `code` and no output.
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::ok(Vec::new())
        }
    }

    /// Never exits; the call only returns once the caller's context ends.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::ok(Vec::new())
        }
    }

    /// The executable cannot be started.
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Self::ok(Vec::new())
        }
    }

    /// Terminated by a signal, so no exit code.
    pub fn killed() -> Self {
        Self {
            exit_code: None,
            ..Self::ok(Vec::new())
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Waits this long (honouring the context) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One invocation observed by a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl RecordedCall {
    pub fn stdin_json(&self) -> Option<serde_json::Value> {
        self.stdin
            .as_deref()
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }
}

#[derive(Debug, Default)]
struct Script {
    by_args: HashMap<Vec<String>, VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    calls: Vec<RecordedCall>,
}

/// A [`ProcessRunner`] that answers from a script instead of spawning.
///
/// Replies registered for an exact argument list are consumed in order; the
/// last one repeats. Invocations with no matching entry get the default
/// reply, which is `{}` with exit code 0 unless replaced.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_args(self, args: &[&str], reply: ScriptedReply) -> Self {
        self.respond(args, reply);
        self
    }

    pub fn with_default(self, reply: ScriptedReply) -> Self {
        self.lock().fallback = reply;
        self
    }

    /// Queues another reply for `args` on a runner that is already shared.
    pub fn respond(&self, args: &[&str], reply: ScriptedReply) {
        let key = args.iter().map(|arg| arg.to_string()).collect();
        self.lock().by_args.entry(key).or_default().push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Calls whose arguments equal `args`.
    pub fn calls_with_args(&self, args: &[&str]) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.args.iter().map(String::as_str).eq(args.iter().copied()))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_reply(&self, path: &Path, args: &[&str], stdin: Option<Vec<u8>>) -> ScriptedReply {
        let mut script = self.lock();
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let scripted = match script.by_args.get_mut(&args) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        let reply = scripted.unwrap_or_else(|| script.fallback.clone());
        script.calls.push(RecordedCall {
            path: path.to_path_buf(),
            args,
            stdin,
        });
        reply
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        ctx: &CallContext,
        path: &Path,
        args: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<ProcessOutput, PluginError> {
        let reply = self.next_reply(path, args, stdin);

        if let Some(message) = reply.spawn_error {
            return Err(PluginError::Spawn {
                path: path.to_path_buf(),
                source: Arc::new(io::Error::new(io::ErrorKind::NotFound, message)),
            });
        }
        if reply.hang {
            let err = ctx.done().await;
            return Err(PluginError::from_context(err, path, "run"));
        }
        ctx.run(tokio::time::sleep(reply.delay))
            .await
            .map_err(|err| PluginError::from_context(err, path, "run"))?;

        Ok(ProcessOutput {
            exit_code: reply.exit_code,
            stdout: reply.stdout,
            stderr: reply.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_reply_is_empty_object() {
        let runner = ScriptedRunner::new();
        let output = runner
            .run(&CallContext::background(), Path::new("/p"), &[], None)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"{}");
    }

    #[tokio::test]
    async fn replies_are_matched_by_arguments_and_logged() {
        let runner = ScriptedRunner::new()
            .on_args(&["--plugin-info"], ScriptedReply::ok("info"))
            .on_args(&["--pre-execute"], ScriptedReply::exit(1).with_stdout("skip"));
        let ctx = CallContext::background();

        let info = runner
            .run(&ctx, Path::new("/p"), &["--plugin-info"], None)
            .await
            .unwrap();
        assert_eq!(info.stdout, b"info");

        let pre = runner
            .run(&ctx, Path::new("/p"), &["--pre-execute"], None)
            .await
            .unwrap();
        assert_eq!(pre.exit_code, Some(1));

        runner
            .run(&ctx, Path::new("/p"), &[], Some(b"{\"verbose\":true}".to_vec()))
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].args, vec!["--plugin-info".to_string()]);
        assert_eq!(calls[2].stdin_json().unwrap()["verbose"], true);
        assert_eq!(runner.calls_with_args(&[]).len(), 1);
    }

    #[tokio::test]
    async fn queued_replies_are_consumed_then_last_repeats() {
        let runner = ScriptedRunner::new()
            .on_args(&[], ScriptedReply::ok("first"))
            .on_args(&[], ScriptedReply::ok("second"));
        let ctx = CallContext::background();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let output = runner.run(&ctx, Path::new("/p"), &[], None).await.unwrap();
            seen.push(output.stdout_lossy());
        }
        assert_eq!(seen, ["first", "second", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_ends_with_the_context() {
        let runner = ScriptedRunner::new().with_default(ScriptedReply::hang());
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let err = runner
            .run(&ctx, Path::new("/p"), &[], None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_longer_than_deadline_times_out() {
        let runner = ScriptedRunner::new()
            .with_default(ScriptedReply::ok("late").with_delay(Duration::from_secs(2)));
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let err = runner
            .run(&ctx, Path::new("/p"), &[], None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let patient = CallContext::with_timeout(Duration::from_secs(3));
        let output = runner
            .run(&patient, Path::new("/p"), &[], None)
            .await
            .unwrap();
        assert_eq!(output.stdout, b"late");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let runner = ScriptedRunner::new().with_default(ScriptedReply::spawn_failure("gone"));
        let err = runner
            .run(&CallContext::background(), Path::new("/p"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Spawn { .. }));
    }
}
