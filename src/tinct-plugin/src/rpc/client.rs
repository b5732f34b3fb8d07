//! Host side of the RPC transport.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tinct_core::PluginSettings;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use super::{decode_files, methods, DispenseParams, Request, Response, Service};
use crate::context::CallContext;
use crate::error::PluginError;
use crate::handshake::{HandshakeLine, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use crate::protocol::{
    FlagHelp, GeneratedFiles, InputOptions, PaletteData, PluginInfo, PreExecuteOutcome,
    RgbColour, WrittenFiles,
};

const RPC_TARGET: &str = "tinct_plugin::rpc";

/// How long a graceful shutdown may take before the process is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// An open connection to an RPC plugin.
///
/// Calls are strictly sequential. If a call fails in a way that leaves the
/// stream out of step (the context ended mid-call, the plugin hung up, or it
/// sent something unreadable) the connection is poisoned: the process is
/// killed and every later call fails fast.
pub struct RpcConnection {
    path: PathBuf,
    child: Option<Child>,
    reader: Reader,
    writer: Writer,
    next_id: u64,
    dispensed: HashSet<Service>,
    poisoned: bool,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("path", &self.path)
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .field("next_id", &self.next_id)
            .field("dispensed", &self.dispensed)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl RpcConnection {
    /// Launches the plugin at `path` and completes the handshake.
    pub async fn spawn(
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
    ) -> Result<Self, PluginError> {
        if let Some(err) = ctx.error() {
            return Err(PluginError::from_context(err, path, "spawn"));
        }

        let mut command = Command::new(path);
        command
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(target: RPC_TARGET, plugin = %path.display(), "spawning RPC plugin");
        let mut child = command.spawn().map_err(|source| PluginError::Spawn {
            path: path.to_path_buf(),
            source: Arc::new(source),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PluginError::transport(path, "plugin process has no stdio pipes"));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(
                path.to_path_buf(),
                stderr,
                settings.forward_stderr,
            ));
        }

        let mut connection = Self::new(path, Box::new(stdout), Box::new(stdin));
        connection.child = Some(child);
        connection
            .handshake(ctx, settings.handshake_timeout())
            .await?;
        Ok(connection)
    }

    /// Completes the handshake over already-connected streams.
    pub async fn from_streams<R, W>(
        ctx: &CallContext,
        path: impl Into<PathBuf>,
        reader: R,
        writer: W,
        settings: &PluginSettings,
    ) -> Result<Self, PluginError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let path = path.into();
        let mut connection = Self::new(&path, Box::new(reader), Box::new(writer));
        connection
            .handshake(ctx, settings.handshake_timeout())
            .await?;
        Ok(connection)
    }

    fn new(path: &Path, reader: Box<dyn AsyncRead + Send + Unpin>, writer: Writer) -> Self {
        Self {
            path: path.to_path_buf(),
            child: None,
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
            dispensed: HashSet::new(),
            poisoned: false,
        }
    }

    async fn handshake(&mut self, ctx: &CallContext, timeout: Duration) -> Result<(), PluginError> {
        let bounded = ctx.with_timeout_inside(timeout);
        let mut line = String::new();
        let outcome = bounded.run(self.reader.read_line(&mut line)).await;

        let result = match outcome {
            Ok(Ok(0)) => Err("plugin exited before completing the handshake".to_string()),
            Ok(Ok(_)) => HandshakeLine::parse(&line).and_then(|parsed| parsed.validate()),
            Ok(Err(err)) => Err(format!("failed to read handshake line: {err}")),
            Err(err) => {
                if let Some(outer) = ctx.error() {
                    self.poison("context ended during handshake");
                    return Err(PluginError::from_context(outer, &self.path, "handshake"));
                }
                debug!(target: RPC_TARGET, reason = %err, "handshake wait ended");
                Err(format!(
                    "no handshake line within {}s",
                    timeout.as_secs_f64()
                ))
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    target: RPC_TARGET,
                    plugin = %self.path.display(),
                    handshake = line.trim_end(),
                    "RPC handshake complete"
                );
                Ok(())
            }
            Err(message) => {
                self.poison("handshake failed");
                Err(PluginError::Handshake {
                    path: self.path.clone(),
                    message,
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False once the connection has been poisoned or shut down.
    pub fn is_usable(&self) -> bool {
        !self.poisoned
    }

    /// Sends one request and decodes the result as `T`.
    ///
    /// A `()` params value is sent as a request without params.
    pub async fn call<T, P>(
        &mut self,
        ctx: &CallContext,
        method: &'static str,
        params: P,
    ) -> Result<T, PluginError>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        if self.poisoned {
            return Err(PluginError::transport(
                &self.path,
                "connection is closed after an earlier failure",
            ));
        }
        // Nothing has been written yet, so the stream is still in step.
        if let Some(err) = ctx.error() {
            return Err(PluginError::from_context(err, &self.path, method));
        }

        let params = serde_json::to_value(params).map_err(PluginError::Serialize)?;
        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            method: method.to_string(),
            params: (!params.is_null()).then_some(params),
        };
        let mut line = serde_json::to_string(&request).map_err(PluginError::Serialize)?;
        line.push('\n');

        debug!(
            target: RPC_TARGET,
            plugin = %self.path.display(),
            method,
            id,
            "sending RPC request"
        );

        let reply = match ctx.run(self.exchange(line)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                self.poison("transport failure");
                return Err(err);
            }
            Err(err) => {
                self.poison("context ended mid-call");
                return Err(PluginError::from_context(err, &self.path, method));
            }
        };

        let response: Response = match serde_json::from_str(&reply) {
            Ok(response) => response,
            Err(err) => {
                self.poison("unreadable response");
                return Err(PluginError::transport(
                    &self.path,
                    format!("invalid response to {method}: {err}"),
                ));
            }
        };
        if response.id != id {
            self.poison("response id mismatch");
            return Err(PluginError::transport(
                &self.path,
                format!("response id mismatch: sent {id}, received {}", response.id),
            ));
        }

        if let Some(error) = response.error {
            return Err(PluginError::PluginReported {
                path: self.path.clone(),
                operation: method,
                message: error.message,
                exit_code: None,
                stderr: String::new(),
            });
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result.clone()).map_err(|err| PluginError::Parse {
            path: self.path.clone(),
            message: format!("unexpected result for {method}: {err}"),
            output: result.to_string(),
        })
    }

    async fn exchange(&mut self, line: String) -> Result<String, PluginError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| PluginError::io(&self.path, err))?;
        self.writer
            .flush()
            .await
            .map_err(|err| PluginError::io(&self.path, err))?;

        let mut reply = String::new();
        let read = self
            .reader
            .read_line(&mut reply)
            .await
            .map_err(|err| PluginError::io(&self.path, err))?;
        if read == 0 {
            return Err(PluginError::transport(
                &self.path,
                "plugin closed the connection",
            ));
        }
        Ok(reply)
    }

    /// Asks the plugin to provide `service`. Each service is requested at
    /// most once per connection.
    pub async fn dispense(
        &mut self,
        ctx: &CallContext,
        service: Service,
    ) -> Result<(), PluginError> {
        if self.dispensed.contains(&service) {
            return Ok(());
        }
        match self
            .call::<Value, _>(ctx, methods::DISPENSE, DispenseParams { service })
            .await
        {
            Ok(_) => {
                self.dispensed.insert(service);
                Ok(())
            }
            Err(PluginError::PluginReported { message, .. }) => {
                Err(PluginError::ServiceUnavailable {
                    path: self.path.clone(),
                    service: service.as_str(),
                    message,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn input(&mut self, ctx: &CallContext) -> Result<InputClient<'_>, PluginError> {
        self.dispense(ctx, Service::Input).await?;
        Ok(InputClient { connection: self })
    }

    pub async fn output(&mut self, ctx: &CallContext) -> Result<OutputClient<'_>, PluginError> {
        self.dispense(ctx, Service::Output).await?;
        Ok(OutputClient { connection: self })
    }

    /// Asks the plugin to exit, then makes sure it has. Never fails.
    pub async fn shutdown(&mut self) {
        if !self.poisoned {
            let ctx = CallContext::with_timeout(SHUTDOWN_GRACE);
            if let Err(err) = self.call::<Value, _>(&ctx, methods::SHUTDOWN, ()).await {
                debug!(
                    target: RPC_TARGET,
                    plugin = %self.path.display(),
                    error = %err,
                    "shutdown request failed"
                );
            }
            self.poisoned = true;
        }
        let _ = self.writer.shutdown().await;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(
                        target: RPC_TARGET,
                        plugin = %self.path.display(),
                        %status,
                        "RPC plugin exited"
                    );
                }
                _ => {
                    warn!(
                        target: RPC_TARGET,
                        plugin = %self.path.display(),
                        "RPC plugin did not exit, killing it"
                    );
                    if let Err(err) = child.kill().await {
                        debug!(target: RPC_TARGET, error = %err, "kill failed");
                    }
                }
            }
        }
    }

    fn poison(&mut self, reason: &str) {
        if !self.poisoned {
            warn!(
                target: RPC_TARGET,
                plugin = %self.path.display(),
                reason,
                "discarding RPC connection"
            );
        }
        self.poisoned = true;
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

async fn drain_stderr(path: PathBuf, stderr: ChildStderr, forward: bool) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if forward {
            info!(target: RPC_TARGET, plugin = %path.display(), "{line}");
        } else {
            debug!(target: RPC_TARGET, plugin = %path.display(), "{line}");
        }
    }
}

/// Typed calls against a dispensed input service.
#[derive(Debug)]
pub struct InputClient<'a> {
    connection: &'a mut RpcConnection,
}

impl InputClient<'_> {
    pub async fn generate(
        &mut self,
        ctx: &CallContext,
        options: &InputOptions,
    ) -> Result<Vec<RgbColour>, PluginError> {
        self.connection
            .call(ctx, methods::INPUT_GENERATE, options)
            .await
    }

    pub async fn metadata(&mut self, ctx: &CallContext) -> Result<PluginInfo, PluginError> {
        self.connection.call(ctx, methods::GET_METADATA, ()).await
    }

    /// `None` when the plugin did not use a wallpaper.
    pub async fn wallpaper_path(
        &mut self,
        ctx: &CallContext,
    ) -> Result<Option<String>, PluginError> {
        let path: String = self
            .connection
            .call(ctx, methods::INPUT_WALLPAPER_PATH, ())
            .await?;
        Ok((!path.is_empty()).then_some(path))
    }

    pub async fn flag_help(&mut self, ctx: &CallContext) -> Result<Vec<FlagHelp>, PluginError> {
        self.connection.call(ctx, methods::GET_FLAG_HELP, ()).await
    }
}

/// Typed calls against a dispensed output service.
#[derive(Debug)]
pub struct OutputClient<'a> {
    connection: &'a mut RpcConnection,
}

impl OutputClient<'_> {
    pub async fn generate(
        &mut self,
        ctx: &CallContext,
        palette: &PaletteData,
    ) -> Result<GeneratedFiles, PluginError> {
        let encoded: BTreeMap<String, String> = self
            .connection
            .call(ctx, methods::OUTPUT_GENERATE, palette)
            .await?;
        let raw = serde_json::to_string(&encoded).unwrap_or_default();
        decode_files(encoded).map_err(|message| PluginError::Parse {
            path: self.connection.path.clone(),
            message,
            output: raw,
        })
    }

    pub async fn metadata(&mut self, ctx: &CallContext) -> Result<PluginInfo, PluginError> {
        self.connection.call(ctx, methods::GET_METADATA, ()).await
    }

    pub async fn pre_execute(
        &mut self,
        ctx: &CallContext,
    ) -> Result<PreExecuteOutcome, PluginError> {
        self.connection
            .call(ctx, methods::OUTPUT_PRE_EXECUTE, ())
            .await
    }

    pub async fn post_execute(
        &mut self,
        ctx: &CallContext,
        written_files: &[String],
    ) -> Result<(), PluginError> {
        let params = WrittenFiles {
            written_files: written_files.to_vec(),
        };
        self.connection
            .call::<Value, _>(ctx, methods::OUTPUT_POST_EXECUTE, params)
            .await
            .map(|_| ())
    }

    pub async fn flag_help(&mut self, ctx: &CallContext) -> Result<Vec<FlagHelp>, PluginError> {
        self.connection.call(ctx, methods::GET_FLAG_HELP, ()).await
    }
}
