//! One interface over both plugin transports.
//!
//! A [`PluginExecutor`] is bound to a single plugin executable. It detects
//! the plugin's transport once, at construction, and routes every operation
//! through it for the rest of its life.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tinct_core::PluginSettings;
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::detect::detect_with;
use crate::error::PluginError;
use crate::json_stdio::JsonStdioTransport;
use crate::process::{ProcessRunner, RealProcessRunner};
use crate::protocol::{
    FlagHelp, GeneratedFiles, InputOptions, PaletteData, PluginInfo, PluginKind,
    PreExecuteOutcome, RgbColour, Transport,
};
use crate::rpc::{RpcConnection, Service};
use crate::version::{check_compatibility, VersionError};

const EXECUTOR_TARGET: &str = "tinct_plugin::executor";

/// Configures and builds a [`PluginExecutor`].
pub struct PluginExecutorBuilder {
    path: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    settings: PluginSettings,
    verbose: bool,
}

impl PluginExecutorBuilder {
    /// Process runner used for detection and JSON-stdio calls.
    pub fn runner<R: ProcessRunner + 'static>(mut self, runner: R) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn settings(mut self, settings: PluginSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Relay the plugin's stderr into the log at info level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Detects the plugin's transport and checks its protocol version.
    pub async fn build(self) -> Result<PluginExecutor, PluginError> {
        let Self {
            path,
            runner,
            mut settings,
            verbose,
        } = self;
        settings.forward_stderr |= verbose;

        let ctx = CallContext::with_timeout(settings.detect_timeout());
        let detected = detect_with(runner.as_ref(), &ctx, &path).await?;
        let info = detected.info;

        if settings.enforce_protocol_version {
            if info.protocol_version.is_empty() {
                warn!(
                    target: EXECUTOR_TARGET,
                    plugin = %path.display(),
                    "plugin does not declare a protocol version; assuming compatible"
                );
            } else {
                check_compatibility(&info.protocol_version).map_err(|err| match err {
                    VersionError::Incompatible { .. } => PluginError::VersionIncompatible {
                        path: path.clone(),
                        source: err,
                    },
                    malformed => PluginError::Version(malformed),
                })?;
            }
        }

        let binding = match detected.transport {
            Transport::Rpc => Binding::Rpc(RpcBinding { session: None }),
            Transport::JsonStdio => Binding::JsonStdio(JsonBinding {
                transport: JsonStdioTransport::new(
                    path.clone(),
                    info.name.clone(),
                    runner,
                    settings.clone(),
                ),
                last_wallpaper_path: None,
            }),
        };

        debug!(
            target: EXECUTOR_TARGET,
            plugin = %path.display(),
            name = %info.name,
            kind = %info.kind,
            transport = %detected.transport,
            "plugin executor ready"
        );

        Ok(PluginExecutor {
            path,
            info,
            transport: detected.transport,
            settings,
            binding,
        })
    }
}

/// Runs operations against one plugin executable.
///
/// RPC plugins are started lazily on the first operation and kept running
/// until [`close`](PluginExecutor::close) or a failure that leaves the
/// connection unusable, after which the next operation starts a fresh
/// process. JSON-stdio plugins are started once per operation.
pub struct PluginExecutor {
    path: PathBuf,
    info: PluginInfo,
    transport: Transport,
    settings: PluginSettings,
    binding: Binding,
}

enum Binding {
    Rpc(RpcBinding),
    JsonStdio(JsonBinding),
}

struct RpcBinding {
    session: Option<RpcConnection>,
}

struct JsonBinding {
    transport: JsonStdioTransport,
    last_wallpaper_path: Option<String>,
}

impl std::fmt::Debug for PluginExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let connected = match &self.binding {
            Binding::Rpc(rpc) => rpc.session.is_some(),
            Binding::JsonStdio(_) => false,
        };
        f.debug_struct("PluginExecutor")
            .field("path", &self.path)
            .field("name", &self.info.name)
            .field("transport", &self.transport)
            .field("connected", &connected)
            .finish()
    }
}

impl PluginExecutor {
    /// Detects the plugin at `path` using real processes and default
    /// settings.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, PluginError> {
        Self::builder(path).build().await
    }

    pub fn builder(path: impl Into<PathBuf>) -> PluginExecutorBuilder {
        PluginExecutorBuilder {
            path: path.into(),
            runner: Arc::new(RealProcessRunner),
            settings: PluginSettings::default(),
            verbose: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// True while an RPC plugin process is running.
    pub fn is_connected(&self) -> bool {
        match &self.binding {
            Binding::Rpc(rpc) => rpc.session.as_ref().is_some_and(RpcConnection::is_usable),
            Binding::JsonStdio(_) => false,
        }
    }

    pub async fn execute_input(
        &mut self,
        ctx: &CallContext,
        options: &InputOptions,
    ) -> Result<Vec<RgbColour>, PluginError> {
        match &mut self.binding {
            Binding::Rpc(rpc) => {
                let result = rpc
                    .generate_input(ctx, &self.path, &self.settings, options)
                    .await;
                rpc.settle(result)
            }
            Binding::JsonStdio(json) => {
                let reply = json.transport.generate_input(ctx, options).await?;
                json.last_wallpaper_path = reply.wallpaper_path;
                Ok(reply.colours)
            }
        }
    }

    pub async fn execute_output(
        &mut self,
        ctx: &CallContext,
        palette: &PaletteData,
    ) -> Result<GeneratedFiles, PluginError> {
        match &mut self.binding {
            Binding::Rpc(rpc) => {
                let result = rpc
                    .generate_output(ctx, &self.path, &self.settings, palette)
                    .await;
                rpc.settle(result)
            }
            Binding::JsonStdio(json) => json.transport.generate_output(ctx, palette).await,
        }
    }

    /// Asks an output plugin whether this run should go ahead.
    pub async fn pre_execute(
        &mut self,
        ctx: &CallContext,
    ) -> Result<PreExecuteOutcome, PluginError> {
        match &mut self.binding {
            Binding::Rpc(rpc) => {
                let ctx = ctx.with_timeout_inside(self.settings.pre_execute_timeout());
                let result = rpc.pre_execute(&ctx, &self.path, &self.settings).await;
                rpc.settle(result)
            }
            Binding::JsonStdio(json) => json.transport.pre_execute(ctx).await,
        }
    }

    /// Tells an output plugin which files were written. A failure here is
    /// reported but whether it matters is up to the caller.
    pub async fn post_execute(
        &mut self,
        ctx: &CallContext,
        written_files: &[String],
    ) -> Result<(), PluginError> {
        match &mut self.binding {
            Binding::Rpc(rpc) => {
                let ctx = ctx.with_timeout_inside(self.settings.post_execute_timeout());
                let result = rpc
                    .post_execute(&ctx, &self.path, &self.settings, written_files)
                    .await;
                rpc.settle(result)
            }
            Binding::JsonStdio(json) => json.transport.post_execute(ctx, written_files).await,
        }
    }

    pub async fn flag_help(&mut self, ctx: &CallContext) -> Result<Vec<FlagHelp>, PluginError> {
        match &mut self.binding {
            Binding::Rpc(rpc) => {
                let result = rpc
                    .flag_help(ctx, &self.path, &self.settings, self.info.kind)
                    .await;
                rpc.settle(result)
            }
            Binding::JsonStdio(json) => Ok(json.transport.flag_help()),
        }
    }

    /// Wallpaper the palette was extracted from, when the plugin reports
    /// one. JSON-stdio plugins report it alongside their colours, so this
    /// reflects the most recent [`execute_input`](Self::execute_input).
    pub async fn wallpaper_path(
        &mut self,
        ctx: &CallContext,
    ) -> Result<Option<String>, PluginError> {
        match &mut self.binding {
            Binding::Rpc(_) if self.info.kind == PluginKind::Output => Ok(None),
            Binding::Rpc(rpc) => {
                let result = rpc.wallpaper_path(ctx, &self.path, &self.settings).await;
                rpc.settle(result)
            }
            Binding::JsonStdio(json) => Ok(json.last_wallpaper_path.clone()),
        }
    }

    /// Stops a running RPC plugin. Safe to call any number of times; never
    /// fails.
    pub async fn close(&mut self) {
        if let Binding::Rpc(rpc) = &mut self.binding {
            if let Some(mut session) = rpc.session.take() {
                debug!(
                    target: EXECUTOR_TARGET,
                    plugin = %self.path.display(),
                    "closing RPC session"
                );
                session.shutdown().await;
            }
        }
    }
}

impl RpcBinding {
    async fn connection(
        &mut self,
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
    ) -> Result<&mut RpcConnection, PluginError> {
        let connection = match self.session.take() {
            Some(existing) if existing.is_usable() => existing,
            _ => RpcConnection::spawn(ctx, path, settings).await?,
        };
        Ok(self.session.insert(connection))
    }

    /// Drops the session once a failed call has left it poisoned.
    fn settle<T>(&mut self, result: Result<T, PluginError>) -> Result<T, PluginError> {
        if let Err(err) = &result {
            if self.session.as_ref().is_some_and(|session| !session.is_usable()) {
                self.session = None;
                warn!(target: EXECUTOR_TARGET, error = %err, "dropped RPC session after failure");
            }
        }
        result
    }

    async fn generate_input(
        &mut self,
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
        options: &InputOptions,
    ) -> Result<Vec<RgbColour>, PluginError> {
        let connection = self.connection(ctx, path, settings).await?;
        connection.input(ctx).await?.generate(ctx, options).await
    }

    async fn generate_output(
        &mut self,
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
        palette: &PaletteData,
    ) -> Result<GeneratedFiles, PluginError> {
        let connection = self.connection(ctx, path, settings).await?;
        connection.output(ctx).await?.generate(ctx, palette).await
    }

    async fn pre_execute(
        &mut self,
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
    ) -> Result<PreExecuteOutcome, PluginError> {
        let connection = self.connection(ctx, path, settings).await?;
        connection.output(ctx).await?.pre_execute(ctx).await
    }

    async fn post_execute(
        &mut self,
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
        written_files: &[String],
    ) -> Result<(), PluginError> {
        let connection = self.connection(ctx, path, settings).await?;
        connection
            .output(ctx)
            .await?
            .post_execute(ctx, written_files)
            .await
    }

    async fn wallpaper_path(
        &mut self,
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
    ) -> Result<Option<String>, PluginError> {
        let connection = self.connection(ctx, path, settings).await?;
        if !offers(connection, ctx, Service::Input).await? {
            return Ok(None);
        }
        connection.input(ctx).await?.wallpaper_path(ctx).await
    }

    async fn flag_help(
        &mut self,
        ctx: &CallContext,
        path: &Path,
        settings: &PluginSettings,
        kind: PluginKind,
    ) -> Result<Vec<FlagHelp>, PluginError> {
        let connection = self.connection(ctx, path, settings).await?;
        match kind {
            PluginKind::Input => connection.input(ctx).await?.flag_help(ctx).await,
            PluginKind::Output => connection.output(ctx).await?.flag_help(ctx).await,
            PluginKind::Unknown => {
                if offers(connection, ctx, Service::Input).await? {
                    connection.input(ctx).await?.flag_help(ctx).await
                } else {
                    connection.output(ctx).await?.flag_help(ctx).await
                }
            }
        }
    }
}

/// Dispenses `service`, treating a refusal as `false` rather than an error.
async fn offers(
    connection: &mut RpcConnection,
    ctx: &CallContext,
    service: Service,
) -> Result<bool, PluginError> {
    match connection.dispense(ctx, service).await {
        Ok(()) => Ok(true),
        Err(PluginError::ServiceUnavailable { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}
