//! Working out which transport a plugin binary speaks.
//!
//! Every plugin answers `--plugin-info` with its metadata as JSON. The
//! `plugin_protocol` field selects the transport; plugins that predate the
//! field are JSON-stdio plugins.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::context::CallContext;
use crate::error::PluginError;
use crate::process::{ProcessRunner, RealProcessRunner};
use crate::protocol::{PluginInfo, Transport};

const DETECT_TARGET: &str = "tinct_plugin::detect";

/// Flag every plugin answers with its metadata.
pub const PLUGIN_INFO_FLAG: &str = "--plugin-info";

/// Bound applied by [`detect`] when no caller context is given.
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of protocol detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPlugin {
    pub transport: Transport,
    pub info: PluginInfo,
}

/// Detects the transport of the plugin at `path`, giving it
/// [`DEFAULT_DETECT_TIMEOUT`] to answer.
pub async fn detect(path: &Path) -> Result<DetectedPlugin, PluginError> {
    let ctx = CallContext::with_timeout(DEFAULT_DETECT_TIMEOUT);
    detect_with(&RealProcessRunner, &ctx, path).await
}

/// Detects the transport of the plugin at `path` through `runner`, bounded
/// only by `ctx`.
pub async fn detect_with<R>(
    runner: &R,
    ctx: &CallContext,
    path: &Path,
) -> Result<DetectedPlugin, PluginError>
where
    R: ProcessRunner + ?Sized,
{
    let info = query_plugin_info(runner, ctx, path).await?;
    let transport = classify(&info).map_err(|declared| PluginError::UnsupportedTransport {
        path: path.to_path_buf(),
        declared,
    })?;
    debug!(
        target: DETECT_TARGET,
        plugin = %path.display(),
        name = %info.name,
        kind = %info.kind,
        %transport,
        "detected plugin transport"
    );
    Ok(DetectedPlugin { transport, info })
}

/// Maps a declared `plugin_protocol` to a transport. Unrecognised values are
/// returned as the error so the caller can report them.
pub fn classify(info: &PluginInfo) -> Result<Transport, String> {
    match info.plugin_protocol.as_str() {
        "" | "json-stdio" => Ok(Transport::JsonStdio),
        "go-plugin" | "rpc" => Ok(Transport::Rpc),
        other => Err(other.to_string()),
    }
}

/// Reads a plugin's metadata without classifying its transport.
pub async fn query_plugin_info<R>(
    runner: &R,
    ctx: &CallContext,
    path: &Path,
) -> Result<PluginInfo, PluginError>
where
    R: ProcessRunner + ?Sized,
{
    let output = runner
        .run(ctx, path, &[PLUGIN_INFO_FLAG], None)
        .await
        .map_err(|err| match err {
            PluginError::Spawn { source, .. } => PluginError::Detection {
                path: path.to_path_buf(),
                message: format!("failed to query plugin: {source}"),
            },
            other => other,
        })?;

    if !output.success() {
        let code = output
            .exit_code
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        return Err(PluginError::Detection {
            path: path.to_path_buf(),
            message: format!(
                "failed to query plugin: exit status {code}\nStderr: {}",
                output.stderr_lossy().trim()
            ),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(|err| PluginError::Detection {
        path: path.to_path_buf(),
        message: format!("failed to parse plugin info: {err}"),
    })
}
