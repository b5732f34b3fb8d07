//! Single-shot transport: one process per call, JSON in on stdin, reply out
//! on stdout or through the exit code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tinct_core::PluginSettings;
use tracing::{debug, info};

use crate::context::CallContext;
use crate::detect::query_plugin_info;
use crate::error::PluginError;
use crate::process::{ProcessOutput, ProcessRunner};
use crate::protocol::{
    CategorisedColour, FlagHelp, GeneratedFiles, InputOptions, PaletteData, PluginInfo,
    PreExecuteOutcome, RgbColour, WrittenFiles,
};

const JSON_TARGET: &str = "tinct_plugin::json_stdio";

pub const PRE_EXECUTE_FLAG: &str = "--pre-execute";
pub const POST_EXECUTE_FLAG: &str = "--post-execute";

/// Exit code a plugin uses to ask for its run to be skipped.
pub const SKIP_EXIT_CODE: i32 = 1;

const DEFAULT_SKIP_REASON: &str = "plugin requested skip";

/// Colours parsed from an input plugin's reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputReply {
    pub colours: Vec<RgbColour>,
    pub wallpaper_path: Option<String>,
}

#[derive(Deserialize)]
struct ColourListReply {
    colors: Vec<RgbColour>,
    #[serde(default)]
    wallpaper_path: Option<String>,
}

#[derive(Deserialize)]
struct CategorisedReply {
    #[serde(default)]
    colours: BTreeMap<String, CategorisedColour>,
    #[serde(default)]
    all_colours: Vec<CategorisedColour>,
}

/// Reads an input plugin's stdout. Three shapes are accepted, tried in
/// order:
///
/// 1. `{"colors": [{r,g,b}, ...], "wallpaper_path": "..."}`
/// 2. `[{r,g,b}, ...]`
/// 3. a categorised palette `{"colours": {role: {...}}, "all_colours": [...]}`,
///    taking `all_colours` when it is non-empty and `colours` in role order
///    otherwise
pub fn parse_input_reply(stdout: &[u8]) -> Result<InputReply, String> {
    if let Ok(reply) = serde_json::from_slice::<ColourListReply>(stdout) {
        return Ok(InputReply {
            colours: reply.colors,
            wallpaper_path: reply.wallpaper_path.filter(|path| !path.is_empty()),
        });
    }

    if let Ok(colours) = serde_json::from_slice::<Vec<RgbColour>>(stdout) {
        return Ok(InputReply {
            colours,
            wallpaper_path: None,
        });
    }

    match serde_json::from_slice::<CategorisedReply>(stdout) {
        Ok(palette) => {
            let colours = if palette.all_colours.is_empty() {
                palette.colours.values().map(|colour| colour.rgb).collect()
            } else {
                palette.all_colours.iter().map(|colour| colour.rgb).collect()
            };
            Ok(InputReply {
                colours,
                wallpaper_path: None,
            })
        }
        Err(err) => Err(format!("output matches no accepted reply format: {err}")),
    }
}

/// Name of the single file an output plugin's stdout is saved as.
pub fn synthetic_file_name(plugin_name: &str) -> String {
    if plugin_name.is_empty() {
        "output.txt".to_string()
    } else {
        format!("{plugin_name}-output.txt")
    }
}

/// Talks to one JSON-stdio plugin executable.
#[derive(Clone)]
pub struct JsonStdioTransport {
    path: PathBuf,
    plugin_name: String,
    runner: Arc<dyn ProcessRunner>,
    settings: PluginSettings,
}

impl std::fmt::Debug for JsonStdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStdioTransport")
            .field("path", &self.path)
            .field("plugin_name", &self.plugin_name)
            .finish_non_exhaustive()
    }
}

impl JsonStdioTransport {
    pub fn new(
        path: impl Into<PathBuf>,
        plugin_name: impl Into<String>,
        runner: Arc<dyn ProcessRunner>,
        settings: PluginSettings,
    ) -> Self {
        Self {
            path: path.into(),
            plugin_name: plugin_name.into(),
            runner,
            settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn metadata(&self, ctx: &CallContext) -> Result<PluginInfo, PluginError> {
        query_plugin_info(self.runner.as_ref(), ctx, &self.path).await
    }

    pub async fn generate_input(
        &self,
        ctx: &CallContext,
        options: &InputOptions,
    ) -> Result<InputReply, PluginError> {
        let payload = serde_json::to_vec(options).map_err(PluginError::Serialize)?;
        let output = self.invoke(ctx, &[], Some(payload)).await?;
        if !output.success() {
            return Err(self.reported("generate", &output));
        }
        parse_input_reply(&output.stdout).map_err(|message| PluginError::Parse {
            path: self.path.clone(),
            message,
            output: output.stdout_lossy(),
        })
    }

    pub async fn generate_output(
        &self,
        ctx: &CallContext,
        palette: &PaletteData,
    ) -> Result<GeneratedFiles, PluginError> {
        let payload = serde_json::to_vec(palette).map_err(PluginError::Serialize)?;
        let output = self.invoke(ctx, &[], Some(payload)).await?;
        if !output.success() {
            return Err(self.reported("generate", &output));
        }

        let mut files = GeneratedFiles::new();
        if !output.stdout.is_empty() {
            files.insert(synthetic_file_name(&self.plugin_name), output.stdout);
        }
        Ok(files)
    }

    /// Exit 0 proceeds, exit 1 skips with stdout as the reason, anything
    /// else is a failure.
    pub async fn pre_execute(&self, ctx: &CallContext) -> Result<PreExecuteOutcome, PluginError> {
        let ctx = ctx.with_timeout_inside(self.settings.pre_execute_timeout());
        let output = self.invoke(&ctx, &[PRE_EXECUTE_FLAG], None).await?;
        match output.exit_code {
            Some(0) => Ok(PreExecuteOutcome::proceed()),
            Some(SKIP_EXIT_CODE) => {
                let reason = output.stdout_lossy().trim().to_string();
                Ok(PreExecuteOutcome::skip(if reason.is_empty() {
                    DEFAULT_SKIP_REASON.to_string()
                } else {
                    reason
                }))
            }
            _ => Err(self.reported("pre-execute", &output)),
        }
    }

    pub async fn post_execute(
        &self,
        ctx: &CallContext,
        written_files: &[String],
    ) -> Result<(), PluginError> {
        let ctx = ctx.with_timeout_inside(self.settings.post_execute_timeout());
        let payload = serde_json::to_vec(&WrittenFiles {
            written_files: written_files.to_vec(),
        })
        .map_err(PluginError::Serialize)?;
        let output = self.invoke(&ctx, &[POST_EXECUTE_FLAG], Some(payload)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(self.reported("post-execute", &output))
        }
    }

    /// JSON-stdio plugins have no way to describe their flags.
    pub fn flag_help(&self) -> Vec<FlagHelp> {
        Vec::new()
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        args: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<ProcessOutput, PluginError> {
        let output = self.runner.run(ctx, &self.path, args, stdin).await?;
        for line in output.stderr_lossy().lines().filter(|line| !line.is_empty()) {
            if self.settings.forward_stderr {
                info!(target: JSON_TARGET, plugin = %self.path.display(), "{line}");
            } else {
                debug!(target: JSON_TARGET, plugin = %self.path.display(), "{line}");
            }
        }
        Ok(output)
    }

    fn reported(&self, operation: &'static str, output: &ProcessOutput) -> PluginError {
        let stderr = output.stderr_lossy().trim().to_string();
        let message = if !stderr.is_empty() {
            stderr.clone()
        } else {
            match output.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        };
        PluginError::PluginReported {
            path: self.path.clone(),
            operation,
            message,
            exit_code: output.exit_code,
            stderr,
        }
    }
}
