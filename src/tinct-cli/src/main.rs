use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use thiserror::Error;
use tinct_core::{init_logging, AppDirs, Config, MAX_TIMEOUT_SECS};
use tinct_plugin::{
    query_plugin_info, CallContext, GeneratedFiles, InputOptions, PaletteData, PluginArgs,
    PluginExecutor, RealProcessRunner, RgbColour,
};

#[derive(Debug, Parser)]
#[command(name = "tinct", version, about = "Colour palette tool plugin host")]
struct Cli {
    /// Overall time limit for one plugin operation, in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plugin inspection and execution
    #[command(subcommand)]
    Plugin(PluginCommand),
}

#[derive(Debug, Subcommand)]
enum PluginCommand {
    /// Print a plugin's --plugin-info metadata
    Info { path: PathBuf },
    /// Detect the transport and verify protocol compatibility
    Check { path: PathBuf },
    /// Run an input plugin and print the colours it extracts
    Input(InputCommand),
    /// Run an output plugin against a palette file
    Output(OutputCommand),
}

#[derive(Debug, Parser, Clone)]
struct InputCommand {
    path: PathBuf,
    #[arg(long)]
    dry_run: bool,
    /// Forward plugin stderr to the log
    #[arg(short, long)]
    verbose: bool,
    /// Plugin argument as key=value; values that parse as JSON are sent as JSON
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    args: Vec<String>,
    /// Colour override as role=hex
    #[arg(long = "override", value_name = "ROLE=HEX")]
    overrides: Vec<String>,
}

#[derive(Debug, Parser, Clone)]
struct OutputCommand {
    path: PathBuf,
    /// JSON file holding the categorised palette
    #[arg(long)]
    palette: PathBuf,
    /// Directory generated files are written into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long)]
    verbose: bool,
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    args: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum ArgError {
    #[error("expected KEY=VALUE, got {0:?}")]
    MissingSeparator(String),
    #[error("empty key in {0:?}")]
    EmptyKey(String),
    #[error("invalid colour {hex:?} for role {role:?}")]
    InvalidColour { role: String, hex: String },
}

fn split_pair(raw: &str) -> Result<(&str, &str), ArgError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ArgError::MissingSeparator(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ArgError::EmptyKey(raw.to_string()));
    }
    Ok((key, value))
}

fn parse_plugin_args(raw: &[String]) -> Result<PluginArgs, ArgError> {
    let mut args = PluginArgs::new();
    for pair in raw {
        let (key, value) = split_pair(pair)?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
        args.insert(key.to_string(), value);
    }
    Ok(args)
}

fn parse_overrides(raw: &[String]) -> Result<Vec<String>, ArgError> {
    raw.iter()
        .map(|pair| {
            let (role, hex) = split_pair(pair)?;
            let colour = RgbColour::from_hex(hex).ok_or_else(|| ArgError::InvalidColour {
                role: role.to_string(),
                hex: hex.to_string(),
            })?;
            Ok(format!("{role}={}", colour.hex()))
        })
        .collect()
}

impl InputCommand {
    fn options(&self) -> Result<InputOptions, ArgError> {
        Ok(InputOptions {
            verbose: self.verbose,
            dry_run: self.dry_run,
            colour_overrides: parse_overrides(&self.overrides)?,
            plugin_args: parse_plugin_args(&self.args)?,
        })
    }
}

impl OutputCommand {
    fn palette(&self) -> Result<PaletteData> {
        let raw = std::fs::read(&self.palette)
            .with_context(|| format!("reading palette {}", self.palette.display()))?;
        let mut palette: PaletteData = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing palette {}", self.palette.display()))?;
        palette.dry_run = self.dry_run;
        palette.plugin_args.extend(parse_plugin_args(&self.args)?);
        Ok(palette)
    }
}

/// Writes generated files directly under `out_dir`, returning the paths
/// written. Names are reduced to their final component; two names that
/// reduce to the same file are refused before anything is written.
fn write_files(out_dir: &Path, files: &GeneratedFiles) -> Result<Vec<String>> {
    let mut targets: BTreeMap<PathBuf, &str> = BTreeMap::new();
    let mut plan = Vec::with_capacity(files.len());
    for (name, contents) in files {
        let file_name = Path::new(name)
            .file_name()
            .with_context(|| format!("plugin produced an unusable file name {name:?}"))?;
        let target = out_dir.join(file_name);
        if let Some(previous) = targets.insert(target.clone(), name.as_str()) {
            bail!(
                "plugin files {previous:?} and {name:?} would both be written to {}",
                target.display()
            );
        }
        plan.push((target, contents));
    }

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let mut written = Vec::with_capacity(plan.len());
    for (target, contents) in plan {
        std::fs::write(&target, contents)
            .with_context(|| format!("writing {}", target.display()))?;
        written.push(target.display().to_string());
    }
    Ok(written)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;
    let timeout = Duration::from_secs(cli.timeout.clamp(1, MAX_TIMEOUT_SECS));

    match cli.command {
        Command::Plugin(PluginCommand::Info { path }) => {
            let ctx = CallContext::with_timeout(config.plugins.detect_timeout());
            let info = query_plugin_info(&RealProcessRunner, &ctx, &path).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Plugin(PluginCommand::Check { path }) => {
            let mut executor = PluginExecutor::builder(&path)
                .settings(config.plugins.clone())
                .build()
                .await?;
            let info = executor.info();
            println!(
                "{} {} ({:?}) speaks {}, protocol {}",
                info.name,
                info.version,
                info.kind,
                executor.transport().as_str(),
                if info.protocol_version.is_empty() {
                    "unversioned"
                } else {
                    info.protocol_version.as_str()
                }
            );
            executor.close().await;
        }
        Command::Plugin(PluginCommand::Input(input)) => {
            let options = input.options()?;
            let mut executor = PluginExecutor::builder(&input.path)
                .settings(config.plugins.clone())
                .verbose(input.verbose)
                .build()
                .await?;
            let ctx = CallContext::with_timeout(timeout);
            let result = run_input(&mut executor, &ctx, &options).await;
            executor.close().await;
            result?;
        }
        Command::Plugin(PluginCommand::Output(output)) => {
            let palette = output.palette()?;
            let mut executor = PluginExecutor::builder(&output.path)
                .settings(config.plugins.clone())
                .verbose(output.verbose)
                .build()
                .await?;
            let ctx = CallContext::with_timeout(timeout);
            let result = run_output(&mut executor, &ctx, &output, &palette).await;
            executor.close().await;
            result?;
        }
    }

    Ok(())
}

async fn run_input(
    executor: &mut PluginExecutor,
    ctx: &CallContext,
    options: &InputOptions,
) -> Result<()> {
    let colours = executor.execute_input(ctx, options).await?;
    tracing::info!(plugin = %executor.info().name, count = colours.len(), "input plugin finished");
    for colour in &colours {
        println!("{colour}");
    }
    if let Some(wallpaper) = executor.wallpaper_path(ctx).await? {
        println!("wallpaper: {wallpaper}");
    }
    Ok(())
}

async fn run_output(
    executor: &mut PluginExecutor,
    ctx: &CallContext,
    command: &OutputCommand,
    palette: &PaletteData,
) -> Result<()> {
    let outcome = executor.pre_execute(ctx).await?;
    if outcome.skip {
        println!("skipped: {}", outcome.reason);
        return Ok(());
    }

    let files = executor.execute_output(ctx, palette).await?;
    if command.dry_run {
        for (name, contents) in &files {
            println!("would write {name} ({} bytes)", contents.len());
        }
        return Ok(());
    }

    let written = write_files(&command.out_dir, &files)?;
    for path in &written {
        println!("wrote {path}");
    }
    if let Err(err) = executor.post_execute(ctx, &written).await {
        tracing::warn!(plugin = %executor.info().name, error = %err, "post-execute failed");
        eprintln!("warning: post-execute failed: {err}");
    }
    Ok(())
}
