//! Plugin side of the RPC transport.
//!
//! A plugin author implements [`InputPlugin`] or [`OutputPlugin`] and hands
//! it to [`serve_input`] or [`serve_output`] from `main`:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     tinct_plugin::rpc::serve_input(RandomPalette::default()).await
//! }
//! ```

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::{encode_files, methods, DispenseParams, Request, Response, Service};
use crate::handshake::{cookie_present, HandshakeLine, MAGIC_COOKIE_KEY};
use crate::protocol::{
    FlagHelp, GeneratedFiles, InputOptions, PaletteData, PluginInfo, PreExecuteOutcome,
    RgbColour, WrittenFiles,
};

const SERVER_TARGET: &str = "tinct_plugin::rpc::server";

/// A plugin that produces a palette.
#[async_trait]
pub trait InputPlugin: Send + Sync {
    async fn generate(&self, options: InputOptions) -> Result<Vec<RgbColour>, String>;

    fn metadata(&self) -> PluginInfo;

    /// Wallpaper the last palette was extracted from, if any.
    async fn wallpaper_path(&self) -> Option<String> {
        None
    }

    fn flag_help(&self) -> Vec<FlagHelp> {
        Vec::new()
    }
}

/// A plugin that turns a palette into files.
#[async_trait]
pub trait OutputPlugin: Send + Sync {
    async fn generate(&self, palette: PaletteData) -> Result<GeneratedFiles, String>;

    fn metadata(&self) -> PluginInfo;

    async fn pre_execute(&self) -> Result<PreExecuteOutcome, String> {
        Ok(PreExecuteOutcome::proceed())
    }

    async fn post_execute(&self, _written_files: Vec<String>) -> Result<(), String> {
        Ok(())
    }

    fn flag_help(&self) -> Vec<FlagHelp> {
        Vec::new()
    }
}

/// Serves `plugin` over stdin/stdout. Exits the process with status 1 when
/// not launched by a Tinct host.
pub async fn serve_input<P: InputPlugin + 'static>(plugin: P) -> io::Result<()> {
    require_cookie();
    Server::input(plugin)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
}

/// Serves `plugin` over stdin/stdout. Exits the process with status 1 when
/// not launched by a Tinct host.
pub async fn serve_output<P: OutputPlugin + 'static>(plugin: P) -> io::Result<()> {
    require_cookie();
    Server::output(plugin)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
}

fn require_cookie() {
    if !cookie_present() {
        eprintln!(
            "This binary is a Tinct plugin. It is not meant to be run directly; \
             run it through tinct, or pass --plugin-info to inspect it. \
             ({MAGIC_COOKIE_KEY} is not set)"
        );
        std::process::exit(1);
    }
}

/// Request loop shared by both plugin kinds.
pub struct Server {
    input: Option<Arc<dyn InputPlugin>>,
    output: Option<Arc<dyn OutputPlugin>>,
    dispensed: HashSet<Service>,
}

impl Server {
    pub fn input<P: InputPlugin + 'static>(plugin: P) -> Self {
        Self {
            input: Some(Arc::new(plugin)),
            output: None,
            dispensed: HashSet::new(),
        }
    }

    pub fn output<P: OutputPlugin + 'static>(plugin: P) -> Self {
        Self {
            input: None,
            output: Some(Arc::new(plugin)),
            dispensed: HashSet::new(),
        }
    }

    /// Writes the handshake line, then answers requests until the host
    /// sends `Plugin.Shutdown` or closes the stream.
    pub async fn run<R, W>(mut self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let handshake = format!("{}\n", HandshakeLine::current());
        writer.write_all(handshake.as_bytes()).await?;
        writer.flush().await?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let (response, stop) = match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    let stop = request.method == methods::SHUTDOWN;
                    debug!(
                        target: SERVER_TARGET,
                        method = %request.method,
                        id = request.id,
                        "handling request"
                    );
                    let response = match self.dispatch(&request.method, request.params).await {
                        Ok(result) => Response::success(request.id, result),
                        Err(message) => Response::failure(request.id, message),
                    };
                    (response, stop)
                }
                Err(err) => (Response::failure(0, format!("invalid request: {err}")), false),
            };

            let mut encoded = serde_json::to_string(&response)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            encoded.push('\n');
            writer.write_all(encoded.as_bytes()).await?;
            writer.flush().await?;

            if stop {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, method: &str, params: Option<Value>) -> Result<Value, String> {
        match method {
            methods::DISPENSE => {
                let DispenseParams { service } = decode::<DispenseParams>(params)?;
                let offered = match service {
                    Service::Input => self.input.is_some(),
                    Service::Output => self.output.is_some(),
                };
                if !offered {
                    return Err(format!("this plugin does not offer the {service} service"));
                }
                self.dispensed.insert(service);
                Ok(Value::Null)
            }
            methods::GET_METADATA => encode(self.metadata()),
            methods::GET_FLAG_HELP => encode(self.flag_help()),
            methods::SHUTDOWN => Ok(Value::Null),
            methods::INPUT_GENERATE => {
                let plugin = self.input_service()?;
                let options: InputOptions = decode(params)?;
                encode(plugin.generate(options).await?)
            }
            methods::INPUT_WALLPAPER_PATH => {
                let plugin = self.input_service()?;
                encode(plugin.wallpaper_path().await.unwrap_or_default())
            }
            methods::OUTPUT_GENERATE => {
                let plugin = self.output_service()?;
                let palette: PaletteData = decode(params)?;
                let files = plugin.generate(palette).await?;
                encode(encode_files(&files))
            }
            methods::OUTPUT_PRE_EXECUTE => {
                let plugin = self.output_service()?;
                encode(plugin.pre_execute().await?)
            }
            methods::OUTPUT_POST_EXECUTE => {
                let plugin = self.output_service()?;
                let WrittenFiles { written_files } = decode::<WrittenFiles>(params)?;
                plugin.post_execute(written_files).await?;
                Ok(Value::Null)
            }
            other => Err(format!("unknown method {other:?}")),
        }
    }

    fn metadata(&self) -> PluginInfo {
        match (&self.input, &self.output) {
            (Some(plugin), _) => plugin.metadata(),
            (None, Some(plugin)) => plugin.metadata(),
            (None, None) => PluginInfo::default(),
        }
    }

    fn flag_help(&self) -> Vec<FlagHelp> {
        match (&self.input, &self.output) {
            (Some(plugin), _) => plugin.flag_help(),
            (None, Some(plugin)) => plugin.flag_help(),
            (None, None) => Vec::new(),
        }
    }

    fn input_service(&self) -> Result<Arc<dyn InputPlugin>, String> {
        match &self.input {
            Some(plugin) if self.dispensed.contains(&Service::Input) => Ok(Arc::clone(plugin)),
            Some(_) => Err("input service has not been dispensed".to_string()),
            None => Err("this plugin does not offer the input service".to_string()),
        }
    }

    fn output_service(&self) -> Result<Arc<dyn OutputPlugin>, String> {
        match &self.output {
            Some(plugin) if self.dispensed.contains(&Service::Output) => Ok(Arc::clone(plugin)),
            Some(_) => Err("output service has not been dispensed".to_string()),
            None => Err("this plugin does not offer the output service".to_string()),
        }
    }
}

fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| format!("invalid params: {err}"))
}

fn encode<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| format!("failed to encode result: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::error::PluginError;
    use crate::protocol::PluginKind;
    use crate::rpc::RpcConnection;
    use std::time::Duration;
    use tinct_core::PluginSettings;

    struct FixedInput;

    #[async_trait]
    impl InputPlugin for FixedInput {
        async fn generate(&self, options: InputOptions) -> Result<Vec<RgbColour>, String> {
            if options.plugin_args.contains_key("fail") {
                return Err("generation failed on purpose".to_string());
            }
            Ok(vec![RgbColour::new(26, 27, 38), RgbColour::new(192, 202, 245)])
        }

        fn metadata(&self) -> PluginInfo {
            PluginInfo {
                name: "fixed".into(),
                kind: PluginKind::Input,
                version: "1.0.0".into(),
                protocol_version: "0.0.1".into(),
                plugin_protocol: "go-plugin".into(),
                ..Default::default()
            }
        }

        async fn wallpaper_path(&self) -> Option<String> {
            Some("/tmp/wall.png".into())
        }

        fn flag_help(&self) -> Vec<FlagHelp> {
            vec![FlagHelp {
                name: "seed".into(),
                kind: "int".into(),
                ..Default::default()
            }]
        }
    }

    struct Templates;

    #[async_trait]
    impl OutputPlugin for Templates {
        async fn generate(&self, palette: PaletteData) -> Result<GeneratedFiles, String> {
            let body = format!("theme={}\n", palette.theme_type);
            Ok(GeneratedFiles::from([("theme.conf".to_string(), body.into_bytes())]))
        }

        fn metadata(&self) -> PluginInfo {
            PluginInfo {
                name: "templates".into(),
                kind: PluginKind::Output,
                ..Default::default()
            }
        }

        async fn pre_execute(&self) -> Result<PreExecuteOutcome, String> {
            Ok(PreExecuteOutcome::skip("compositor not running"))
        }

        async fn post_execute(&self, written_files: Vec<String>) -> Result<(), String> {
            if written_files.is_empty() {
                Err("nothing was written".into())
            } else {
                Ok(())
            }
        }
    }

    async fn connect(server: Server) -> RpcConnection {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        tokio::spawn(server.run(plugin_read, plugin_write));
        let (host_read, host_write) = tokio::io::split(host);
        RpcConnection::from_streams(
            &CallContext::background(),
            "/plugins/test",
            host_read,
            host_write,
            &PluginSettings::default(),
        )
        .await
        .expect("handshake should succeed")
    }

    #[tokio::test]
    async fn input_service_round_trip() {
        let mut connection = connect(Server::input(FixedInput)).await;
        let ctx = CallContext::background();
        let mut input = connection.input(&ctx).await.unwrap();

        let colours = input.generate(&ctx, &InputOptions::default()).await.unwrap();
        assert_eq!(colours[0], RgbColour::new(26, 27, 38));
        assert_eq!(colours.len(), 2);

        assert_eq!(input.metadata(&ctx).await.unwrap().name, "fixed");
        assert_eq!(
            input.wallpaper_path(&ctx).await.unwrap().as_deref(),
            Some("/tmp/wall.png")
        );
        assert_eq!(input.flag_help(&ctx).await.unwrap()[0].name, "seed");
    }

    #[tokio::test]
    async fn server_error_leaves_connection_usable() {
        let mut connection = connect(Server::input(FixedInput)).await;
        let ctx = CallContext::background();
        let mut input = connection.input(&ctx).await.unwrap();

        let mut options = InputOptions::default();
        options.plugin_args.insert("fail".into(), Value::Bool(true));
        let err = input.generate(&ctx, &options).await.unwrap_err();
        assert!(err.to_string().contains("generation failed on purpose"));
        assert!(!err.poisons_connection());

        let colours = input.generate(&ctx, &InputOptions::default()).await.unwrap();
        assert_eq!(colours.len(), 2);
        assert!(connection.is_usable());
    }

    #[tokio::test]
    async fn ended_context_leaves_connection_untouched() {
        let mut connection = connect(Server::input(FixedInput)).await;
        let live = CallContext::background();
        connection.dispense(&live, Service::Input).await.unwrap();

        let cancelled = CallContext::background();
        cancelled.cancel();
        let err = connection
            .call::<Value, _>(&cancelled, methods::INPUT_GENERATE, InputOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert!(connection.is_usable());

        let colours: Vec<RgbColour> = connection
            .call(&live, methods::INPUT_GENERATE, InputOptions::default())
            .await
            .unwrap();
        assert_eq!(colours.len(), 2);
    }

    #[tokio::test]
    async fn output_service_round_trip() {
        let mut connection = connect(Server::output(Templates)).await;
        let ctx = CallContext::background();
        let mut output = connection.output(&ctx).await.unwrap();

        let palette = PaletteData {
            theme_type: "dark".into(),
            ..Default::default()
        };
        let files = output.generate(&ctx, &palette).await.unwrap();
        assert_eq!(files["theme.conf"], b"theme=dark\n");

        let outcome = output.pre_execute(&ctx).await.unwrap();
        assert!(outcome.skip);
        assert_eq!(outcome.reason, "compositor not running");

        assert!(output.post_execute(&ctx, &["a.conf".into()]).await.is_ok());
        let err = output.post_execute(&ctx, &[]).await.unwrap_err();
        assert!(err.to_string().contains("nothing was written"));
    }

    #[tokio::test]
    async fn missing_service_is_reported() {
        let mut connection = connect(Server::output(Templates)).await;
        let err = connection
            .input(&CallContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ServiceUnavailable { service: "input", .. }));
        assert!(connection.is_usable());
    }

    #[tokio::test]
    async fn calls_before_dispense_are_refused() {
        let mut connection = connect(Server::input(FixedInput)).await;
        let err = connection
            .call::<Vec<RgbColour>, _>(
                &CallContext::background(),
                methods::INPUT_GENERATE,
                InputOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has not been dispensed"));
    }

    #[tokio::test]
    async fn shutdown_stops_the_server() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        let served = tokio::spawn(Server::input(FixedInput).run(plugin_read, plugin_write));
        let (host_read, host_write) = tokio::io::split(host);
        let mut connection = RpcConnection::from_streams(
            &CallContext::background(),
            "/plugins/test",
            host_read,
            host_write,
            &PluginSettings::default(),
        )
        .await
        .unwrap();

        connection.shutdown().await;
        assert!(!connection.is_usable());
        let result = tokio::time::timeout(Duration::from_secs(5), served)
            .await
            .expect("server should stop")
            .expect("server task should not panic");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wrong_handshake_is_refused() {
        let (host, mut plugin) = tokio::io::duplex(1024);
        plugin.write_all(b"1|7|stdio|json\n").await.unwrap();
        let (host_read, host_write) = tokio::io::split(host);
        let err = RpcConnection::from_streams(
            &CallContext::background(),
            "/plugins/test",
            host_read,
            host_write,
            &PluginSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Handshake { .. }));
        assert!(err.to_string().contains("app protocol"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_plugin_fails_the_handshake() {
        let (host, _plugin) = tokio::io::duplex(1024);
        let (host_read, host_write) = tokio::io::split(host);
        let err = RpcConnection::from_streams(
            &CallContext::background(),
            "/plugins/test",
            host_read,
            host_write,
            &PluginSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Handshake { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_context_poisons_the_connection() {
        let (host, mut plugin) = tokio::io::duplex(64 * 1024);
        plugin
            .write_all(format!("{}\n", HandshakeLine::current()).as_bytes())
            .await
            .unwrap();
        let (host_read, host_write) = tokio::io::split(host);
        let mut connection = RpcConnection::from_streams(
            &CallContext::background(),
            "/plugins/test",
            host_read,
            host_write,
            &PluginSettings::default(),
        )
        .await
        .unwrap();

        // The plugin end never answers.
        let ctx = CallContext::with_timeout(Duration::from_millis(100));
        let err = connection
            .call::<Value, _>(&ctx, methods::GET_METADATA, ())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!connection.is_usable());

        let err = connection
            .call::<Value, _>(&CallContext::background(), methods::GET_METADATA, ())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Transport { .. }));
        drop(plugin);
    }

    #[tokio::test]
    async fn mismatched_response_id_is_a_transport_error() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (plugin_read, mut plugin_write) = tokio::io::split(plugin);
        tokio::spawn(async move {
            plugin_write
                .write_all(format!("{}\n", HandshakeLine::current()).as_bytes())
                .await
                .unwrap();
            let mut lines = BufReader::new(plugin_read).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                plugin_write
                    .write_all(b"{\"id\":999,\"result\":null}\n")
                    .await
                    .unwrap();
            }
        });
        let (host_read, host_write) = tokio::io::split(host);
        let mut connection = RpcConnection::from_streams(
            &CallContext::background(),
            "/plugins/test",
            host_read,
            host_write,
            &PluginSettings::default(),
        )
        .await
        .unwrap();

        let err = connection
            .call::<Value, _>(&CallContext::background(), methods::GET_METADATA, ())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("id mismatch"));
        assert!(err.poisons_connection());
    }
}
