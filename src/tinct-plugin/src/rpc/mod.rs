//! Persistent request/response transport to a long-lived plugin process.
//!
//! After the [handshake](crate::handshake), host and plugin exchange
//! newline-delimited JSON over the plugin's stdin/stdout:
//!
//! ```text
//! host   -> {"id":1,"method":"Plugin.Dispense","params":{"service":"input"}}
//! plugin <- {"id":1,"result":null}
//! host   -> {"id":2,"method":"Input.Generate","params":{"verbose":false,"dry_run":true}}
//! plugin <- {"id":2,"result":[{"r":26,"g":27,"b":38}]}
//! ```
//!
//! A failing call answers `{"id":N,"error":{"message":"..."}}` and leaves the
//! connection usable. Colours travel as `{r,g,b}` objects and generated file
//! contents as base64 strings.

mod client;
mod server;

pub use client::{InputClient, OutputClient, RpcConnection};
pub use server::{serve_input, serve_output, InputPlugin, OutputPlugin, Server};

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::GeneratedFiles;

/// Method names understood by plugin servers.
pub mod methods {
    pub const DISPENSE: &str = "Plugin.Dispense";
    pub const GET_METADATA: &str = "Plugin.GetMetadata";
    pub const GET_FLAG_HELP: &str = "Plugin.GetFlagHelp";
    pub const SHUTDOWN: &str = "Plugin.Shutdown";
    pub const INPUT_GENERATE: &str = "Input.Generate";
    pub const INPUT_WALLPAPER_PATH: &str = "Input.WallpaperPath";
    pub const OUTPUT_GENERATE: &str = "Output.Generate";
    pub const OUTPUT_PRE_EXECUTE: &str = "Output.PreExecute";
    pub const OUTPUT_POST_EXECUTE: &str = "Output.PostExecute";
}

/// A capability a plugin process can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Input,
    Output,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Input => "input",
            Service::Output => "output",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseParams {
    pub service: Service,
}

pub(crate) fn encode_files(files: &GeneratedFiles) -> BTreeMap<String, String> {
    files
        .iter()
        .map(|(path, bytes)| (path.clone(), STANDARD.encode(bytes)))
        .collect()
}

pub(crate) fn decode_files(encoded: BTreeMap<String, String>) -> Result<GeneratedFiles, String> {
    encoded
        .into_iter()
        .map(|(path, text)| {
            STANDARD
                .decode(text.as_bytes())
                .map(|bytes| (path.clone(), bytes))
                .map_err(|err| format!("file {path:?} is not valid base64: {err}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_absent_params() {
        let request = Request {
            id: 3,
            method: methods::SHUTDOWN.to_string(),
            params: None,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"id":3,"method":"Plugin.Shutdown"}"#
        );
    }

    #[test]
    fn responses_carry_result_or_error() {
        let ok: Response = serde_json::from_value(json!({"id":1,"result":null})).unwrap();
        assert!(ok.error.is_none());

        let failed: Response =
            serde_json::from_value(json!({"id":2,"error":{"message":"boom"}})).unwrap();
        assert_eq!(failed.error.unwrap().message, "boom");
    }

    #[test]
    fn files_travel_as_base64() {
        let files = GeneratedFiles::from([("theme.conf".to_string(), b"bg=#000000\n".to_vec())]);
        let encoded = encode_files(&files);
        assert_eq!(encoded["theme.conf"], "Ymc9IzAwMDAwMAo=");
        assert_eq!(decode_files(encoded).unwrap(), files);
    }

    #[test]
    fn invalid_base64_names_the_file() {
        let encoded = BTreeMap::from([("bad.txt".to_string(), "%%%".to_string())]);
        let err = decode_files(encoded).unwrap_err();
        assert!(err.contains("bad.txt"));
    }

    #[test]
    fn services_use_lowercase_names() {
        let params = DispenseParams {
            service: Service::Output,
        };
        assert_eq!(serde_json::to_value(params).unwrap(), json!({"service":"output"}));
    }
}
