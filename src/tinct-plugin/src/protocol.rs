//! Data exchanged with plugins, shared by both transports.
//!
//! Field names follow the JSON documents deployed plugins already read and
//! write, so every type here doubles as its own wire schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Files produced by an output plugin, keyed by relative path.
pub type GeneratedFiles = BTreeMap<String, Vec<u8>>;

/// Free-form plugin arguments forwarded verbatim.
pub type PluginArgs = BTreeMap<String, Value>;

/// Metadata a plugin prints for `--plugin-info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: PluginKind,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub description: String,
    /// Declared transport; empty means JSON-stdio.
    #[serde(default)]
    pub plugin_protocol: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Input,
    Output,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PluginKind::Input => "input",
            PluginKind::Output => "output",
            PluginKind::Unknown => "unknown",
        })
    }
}

/// Wire convention a plugin speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Persistent request/response connection to a long-lived plugin process.
    Rpc,
    /// One process per call, JSON on stdin, reply on stdout or exit code.
    JsonStdio,
}

impl Transport {
    /// Spelling used in `plugin_protocol`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Rpc => "go-plugin",
            Transport::JsonStdio => "json-stdio",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options handed to an input plugin's Generate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputOptions {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Ordered `role=hex` overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colour_overrides: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_args: PluginArgs,
}

/// Categorised palette handed to an output plugin's Generate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaletteData {
    #[serde(default)]
    pub colours: BTreeMap<String, CategorisedColour>,
    #[serde(default)]
    pub all_colours: Vec<CategorisedColour>,
    #[serde(default)]
    pub theme_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_args: PluginArgs,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorisedColour {
    pub rgb: RgbColour,
    #[serde(default)]
    pub hex: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default)]
    pub luminance: f64,
    #[serde(default)]
    pub is_light: bool,
    #[serde(default)]
    pub hue: f64,
    #[serde(default)]
    pub saturation: f64,
    #[serde(default)]
    pub index: usize,
}

/// Flattened colour primitive; the only colour shape that crosses a wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RgbColour {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColour {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `#rrggbb`, lowercase.
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Accepts `#rrggbb` or `rrggbb` in either case.
    pub fn from_hex(input: &str) -> Option<Self> {
        let digits = input.strip_prefix('#').unwrap_or(input);
        if digits.len() != 6 || !digits.is_ascii() {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&digits[range], 16).ok();
        Some(Self {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }
}

impl fmt::Display for RgbColour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Help text for one plugin flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagHelp {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub shorthand: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Verdict of an output plugin's pre-execute hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreExecuteOutcome {
    pub skip: bool,
    #[serde(default)]
    pub reason: String,
}

impl PreExecuteOutcome {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip: true,
            reason: reason.into(),
        }
    }
}

/// Payload of the post-execute hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenFiles {
    pub written_files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_info_uses_wire_names() {
        let json = r#"{"name":"random","type":"input","version":"1.2.0","protocol_version":"0.0.1","description":"Random palette","plugin_protocol":"go-plugin"}"#;
        let info: PluginInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.name, "random");
        assert_eq!(info.kind, PluginKind::Input);
        assert_eq!(info.plugin_protocol, "go-plugin");

        let back = serde_json::to_value(&info).unwrap();
        assert_eq!(back["type"], "input");
    }

    #[test]
    fn plugin_info_tolerates_missing_and_unknown_fields() {
        let info: PluginInfo =
            serde_json::from_str(r#"{"name":"odd","type":"filter","extra":1}"#).unwrap();
        assert_eq!(info.kind, PluginKind::Unknown);
        assert!(info.plugin_protocol.is_empty());
        assert!(info.protocol_version.is_empty());
    }

    #[test]
    fn input_options_omit_empty_collections() {
        let json = serde_json::to_string(&InputOptions {
            verbose: true,
            dry_run: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, r#"{"verbose":true,"dry_run":false}"#);
    }

    #[test]
    fn input_options_keep_override_order() {
        let options = InputOptions {
            colour_overrides: vec!["background=#000000".into(), "accent1=#ff0000".into()],
            plugin_args: PluginArgs::from([("seed".to_string(), Value::from(42))]),
            ..Default::default()
        };
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["colour_overrides"][0], "background=#000000");
        assert_eq!(value["colour_overrides"][1], "accent1=#ff0000");
        assert_eq!(value["plugin_args"]["seed"], 42);
    }

    #[test]
    fn hex_helpers() {
        let colour = RgbColour::new(255, 16, 0);
        assert_eq!(colour.hex(), "#ff1000");
        assert_eq!(RgbColour::from_hex("#FF1000"), Some(colour));
        assert_eq!(RgbColour::from_hex("ff1000"), Some(colour));
        assert_eq!(RgbColour::from_hex("#ff10"), None);
        assert_eq!(RgbColour::from_hex("#gg0000"), None);
        assert_eq!(RgbColour::from_hex("#ÿÿÿ"), None);
    }

    #[test]
    fn flag_help_reads_type_field() {
        let help: FlagHelp = serde_json::from_str(
            r#"{"name":"prompt","shorthand":"p","type":"string","default":"","description":"Prompt text","required":true}"#,
        )
        .unwrap();
        assert_eq!(help.kind, "string");
        assert!(help.required);
    }
}
