//! Semantic protocol versions and the host/plugin compatibility rule.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Plugin protocol version implemented by this host.
pub const PROTOCOL_VERSION: &str = "0.0.1";

/// Oldest plugin protocol version this host can still drive.
pub const MIN_COMPATIBLE_VERSION: &str = "0.0.1";

/// A `MAJOR.MINOR.PATCH` version. Ordering is lexicographic over the three parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid version format: {input:?} (expected MAJOR.MINOR.PATCH)")]
    Format { input: String },
    #[error("invalid {part} version component {value:?} in {input:?}")]
    Component {
        input: String,
        part: &'static str,
        value: String,
    },
    #[error("{reason}")]
    Incompatible { reason: String },
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses exactly three dot-separated non-negative integers.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let parts: Vec<&str> = input.split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(VersionError::Format {
                input: input.to_string(),
            });
        };

        Ok(Self {
            major: parse_component(input, "major", major)?,
            minor: parse_component(input, "minor", minor)?,
            patch: parse_component(input, "patch", patch)?,
        })
    }
}

fn parse_component(input: &str, part: &'static str, value: &str) -> Result<u64, VersionError> {
    // u64::from_str accepts a leading '+', which is not a version digit.
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VersionError::Component {
            input: input.to_string(),
            part,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| VersionError::Component {
        input: input.to_string(),
        part,
        value: value.to_string(),
    })
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The parsed form of [`PROTOCOL_VERSION`].
pub fn current_version() -> Version {
    // Kept in lockstep with PROTOCOL_VERSION; covered by a unit test.
    Version::parse(PROTOCOL_VERSION).unwrap_or(Version::new(0, 0, 1))
}

/// Decides whether a plugin speaking `plugin` can be driven by a host at
/// `host` that accepts nothing older than `minimum`.
///
/// Majors must match exactly. Within the same major the plugin must not be
/// older than `minimum`; it may be newer than the host.
pub fn is_compatible(plugin: &str, host: &str, minimum: &str) -> Result<bool, VersionError> {
    let plugin = Version::parse(plugin)?;
    let host = Version::parse(host)?;
    let minimum = Version::parse(minimum)?;
    Ok(compatibility(plugin, host, minimum).is_ok())
}

/// Checks a plugin's declared protocol version against this host's
/// published versions, explaining any refusal.
pub fn check_compatibility(plugin: &str) -> Result<(), VersionError> {
    let plugin = Version::parse(plugin)?;
    let host = Version::parse(PROTOCOL_VERSION)?;
    let minimum = Version::parse(MIN_COMPATIBLE_VERSION)?;
    compatibility(plugin, host, minimum).map_err(|reason| VersionError::Incompatible { reason })
}

fn compatibility(plugin: Version, host: Version, minimum: Version) -> Result<(), String> {
    if plugin.major != host.major {
        return Err(format!(
            "incompatible major version: plugin is {plugin}, host requires {}.x.x",
            host.major
        ));
    }
    if plugin.major == minimum.major
        && (plugin.minor, plugin.patch) < (minimum.minor, minimum.patch)
    {
        return Err(format!(
            "plugin version {plugin} is too old, minimum required is {minimum}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0.0.1", Version::new(0, 0, 1))]
    #[case("1.2.3", Version::new(1, 2, 3))]
    #[case("10.20.30", Version::new(10, 20, 30))]
    #[case("007.0.0", Version::new(7, 0, 0))]
    fn parses_valid_versions(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(Version::parse(input), Ok(expected));
    }

    #[rstest]
    #[case("")]
    #[case("1")]
    #[case("1.2")]
    #[case("1.2.3.4")]
    #[case("a.b.c")]
    #[case("1.-2.3")]
    #[case("1.+2.3")]
    #[case("1..3")]
    #[case(" 1.2.3")]
    #[case("v1.2.3")]
    fn rejects_malformed_versions(#[case] input: &str) {
        assert!(Version::parse(input).is_err(), "{input:?} should not parse");
    }

    #[rstest]
    #[case("0.0.1")]
    #[case("3.14.159")]
    #[case("01.2.3")]
    fn display_round_trips_through_parse(#[case] input: &str) {
        let parsed = Version::parse(input).unwrap();
        assert_eq!(Version::parse(&parsed.to_string()), Ok(parsed));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut versions = vec![
            Version::new(1, 0, 0),
            Version::new(0, 10, 0),
            Version::new(0, 2, 9),
            Version::new(0, 2, 10),
        ];
        versions.sort();
        assert_eq!(
            versions,
            vec![
                Version::new(0, 2, 9),
                Version::new(0, 2, 10),
                Version::new(0, 10, 0),
                Version::new(1, 0, 0),
            ]
        );
    }

    #[rstest]
    #[case("0.0.1", true)]
    #[case("0.0.2", true)]
    #[case("0.1.0", true)]
    #[case("1.0.0", false)]
    #[case("0.0.0", false)]
    fn compatibility_against_minimum(#[case] plugin: &str, #[case] expected: bool) {
        assert_eq!(is_compatible(plugin, "0.0.1", "0.0.1"), Ok(expected));
    }

    #[test]
    fn older_major_is_incompatible_with_newer_host() {
        assert_eq!(is_compatible("1.9.9", "2.0.0", "2.0.0"), Ok(false));
        assert_eq!(is_compatible("2.0.0", "1.0.0", "1.0.0"), Ok(false));
    }

    #[test]
    fn malformed_inputs_fail() {
        assert!(is_compatible("x", "0.0.1", "0.0.1").is_err());
        assert!(is_compatible("0.0.1", "0.0", "0.0.1").is_err());
        assert!(is_compatible("0.0.1", "0.0.1", "").is_err());
    }

    #[test]
    fn check_explains_refusal() {
        let err = check_compatibility("1.0.0").unwrap_err();
        assert!(err.to_string().contains("incompatible major version"));

        let err = check_compatibility("0.0.0").unwrap_err();
        assert!(err.to_string().contains("too old"));

        assert!(check_compatibility("0.3.0").is_ok());
    }

    #[test]
    fn published_constants_parse() {
        assert_eq!(current_version().to_string(), PROTOCOL_VERSION);
        assert!(Version::parse(MIN_COMPATIBLE_VERSION).is_ok());
    }
}
