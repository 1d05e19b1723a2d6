//! Release versions and tags.
//!
//! A [`Version`] is a semantic version. Its [`tag`](Version::tag) (`"v"` +
//! version) is the key every cache domain uses, so two requests refer to the
//! same release exactly when their tags are equal.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from parsing a version string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The input is empty after trimming.
    #[error("version cannot be empty")]
    Empty,

    /// A short version (`1` or `1.6`) carried pre-release or build metadata.
    #[error("short version {0:?} cannot contain pre-release or build metadata")]
    ShortWithMetadata(String),

    /// The input is not a valid semantic version.
    #[error("invalid version {input:?}: {reason}")]
    Invalid { input: String, reason: String },
}

/// A release version, totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(semver::Version);

impl Version {
    /// Create a version from its numeric components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Parse a strict `MAJOR.MINOR.PATCH[-PRE][+BUILD]` version.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        if input.is_empty() {
            return Err(VersionError::Empty);
        }

        semver::Version::parse(input)
            .map(Self)
            .map_err(|e| VersionError::Invalid {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// Parse a version, accepting common variations.
    ///
    /// Whitespace and a leading `v` are stripped, `1` and `1.6` are padded to
    /// `1.0.0` and `1.6.0`, and leading zeros in numeric components are
    /// dropped.
    pub fn parse_tolerant(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }

        let mut parts: Vec<String> = trimmed.splitn(3, '.').map(str::to_string).collect();

        if parts.len() < 3 {
            if parts
                .last()
                .is_some_and(|last| last.contains(['+', '-']))
            {
                return Err(VersionError::ShortWithMetadata(input.to_string()));
            }
            parts.resize(3, "0".to_string());
        }

        for part in &mut parts {
            if part.len() > 1 {
                let stripped = part.trim_start_matches('0');
                *part = if stripped.starts_with(|c: char| c.is_ascii_digit()) {
                    stripped.to_string()
                } else {
                    format!("0{stripped}")
                };
            }
        }

        let normalized = parts.join(".");
        semver::Version::parse(&normalized)
            .map(Self)
            .map_err(|e| VersionError::Invalid {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// The canonical tag for this version (`v1.6.0`).
    pub fn tag(&self) -> String {
        format!("v{}", self.0)
    }

    /// Whether this version carries a pre-release identifier.
    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<semver::Version> for Version {
    fn from(version: semver::Version) -> Self {
        Self(version)
    }
}

impl serde::Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_tolerant(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_strict_parse_and_tag() {
        let version = Version::parse("1.6.0").unwrap();
        assert_eq!(version, Version::new(1, 6, 0));
        assert_eq!(version.tag(), "v1.6.0");
    }

    #[test]
    fn test_strict_parse_rejects_prefix_and_short_forms() {
        assert!(Version::parse("v1.6.0").is_err());
        assert!(Version::parse("1.6").is_err());
        assert_eq!(Version::parse(""), Err(VersionError::Empty));
    }

    #[rstest]
    #[case("1.6.0", "1.6.0")]
    #[case("v1.6.0", "1.6.0")]
    #[case(" v1.6.2 ", "1.6.2")]
    #[case("1.6", "1.6.0")]
    #[case("v2", "2.0.0")]
    #[case("01.06.00", "1.6.0")]
    #[case("1.7.0-alpha.1", "1.7.0-alpha.1")]
    #[case("v1.7.0-beta.0+dirty", "1.7.0-beta.0+dirty")]
    fn test_tolerant_parse(#[case] input: &str, #[case] expected: &str) {
        let version = Version::parse_tolerant(input).unwrap();
        assert_eq!(version.to_string(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("v")]
    #[case("latest")]
    #[case("1.6-alpha")]
    #[case("1.x.0")]
    fn test_tolerant_parse_rejects(#[case] input: &str) {
        assert!(Version::parse_tolerant(input).is_err());
    }

    #[test]
    fn test_ordering_with_prerelease() {
        let alpha = Version::parse("1.7.0-alpha.1").unwrap();
        let release = Version::parse("1.7.0").unwrap();
        let previous = Version::parse("1.6.9").unwrap();

        assert!(alpha.is_prerelease());
        assert!(previous < alpha);
        assert!(alpha < release);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let version = Version::new(1, 6, 0);
        let json = serde_json::to_string(&version).unwrap();
        assert_eq!(json, "\"1.6.0\"");

        let parsed: Version = serde_json::from_str("\"v1.6\"").unwrap();
        assert_eq!(parsed, version);
    }

    proptest! {
        #[test]
        fn prop_tag_parses_back_to_same_version(major in 0u64..100, minor in 0u64..100, patch in 0u64..100) {
            let version = Version::new(major, minor, patch);
            let reparsed = Version::parse_tolerant(&version.tag()).unwrap();
            prop_assert_eq!(reparsed, version);
        }

        #[test]
        fn prop_ordering_follows_components(a in (0u64..20, 0u64..20, 0u64..20), b in (0u64..20, 0u64..20, 0u64..20)) {
            let va = Version::new(a.0, a.1, a.2);
            let vb = Version::new(b.0, b.1, b.2);
            prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
        }
    }
}
