//! Response parsers for the two negotiation dialects.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Protocol a remote instance speaks during version negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `ghe-negotiate-version` answers with `<Product> version <semver>`
    Current,
    /// No negotiation command; version read from the metadata file
    Legacy,
}

impl Dialect {
    /// Pull the raw version token out of a successful response body.
    pub fn extract_version(self, body: &str) -> Option<String> {
        match self {
            Dialect::Current => extract_labeled_line(body),
            Dialect::Legacy => extract_metadata_field(body),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Current => f.write_str("current"),
            Dialect::Legacy => f.write_str("legacy"),
        }
    }
}

fn extract_labeled_line(body: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let (_, rest) = line.split_once(" version ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

fn extract_metadata_field(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return value
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    // Not valid JSON: look for `"version": "..."` directly.
    let after_label = &body[body.find("\"version\"")? + "\"version\"".len()..];
    let after_colon = after_label.trim_start().strip_prefix(':')?.trim_start();
    let quoted = after_colon.strip_prefix('"')?;
    let end = quoted.find('"')?;
    Some(quoted[..end].to_string())
}

/// `major.minor.patch` release number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError(pub String);

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        // Drop pre-release and build suffixes.
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();

        let parts = core
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VersionParseError(raw.to_string()))?;

        match parts.as_slice() {
            [major, minor] => Ok(Version {
                major: *major,
                minor: *minor,
                patch: 0,
            }),
            [major, minor, patch] => Ok(Version {
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            _ => Err(VersionParseError(raw.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
