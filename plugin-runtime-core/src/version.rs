//! Semantic version parsing and comparison.
//!
//! Implements the grammar `MAJOR.MINOR.PATCH ( '-' PRERELEASE )? ( '+' BUILD )?`
//! with dot-separated identifiers for the prerelease and build components.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginErrorKind};

/// A single dot-separated identifier within a prerelease or build component.
///
/// Numeric identifiers (no leading zeros) compare numerically and always
/// sort below alphanumeric identifiers, per the semver precedence rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u64),
    AlphaNumeric(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{n}"),
            Identifier::AlphaNumeric(s) => write!(f, "{s}"),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::AlphaNumeric(a), Identifier::AlphaNumeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::AlphaNumeric(_)) => Ordering::Less,
            (Identifier::AlphaNumeric(_), Identifier::Numeric(_)) => Ordering::Greater,
        }
    }
}

/// A parsed semantic version: `(major, minor, patch, prerelease, build)`.
///
/// Ordering follows semver precedence: numeric comparison on
/// `(major, minor, patch)`, then prerelease identifiers left-to-right (a
/// version with a prerelease is always less than the same version without
/// one). Build metadata is preserved for serialization but never affects
/// ordering or equality.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Vec<Identifier>,
    pub build: Vec<Identifier>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: Vec::new(),
            build: Vec::new(),
        }
    }

    /// Parse a version string, rejecting empty strings, missing components,
    /// negative components, and empty identifier segments.
    pub fn parse(input: &str) -> Result<Self, PluginError> {
        if input.is_empty() {
            return Err(invalid(input, "version string is empty"));
        }

        let (core_and_pre, build) = match input.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (input, None),
        };
        let (core, prerelease) = match core_and_pre.split_once('-') {
            Some((rest, pre)) => (rest, Some(pre)),
            None => (core_and_pre, None),
        };

        let mut parts = core.split('.');
        let major = parse_numeric_component(parts.next(), input)?;
        let minor = parse_numeric_component(parts.next(), input)?;
        let patch = parse_numeric_component(parts.next(), input)?;
        if parts.next().is_some() {
            return Err(invalid(input, "too many dot-separated core components"));
        }

        let prerelease = match prerelease {
            Some(s) => parse_identifiers(s, input, true)?,
            None => Vec::new(),
        };
        let build = match build {
            Some(s) => parse_identifiers(s, input, false)?,
            None => Vec::new(),
        };

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        !self.prerelease.is_empty()
    }
}

fn invalid(input: &str, reason: &str) -> PluginError {
    PluginError::new(
        PluginErrorKind::InvalidArgument,
        format!("invalid version \"{input}\": {reason}"),
    )
}

fn parse_numeric_component(part: Option<&str>, input: &str) -> Result<u64, PluginError> {
    let part = part.ok_or_else(|| invalid(input, "missing version component"))?;
    if part.is_empty() {
        return Err(invalid(input, "empty version component"));
    }
    if part != "0" && part.starts_with('0') {
        return Err(invalid(input, "version component has a leading zero"));
    }
    if part.starts_with('-') {
        return Err(invalid(input, "version component is negative"));
    }
    part.parse::<u64>()
        .map_err(|_| invalid(input, "version component is not numeric"))
}

fn parse_identifiers(
    s: &str,
    input: &str,
    numeric_no_leading_zero: bool,
) -> Result<Vec<Identifier>, PluginError> {
    if s.is_empty() {
        return Err(invalid(input, "empty prerelease/build metadata"));
    }
    s.split('.')
        .map(|segment| parse_identifier(segment, input, numeric_no_leading_zero))
        .collect()
}

fn parse_identifier(
    segment: &str,
    input: &str,
    numeric_no_leading_zero: bool,
) -> Result<Identifier, PluginError> {
    if segment.is_empty() {
        return Err(invalid(input, "empty identifier segment"));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(invalid(input, "identifier contains invalid characters"));
    }

    let is_numeric = segment.chars().all(|c| c.is_ascii_digit());
    if is_numeric {
        if numeric_no_leading_zero && segment.len() > 1 && segment.starts_with('0') {
            return Err(invalid(input, "numeric identifier has a leading zero"));
        }
        let value = segment
            .parse::<u64>()
            .map_err(|_| invalid(input, "numeric identifier out of range"))?;
        Ok(Identifier::Numeric(value))
    } else {
        Ok(Identifier::AlphaNumeric(segment.to_string()))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.prerelease.is_empty() {
            write!(f, "-")?;
            write_identifiers(f, &self.prerelease)?;
        }
        if !self.build.is_empty() {
            write!(f, "+")?;
            write_identifiers(f, &self.build)?;
        }
        Ok(())
    }
}

fn write_identifiers(f: &mut fmt::Formatter<'_>, ids: &[Identifier]) -> fmt::Result {
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ".")?;
        }
        write!(f, "{id}")?;
    }
    Ok(())
}

impl FromStr for Version {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.is_prerelease(), other.is_prerelease()) {
                (false, false) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (true, true) => compare_prerelease(&self.prerelease, &other.prerelease),
            })
    }
}

fn compare_prerelease(a: &[Identifier], b: &[Identifier]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An inclusive `[lower, upper]` version range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub lower: Version,
    pub upper: Version,
}

impl VersionRange {
    pub fn new(lower: Version, upper: Version) -> Self {
        Self { lower, upper }
    }

    pub fn satisfies(&self, v: &Version) -> bool {
        &self.lower <= v && v <= &self.upper
    }
}
