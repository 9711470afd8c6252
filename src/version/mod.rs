// src/version/mod.rs

//! Version handling and constraint satisfaction for formula dependencies
//!
//! Formula versions come from upstream release names ("1.7.3.2", "2.4b1",
//! "1.2.2-20110222") and are frequently not semver. Every version is
//! ordered the same way: the release part component by component, then a
//! pre-release suffix (after the first `-` or `~`), which sorts before the
//! bare release as in semver.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// One piece of a version string
#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Numeric(u64),
    Alpha(String),
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Numeric(a), Component::Numeric(b)) => a.cmp(b),
            (Component::Alpha(a), Component::Alpha(b)) => a.cmp(b),
            // "1.0.1" is newer than "1.0.beta"
            (Component::Numeric(_), Component::Alpha(_)) => Ordering::Greater,
            (Component::Alpha(_), Component::Numeric(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An ordered, comparable formula version
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    release: Vec<Component>,
    pre: Option<Vec<Component>>,
}

impl Version {
    /// Parse a version string
    ///
    /// Separators are `.`, `_` and `+`; a switch between digits and
    /// letters also starts a new component, so "2.4b1" is `[2, 4, b, 1]`.
    /// The first `-` or `~` starts the pre-release suffix.
    pub fn parse(s: &str) -> Result<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(Error::InvalidVersion("empty version string".to_string()));
        }
        if raw.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::InvalidVersion(format!(
                "'{}' contains whitespace or a path separator",
                raw
            )));
        }

        let (release, pre) = match raw.find(['-', '~']) {
            Some(at) => (&raw[..at], Some(&raw[at + 1..])),
            None => (raw, None),
        };
        let release = split_components(release)?;
        if release.is_empty() {
            return Err(Error::InvalidVersion(format!(
                "'{}' has no release components",
                raw
            )));
        }
        let pre = match pre {
            Some(pre) => Some(split_components(pre)?).filter(|c| !c.is_empty()),
            None => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            release,
            pre,
        })
    }

    /// The version exactly as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Ordering without the spelling tie-break, so "= 1.1" accepts "1.01"
    fn compare_loose(&self, other: &Version) -> Ordering {
        self.release.cmp(&other.release).then_with(|| match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => compare_pre(a, b),
        })
    }

    fn compare(&self, other: &Version) -> Ordering {
        // Different spellings of an equal version ("1.01" vs "1.1") still
        // need a total order consistent with Eq
        self.compare_loose(other).then_with(|| self.raw.cmp(&other.raw))
    }
}

/// Pre-release identifiers follow semver precedence: numbers sort before words
fn compare_pre(a: &[Component], b: &[Component]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x, y) {
            (Component::Numeric(_), Component::Alpha(_)) => Ordering::Less,
            (Component::Alpha(_), Component::Numeric(_)) => Ordering::Greater,
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn split_components(raw: &str) -> Result<Vec<Component>> {
    let mut components = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, components: &mut Vec<Component>| -> Result<()> {
        if current.is_empty() {
            return Ok(());
        }
        let component = if current.chars().all(|c| c.is_ascii_digit()) {
            let n = current.parse::<u64>().map_err(|e| {
                Error::InvalidVersion(format!("component '{}' out of range: {}", current, e))
            })?;
            Component::Numeric(n)
        } else {
            Component::Alpha(current.to_ascii_lowercase())
        };
        components.push(component);
        current.clear();
        Ok(())
    };

    for c in raw.chars() {
        if matches!(c, '.' | '-' | '_' | '+' | '~') {
            flush(&mut current, &mut components)?;
            continue;
        }
        if let Some(last) = current.chars().last()
            && last.is_ascii_digit() != c.is_ascii_digit()
        {
            flush(&mut current, &mut components)?;
        }
        current.push(c);
    }
    flush(&mut current, &mut components)?;

    Ok(components)
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::str::FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Version constraint operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Any version is acceptable
    Any,
    /// Exact version match
    Exact(Version),
    /// Greater than
    GreaterThan(Version),
    /// Greater than or equal
    GreaterOrEqual(Version),
    /// Less than
    LessThan(Version),
    /// Less than or equal
    LessOrEqual(Version),
    /// Not equal
    NotEqual(Version),
    /// Both constraints must be satisfied (for ranges like ">= 1.0, < 2.0")
    And(Box<VersionConstraint>, Box<VersionConstraint>),
}

impl VersionConstraint {
    /// Parse a version constraint string
    ///
    /// Examples:
    /// - ">= 1.2.3" → GreaterOrEqual(1.2.3)
    /// - "< 2.0" → LessThan(2.0)
    /// - "1.5" → Exact(1.5)
    /// - "" or "*" → Any
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        if s.is_empty() || s == "*" {
            return Ok(VersionConstraint::Any);
        }

        if let Some((left, right)) = s.split_once(',') {
            let left = Self::parse(left)?;
            let right = Self::parse(right)?;
            return Ok(VersionConstraint::And(Box::new(left), Box::new(right)));
        }

        let constraint = if let Some(rest) = s.strip_prefix(">=") {
            VersionConstraint::GreaterOrEqual(Version::parse(rest)?)
        } else if let Some(rest) = s.strip_prefix("<=") {
            VersionConstraint::LessOrEqual(Version::parse(rest)?)
        } else if let Some(rest) = s.strip_prefix("!=") {
            VersionConstraint::NotEqual(Version::parse(rest)?)
        } else if let Some(rest) = s.strip_prefix('>') {
            VersionConstraint::GreaterThan(Version::parse(rest)?)
        } else if let Some(rest) = s.strip_prefix('<') {
            VersionConstraint::LessThan(Version::parse(rest)?)
        } else if let Some(rest) = s.strip_prefix("==").or_else(|| s.strip_prefix('=')) {
            VersionConstraint::Exact(Version::parse(rest)?)
        } else {
            // No operator means exact match
            VersionConstraint::Exact(Version::parse(s)?)
        };

        Ok(constraint)
    }

    /// Check if a version satisfies this constraint
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(v) => version.compare_loose(v) == Ordering::Equal,
            VersionConstraint::GreaterThan(v) => version.compare_loose(v) == Ordering::Greater,
            VersionConstraint::GreaterOrEqual(v) => version.compare_loose(v) != Ordering::Less,
            VersionConstraint::LessThan(v) => version.compare_loose(v) == Ordering::Less,
            VersionConstraint::LessOrEqual(v) => version.compare_loose(v) != Ordering::Greater,
            VersionConstraint::NotEqual(v) => version.compare_loose(v) != Ordering::Equal,
            VersionConstraint::And(left, right) => {
                left.satisfies(version) && right.satisfies(version)
            }
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Exact(v) => write!(f, "= {}", v),
            VersionConstraint::GreaterThan(v) => write!(f, "> {}", v),
            VersionConstraint::GreaterOrEqual(v) => write!(f, ">= {}", v),
            VersionConstraint::LessThan(v) => write!(f, "< {}", v),
            VersionConstraint::LessOrEqual(v) => write!(f, "<= {}", v),
            VersionConstraint::NotEqual(v) => write!(f, "!= {}", v),
            VersionConstraint::And(left, right) => write!(f, "{}, {}", left, right),
        }
    }
}
