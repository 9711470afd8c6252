// src/cellar/keg.rs

//! Keg identity, lifecycle state and the persisted receipt

use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Identity of an installed keg: one version of one formula
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KegId {
    pub name: String,
    pub version: Version,
}

impl KegId {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for KegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Keg lifecycle state
///
/// `Staged` after adoption, `Linked` once projected into the prefix,
/// `Unlinked` after an explicit unlink or being superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KegState {
    Staged,
    Linked,
    Unlinked,
}

impl KegState {
    pub fn as_str(&self) -> &str {
        match self {
            KegState::Staged => "staged",
            KegState::Linked => "linked",
            KegState::Unlinked => "unlinked",
        }
    }
}

impl fmt::Display for KegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KegState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "staged" => Ok(KegState::Staged),
            "linked" => Ok(KegState::Linked),
            "unlinked" => Ok(KegState::Unlinked),
            _ => Err(format!("Invalid keg state: {}", s)),
        }
    }
}

/// Prefix-relative paths a keg created the last time it was linked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkManifest {
    /// Symlinks pointing into the keg
    pub links: BTreeSet<PathBuf>,
    /// Directories that did not exist before the keg was linked
    pub directories: BTreeSet<PathBuf>,
}

impl LinkManifest {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.directories.is_empty()
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.directories.clear();
    }
}

/// One installed version of a formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keg {
    pub id: KegId,
    /// Versioned install directory owned exclusively by this keg
    pub store_path: PathBuf,
    pub state: KegState,
    pub manifest: LinkManifest,
    pub keg_only: bool,
    /// Declared dependencies as "name constraint" strings, for display
    pub dependencies: Vec<String>,
    pub source_url: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub linked_at: Option<DateTime<Utc>>,
}

impl Keg {
    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn version(&self) -> &Version {
        &self.id.version
    }

    pub fn is_linked(&self) -> bool {
        self.state == KegState::Linked
    }

    pub(crate) fn to_receipt(&self) -> KegReceipt {
        KegReceipt {
            format: RECEIPT_FORMAT,
            name: self.id.name.clone(),
            version: self.id.version.clone(),
            state: self.state,
            keg_only: self.keg_only,
            dependencies: self.dependencies.clone(),
            source_url: self.source_url.clone(),
            installed_at: self.installed_at,
            linked_at: self.linked_at,
            manifest: self.manifest.clone(),
        }
    }

    pub(crate) fn from_receipt(receipt: KegReceipt, store_path: &Path) -> Self {
        Self {
            id: KegId::new(receipt.name, receipt.version),
            store_path: store_path.to_path_buf(),
            state: receipt.state,
            manifest: receipt.manifest,
            keg_only: receipt.keg_only,
            dependencies: receipt.dependencies,
            source_url: receipt.source_url,
            installed_at: receipt.installed_at,
            linked_at: receipt.linked_at,
        }
    }
}

impl fmt::Display for Keg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// Receipt format version, bumped on incompatible changes
pub(crate) const RECEIPT_FORMAT: u32 = 1;

/// On-disk sidecar stored in the keg root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KegReceipt {
    pub format: u32,
    pub name: String,
    pub version: Version,
    pub state: KegState,
    pub keg_only: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub source_url: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub linked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub manifest: LinkManifest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keg_state_round_trip_strings() {
        for state in [KegState::Staged, KegState::Linked, KegState::Unlinked] {
            assert_eq!(state.as_str().parse::<KegState>().unwrap(), state);
        }
        assert!("broken".parse::<KegState>().is_err());
    }

    #[test]
    fn test_keg_id_display() {
        let id = KegId::new("git", Version::parse("1.7.3.2").unwrap());
        assert_eq!(id.to_string(), "git@1.7.3.2");
    }

    #[test]
    fn test_receipt_json_shape() {
        let keg = Keg {
            id: KegId::new("git", Version::parse("1.0").unwrap()),
            store_path: PathBuf::from("/cellar/git/1.0"),
            state: KegState::Linked,
            manifest: LinkManifest {
                links: [PathBuf::from("bin/git")].into_iter().collect(),
                directories: [PathBuf::from("bin")].into_iter().collect(),
            },
            keg_only: false,
            dependencies: vec!["expat >= 2.0".to_string()],
            source_url: None,
            installed_at: Utc::now(),
            linked_at: None,
        };

        let json = serde_json::to_value(keg.to_receipt()).unwrap();
        assert_eq!(json["state"], "linked");
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["manifest"]["links"][0], "bin/git");

        let receipt: KegReceipt = serde_json::from_value(json).unwrap();
        let back = Keg::from_receipt(receipt, Path::new("/cellar/git/1.0"));
        assert_eq!(back, keg);
    }
}
