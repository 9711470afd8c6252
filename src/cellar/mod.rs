// src/cellar/mod.rs

//! The Cellar: versioned, isolated keg storage
//!
//! Layout is `<root>/<formula>/<version>/`, each keg carrying an
//! `INSTALL_RECEIPT.json` sidecar with its state and link manifest so that
//! unlinking stays exact across process restarts.
//!
//! Kegs only enter the cellar through [`Cellar::adopt`], which renames a
//! fully-built staging directory into place. A keg is therefore either
//! absent or complete; nothing outside this module writes to a store path.

mod keg;

pub use keg::{Keg, KegId, KegState, LinkManifest};

use crate::error::{Error, Result};
use crate::formula::Formula;
use crate::version::Version;
use chrono::Utc;
use keg::{KegReceipt, RECEIPT_FORMAT};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Name of the receipt sidecar in every keg root
pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// Directory under the cellar root holding in-progress builds
const STAGING_DIR: &str = ".staging";

/// The keg store
#[derive(Debug, Clone)]
pub struct Cellar {
    root: PathBuf,
}

impl Cellar {
    /// Open (creating if needed) the cellar at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        debug!("Opened cellar at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store path a keg for this formula and version lives at
    pub fn keg_path(&self, name: &str, version: &Version) -> PathBuf {
        self.root.join(name).join(version.as_str())
    }

    /// A fresh staging directory on the same filesystem as the store, so
    /// adoption is a single rename
    pub fn staging_dir(&self, name: &str) -> Result<TempDir> {
        let staging_root = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .tempdir_in(&staging_root)?;
        Ok(dir)
    }

    /// Take ownership of a build's output as a new `Staged` keg
    pub fn adopt(&self, formula: &Formula, staged_dir: &Path) -> Result<Keg> {
        let id = KegId::new(formula.name(), formula.version().clone());
        let store_path = self.keg_path(formula.name(), formula.version());

        if fs::symlink_metadata(&store_path).is_ok() {
            return Err(Error::AlreadyInstalled(id));
        }
        if !staged_dir.is_dir() {
            return Err(Error::InvalidPath(format!(
                "staged output {} is not a directory",
                staged_dir.display()
            )));
        }

        let keg = Keg {
            id,
            store_path: store_path.clone(),
            state: KegState::Staged,
            manifest: LinkManifest::default(),
            keg_only: formula.keg_only(),
            dependencies: formula
                .dependencies()
                .iter()
                .map(|d| format!("{} {}", d.name, d.constraint))
                .collect(),
            source_url: formula.source().map(|s| s.url.clone()),
            installed_at: Utc::now(),
            linked_at: None,
        };

        if staged_dir.join(RECEIPT_FILE).exists() {
            warn!(
                "Build of {} produced its own {}; replacing it",
                keg.id, RECEIPT_FILE
            );
        }
        write_receipt(staged_dir, &keg.to_receipt())?;

        if let Some(parent) = store_path.parent() {
            fs::create_dir_all(parent)?;
        }
        move_dir(staged_dir, &store_path)?;

        info!("Adopted {} into {}", keg.id, store_path.display());
        Ok(keg)
    }

    /// Find a keg; without a version, the newest installed version
    pub fn lookup(&self, name: &str, version: Option<&Version>) -> Result<Option<Keg>> {
        if !is_keg_name(name) {
            return Ok(None);
        }
        match version {
            Some(version) => {
                let path = self.keg_path(name, version);
                if !path.is_dir() {
                    return Ok(None);
                }
                self.load(&path).map(Some)
            }
            None => Ok(self.versions(name)?.pop()),
        }
    }

    /// All installed versions of a formula, oldest first
    pub fn versions(&self, name: &str) -> Result<Vec<Keg>> {
        let formula_dir = self.root.join(name);
        if !is_keg_name(name) || !formula_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut kegs = Vec::new();
        for entry in fs::read_dir(&formula_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match self.load(&path) {
                Ok(keg) => kegs.push(keg),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        kegs.sort_by(|a, b| a.id.version.cmp(&b.id.version));
        Ok(kegs)
    }

    /// Every installed keg, by name then version
    pub fn list(&self) -> Result<Vec<Keg>> {
        let mut names: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();

        let mut kegs = Vec::new();
        for name in names {
            kegs.extend(self.versions(&name)?);
        }
        Ok(kegs)
    }

    /// Kegs currently projected into the prefix
    pub fn linked_kegs(&self) -> Result<Vec<Keg>> {
        Ok(self.list()?.into_iter().filter(Keg::is_linked).collect())
    }

    /// Persist a keg's state and manifest
    pub fn commit(&self, keg: &Keg) -> Result<()> {
        if keg.store_path != self.keg_path(&keg.id.name, &keg.id.version) {
            return Err(Error::InvalidPath(format!(
                "{} is not a keg of this cellar",
                keg.store_path.display()
            )));
        }
        write_receipt(&keg.store_path, &keg.to_receipt())
    }

    /// Delete a keg from the store
    ///
    /// A linked keg is never removed: its links would dangle in the prefix.
    pub fn remove(&self, keg: Keg) -> Result<()> {
        // Trust the receipt on disk over a possibly stale in-memory copy
        let current = self.load(&keg.store_path)?;
        if current.state == KegState::Linked {
            return Err(Error::InvalidState {
                keg: current.id,
                state: current.state,
                operation: "remove",
            });
        }

        fs::remove_dir_all(&current.store_path)?;
        if let Some(parent) = current.store_path.parent() {
            // Only succeeds when no other version remains
            let _ = fs::remove_dir(parent);
        }

        info!("Removed {} from the cellar", current.id);
        Ok(())
    }

    /// The keg whose store path contains `path`, if any
    pub fn owner_of(&self, path: &Path) -> Option<KegId> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let name = components.next()?.as_os_str().to_str()?;
        let version = components.next()?.as_os_str().to_str()?;
        if !is_keg_name(name) {
            return None;
        }
        let version = Version::parse(version).ok()?;
        Some(KegId::new(name, version))
    }

    fn load(&self, store_path: &Path) -> Result<Keg> {
        let contents = fs::read_to_string(store_path.join(RECEIPT_FILE))?;
        let receipt: KegReceipt = serde_json::from_str(&contents)?;

        if receipt.format > RECEIPT_FORMAT {
            return Err(Error::InvalidPath(format!(
                "{} has receipt format {}, newer than supported {}",
                store_path.display(),
                receipt.format,
                RECEIPT_FORMAT
            )));
        }
        let expected = self.keg_path(&receipt.name, &receipt.version);
        if expected != store_path {
            return Err(Error::InvalidPath(format!(
                "receipt at {} describes {}@{}",
                store_path.display(),
                receipt.name,
                receipt.version
            )));
        }

        Ok(Keg::from_receipt(receipt, store_path))
    }
}

/// Names that can be a formula directory directly under the cellar root
fn is_keg_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/')
}

/// Write the receipt via a temporary file so readers never see a torn one
fn write_receipt(dir: &Path, receipt: &KegReceipt) -> Result<()> {
    let tmp_path = dir.join(format!("{}.tmp", RECEIPT_FILE));
    {
        let mut file = fs::File::create(&tmp_path)?;
        serde_json::to_writer_pretty(&mut file, receipt)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, dir.join(RECEIPT_FILE))?;
    Ok(())
}

/// Move a directory tree, copying when source and destination are on
/// different filesystems
fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(
                "Cross-filesystem move detected ({} -> {}), copying",
                src.display(),
                dst.display()
            );
            if let Err(e) = copy_tree(src, dst) {
                let _ = fs::remove_dir_all(dst);
                return Err(e);
            }
            fs::remove_dir_all(src)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::InvalidPath(e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link_target, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildContext;
    use tempfile::TempDir;

    fn noop(_ctx: &BuildContext) -> Result<()> {
        Ok(())
    }

    fn formula(name: &str, version: &str) -> Formula {
        Formula::builder(name, Version::parse(version).unwrap())
            .build_with(noop)
            .build()
            .unwrap()
    }

    fn staged(cellar: &Cellar, name: &str, files: &[&str]) -> TempDir {
        let dir = cellar.staging_dir(name).unwrap();
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        dir
    }

    #[test]
    fn test_adopt_moves_staged_tree_into_store() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path().join("Cellar")).unwrap();
        let stage = staged(&cellar, "tool", &["bin/tool", "share/doc/README"]);

        let keg = cellar.adopt(&formula("tool", "1.0"), stage.path()).unwrap();

        assert_eq!(keg.state, KegState::Staged);
        assert_eq!(keg.store_path, cellar.root().join("tool/1.0"));
        assert!(keg.store_path.join("bin/tool").is_file());
        assert!(keg.store_path.join(RECEIPT_FILE).is_file());
        assert!(!stage.path().exists());
    }

    #[test]
    fn test_adopt_twice_is_already_installed() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path()).unwrap();
        let f = formula("tool", "1.0");

        let first = staged(&cellar, "tool", &["bin/tool"]);
        cellar.adopt(&f, first.path()).unwrap();

        let second = staged(&cellar, "tool", &["bin/tool"]);
        let err = cellar.adopt(&f, second.path()).unwrap_err();
        assert!(matches!(err, Error::AlreadyInstalled(ref id) if id.to_string() == "tool@1.0"));
        assert!(second.path().exists(), "rejected staging dir is left alone");
    }

    #[test]
    fn test_lookup_exact_and_newest() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path()).unwrap();
        for version in ["1.9", "1.10", "1.2"] {
            let stage = staged(&cellar, "tool", &["bin/tool"]);
            cellar.adopt(&formula("tool", version), stage.path()).unwrap();
        }

        let newest = cellar.lookup("tool", None).unwrap().unwrap();
        assert_eq!(newest.version().as_str(), "1.10");

        let exact = cellar
            .lookup("tool", Some(&Version::parse("1.2").unwrap()))
            .unwrap()
            .unwrap();
        assert_eq!(exact.version().as_str(), "1.2");

        assert!(cellar.lookup("tool", Some(&Version::parse("3.0").unwrap())).unwrap().is_none());
        assert!(cellar.lookup("missing", None).unwrap().is_none());
    }

    #[test]
    fn test_list_skips_staging_area() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path()).unwrap();
        let stage = staged(&cellar, "a", &["bin/a"]);
        cellar.adopt(&formula("a", "1.0"), stage.path()).unwrap();
        let _pending = staged(&cellar, "b", &["bin/b"]);

        let kegs = cellar.list().unwrap();
        assert_eq!(kegs.len(), 1);
        assert_eq!(kegs[0].name(), "a");
    }

    #[test]
    fn test_commit_persists_state_across_reopen() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path()).unwrap();
        let stage = staged(&cellar, "a", &["bin/a"]);
        let mut keg = cellar.adopt(&formula("a", "1.0"), stage.path()).unwrap();

        keg.state = KegState::Linked;
        keg.manifest.links.insert(PathBuf::from("bin/a"));
        cellar.commit(&keg).unwrap();

        let reopened = Cellar::open(root.path()).unwrap();
        let loaded = reopened.lookup("a", None).unwrap().unwrap();
        assert_eq!(loaded.state, KegState::Linked);
        assert!(loaded.manifest.links.contains(Path::new("bin/a")));
    }

    #[test]
    fn test_remove_linked_keg_is_invalid_state() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path()).unwrap();
        let stage = staged(&cellar, "a", &["bin/a"]);
        let mut keg = cellar.adopt(&formula("a", "1.0"), stage.path()).unwrap();
        keg.state = KegState::Linked;
        cellar.commit(&keg).unwrap();

        let err = cellar.remove(keg.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: KegState::Linked, .. }));
        assert!(keg.store_path.exists());
    }

    #[test]
    fn test_remove_unlinked_keg_deletes_store_path() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path()).unwrap();
        let stage = staged(&cellar, "a", &["bin/a"]);
        let mut keg = cellar.adopt(&formula("a", "1.0"), stage.path()).unwrap();
        keg.state = KegState::Unlinked;
        cellar.commit(&keg).unwrap();
        let store_path = keg.store_path.clone();

        cellar.remove(keg).unwrap();
        assert!(!store_path.exists());
        assert!(!cellar.root().join("a").exists());
    }

    #[test]
    fn test_owner_of_maps_paths_to_kegs() {
        let root = TempDir::new().unwrap();
        let cellar = Cellar::open(root.path()).unwrap();

        let owner = cellar
            .owner_of(&cellar.root().join("git/1.7/bin/git"))
            .unwrap();
        assert_eq!(owner.to_string(), "git@1.7");
        assert!(cellar.owner_of(Path::new("/usr/bin/git")).is_none());
        assert!(cellar.owner_of(&cellar.root().join(".staging/x/y")).is_none());
    }

    #[test]
    fn test_copy_tree_preserves_symlinks() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/git"), b"binary").unwrap();
        std::os::unix::fs::symlink("git", src.join("bin/git-alias")).unwrap();

        let dst = root.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("bin/git")).unwrap(), b"binary");
        assert_eq!(
            fs::read_link(dst.join("bin/git-alias")).unwrap(),
            PathBuf::from("git")
        );
    }
}
