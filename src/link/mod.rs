// src/link/mod.rs

//! Link engine: projecting kegs into the shared prefix
//!
//! Linking walks a keg's store tree and creates, for every regular file or
//! symlink at relative path `p`, a symlink `prefix/p` pointing at the keg's
//! copy. Directories are shared between kegs; the ones a keg had to create
//! are recorded next to its links in the [`LinkManifest`] so that unlinking
//! can reverse the projection exactly.
//!
//! A link never overwrites anything. A path held by another keg or by an
//! unmanaged file is a [`Error::LinkConflict`], and everything created
//! during the failed call is removed before the error is returned.

mod lock;

pub use crate::cellar::LinkManifest;
pub use lock::PrefixLock;

use crate::cellar::{Cellar, Keg, KegId, KegState, RECEIPT_FILE};
use crate::error::{Error, Result};
use chrono::Utc;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Outcome of an unlink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlinkReport {
    /// Prefix-relative links that were removed
    pub removed: Vec<PathBuf>,
    /// Manifest entries skipped because the prefix no longer matched
    pub warnings: Vec<String>,
}

/// Links and unlinks kegs of one cellar into one prefix
///
/// The linker takes no lock itself; callers serialize access with a
/// [`PrefixLock`].
#[derive(Debug, Clone)]
pub struct Linker {
    prefix: PathBuf,
    cellar: Cellar,
}

/// Paths created by an in-progress link, for undoing it
#[derive(Default)]
struct Created {
    links: Vec<PathBuf>,
    directories: Vec<PathBuf>,
}

impl Linker {
    /// Create a linker for `prefix`, creating the directory if needed
    pub fn new(prefix: impl AsRef<Path>, cellar: &Cellar) -> Result<Self> {
        let prefix = prefix.as_ref();
        fs::create_dir_all(prefix)?;
        let prefix = fs::canonicalize(prefix)?;
        Ok(Self {
            prefix,
            cellar: cellar.clone(),
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Project `keg` into the prefix
    ///
    /// Valid from any state; linking an already linked keg re-records the
    /// same links and leaves the prefix unchanged.
    pub fn link(&self, keg: &mut Keg) -> Result<()> {
        let previous = if keg.state == KegState::Linked {
            keg.manifest.clone()
        } else {
            LinkManifest::default()
        };

        let mut manifest = LinkManifest::default();
        let mut created = Created::default();

        if let Err(e) = self.link_tree(keg, &previous, &mut manifest, &mut created) {
            self.undo(&created);
            return Err(e);
        }

        let before = (keg.state, keg.manifest.clone(), keg.linked_at);
        keg.manifest = manifest;
        keg.state = KegState::Linked;
        if before.0 != KegState::Linked || keg.linked_at.is_none() {
            keg.linked_at = Some(Utc::now());
        }

        if let Err(e) = self.cellar.commit(keg) {
            self.undo(&created);
            (keg.state, keg.manifest, keg.linked_at) = before;
            return Err(e);
        }

        info!(
            "Linked {} ({} links, {} new directories)",
            keg.id,
            keg.manifest.links.len(),
            created.directories.len()
        );
        Ok(())
    }

    /// Remove `keg`'s projection from the prefix
    ///
    /// Only links that still point at this keg are removed; anything else
    /// recorded in the manifest is reported as a warning and left alone.
    /// A link that cannot be removed is also a warning, so the keg is
    /// always recorded as unlinked once the prefix has been visited.
    pub fn unlink(&self, keg: &mut Keg) -> Result<UnlinkReport> {
        if keg.state != KegState::Linked {
            return Err(Error::InvalidState {
                keg: keg.id.clone(),
                state: keg.state,
                operation: "unlink",
            });
        }

        let mut report = UnlinkReport::default();

        for relative in &keg.manifest.links {
            if !is_safe_relative(relative) {
                report
                    .warnings
                    .push(format!("refusing unsafe manifest path {}", relative.display()));
                continue;
            }

            let dest = self.prefix.join(relative);
            let expected = keg.store_path.join(relative);
            match fs::read_link(&dest) {
                Ok(target) if target == expected => match fs::remove_file(&dest) {
                    Ok(()) => {
                        debug!("Removed link {}", dest.display());
                        report.removed.push(relative.clone());
                    }
                    Err(e) => report
                        .warnings
                        .push(format!("{}: failed to remove: {}", relative.display(), e)),
                },
                Ok(target) => report.warnings.push(format!(
                    "{} now points at {}, left in place",
                    relative.display(),
                    target.display()
                )),
                Err(e) if e.kind() == io::ErrorKind::NotFound => report
                    .warnings
                    .push(format!("{} is already gone", relative.display())),
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => report.warnings.push(
                    format!("{} is no longer a symlink, left in place", relative.display()),
                ),
                Err(e) => report
                    .warnings
                    .push(format!("{}: cannot be read: {}", relative.display(), e)),
            }
        }

        for relative in deepest_first(keg.manifest.directories.iter()) {
            if !is_safe_relative(relative) {
                continue;
            }
            remove_dir_if_empty(&self.prefix.join(relative));
        }

        for warning in &report.warnings {
            warn!("Unlinking {}: {}", keg.id, warning);
        }

        keg.state = KegState::Unlinked;
        keg.manifest.clear();
        keg.linked_at = None;
        self.cellar.commit(keg)?;

        info!("Unlinked {} ({} links removed)", keg.id, report.removed.len());
        Ok(report)
    }

    /// The keg owning the managed link at `relative`, if there is one
    pub fn link_owner(&self, relative: &Path) -> Option<KegId> {
        let dest = self.prefix.join(relative);
        let target = fs::read_link(&dest).ok()?;
        self.cellar.owner_of(&absolute_target(&dest, &target))
    }

    fn link_tree(
        &self,
        keg: &Keg,
        previous: &LinkManifest,
        manifest: &mut LinkManifest,
        created: &mut Created,
    ) -> Result<()> {
        let walker = WalkDir::new(&keg.store_path)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(io::Error::other(e)))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&keg.store_path)
                .map_err(|e| Error::InvalidPath(e.to_string()))?;
            if entry.depth() == 1 && is_receipt(relative) {
                continue;
            }
            if !is_safe_relative(relative) {
                return Err(Error::InvalidPath(format!(
                    "{} escapes the prefix",
                    relative.display()
                )));
            }

            self.ensure_parents(relative, previous, manifest, created)?;
            self.link_leaf(keg, relative, manifest, created)?;
        }
        Ok(())
    }

    /// Create the directories above `relative`, shallowest first
    fn ensure_parents(
        &self,
        relative: &Path,
        previous: &LinkManifest,
        manifest: &mut LinkManifest,
        created: &mut Created,
    ) -> Result<()> {
        let mut ancestors: Vec<&Path> = relative
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        ancestors.reverse();

        for dir in ancestors {
            let path = self.prefix.join(dir);
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {
                    if previous.directories.contains(dir) {
                        manifest.directories.insert(dir.to_path_buf());
                    }
                }
                Ok(_) => {
                    return Err(Error::LinkConflict {
                        path: dir.to_path_buf(),
                        owner: self.link_owner(dir),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&path)?;
                    created.directories.push(dir.to_path_buf());
                    manifest.directories.insert(dir.to_path_buf());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn link_leaf(
        &self,
        keg: &Keg,
        relative: &Path,
        manifest: &mut LinkManifest,
        created: &mut Created,
    ) -> Result<()> {
        let dest = self.prefix.join(relative);
        let target = keg.store_path.join(relative);

        match fs::symlink_metadata(&dest) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                symlink(&target, &dest)?;
                debug!("{} -> {}", dest.display(), target.display());
                created.links.push(relative.to_path_buf());
            }
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = fs::read_link(&dest)?;
                if current != target {
                    return Err(Error::LinkConflict {
                        path: relative.to_path_buf(),
                        owner: self
                            .cellar
                            .owner_of(&absolute_target(&dest, &current)),
                    });
                }
                debug!("{} already linked", dest.display());
            }
            Ok(_) => {
                return Err(Error::LinkConflict {
                    path: relative.to_path_buf(),
                    owner: None,
                });
            }
            Err(e) => return Err(e.into()),
        }

        manifest.links.insert(relative.to_path_buf());
        Ok(())
    }

    /// Remove what a failed link created, newest first
    fn undo(&self, created: &Created) {
        for relative in created.links.iter().rev() {
            let path = self.prefix.join(relative);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove link {}: {}", path.display(), e);
            }
        }
        for relative in created.directories.iter().rev() {
            let path = self.prefix.join(relative);
            if let Err(e) = fs::remove_dir(&path) {
                warn!("Failed to remove directory {}: {}", path.display(), e);
            }
        }
    }
}

fn is_receipt(relative: &Path) -> bool {
    relative
        .to_str()
        .is_some_and(|name| name.starts_with(RECEIPT_FILE))
}

/// Only plain components: no root, `.` or `..`
fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Resolve a symlink's target the way the kernel would
fn absolute_target(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        link.parent().unwrap_or(Path::new("/")).join(target)
    }
}

fn deepest_first<'a>(dirs: impl Iterator<Item = &'a PathBuf>) -> Vec<&'a PathBuf> {
    let mut dirs: Vec<_> = dirs.collect();
    dirs.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    dirs
}

fn remove_dir_if_empty(path: &Path) {
    let is_empty = match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return,
    };
    if is_empty {
        match fs::remove_dir(path) {
            Ok(()) => debug!("Removed empty directory {}", path.display()),
            Err(e) => warn!("Failed to remove directory {}: {}", path.display(), e),
        }
    }
}
