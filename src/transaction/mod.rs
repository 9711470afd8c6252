// src/transaction/mod.rs

//! Installation transactions
//!
//! [`Installer`] drives one user-level request end to end. An install
//! resolves the build order, then for each formula fetches, builds, adopts
//! and links it while recording an undo step for everything it changes.
//! If any step fails, the undo steps run in reverse and the store and
//! prefix end up as they were before the call; kegs from earlier
//! transactions are never touched except to re-link what this one
//! unlinked.
//!
//! # Install flow
//!
//! ```text
//! resolve -> lock prefix -> for each formula:
//!     installed at this version? -> link if needed
//!     fetch -> build into staging -> adopt -> link (upgrading older versions)
//! success: changeset applied        failure: undo in reverse, changeset rolled back
//! ```
//!
//! Every mutating operation holds the [`PrefixLock`] for its whole
//! duration and is recorded as a changeset in the history database.

use crate::build::{BuildContext, BuildEnvironment};
use crate::cellar::{Cellar, Keg, KegId};
use crate::config::Config;
use crate::db::{
    self,
    models::{Changeset, ChangesetKeg, ChangesetStatus, KegAction},
};
use crate::error::{Error, Phase, Result, TransactionFailure};
use crate::fetch::{ArchiveFetcher, SourceFetcher};
use crate::formula::{Formula, FormulaSet};
use crate::link::{Linker, PrefixLock, UnlinkReport};
use crate::resolver;
use crate::version::Version;
use rusqlite::Connection;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// What an install changed
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// Kegs built and adopted by this install, in build order
    pub installed: Vec<Keg>,
    /// Kegs that were already in the cellar and got linked
    pub relinked: Vec<KegId>,
    /// Older versions unlinked in favour of the ones installed
    pub superseded: Vec<KegId>,
}

/// One changeset and the kegs it touched
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub changeset: Changeset,
    pub kegs: Vec<ChangesetKeg>,
}

/// Reverses one change made by an install
#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    /// Delete a keg adopted by this transaction
    Remove(KegId),
    /// Unlink a keg this transaction linked
    Unlink(KegId),
    /// Link a keg this transaction unlinked
    Relink(KegId),
}

impl fmt::Display for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Undo::Remove(id) => write!(f, "remove {}", id),
            Undo::Unlink(id) => write!(f, "unlink {}", id),
            Undo::Relink(id) => write!(f, "relink {}", id),
        }
    }
}

/// State of an install in progress
#[derive(Default)]
struct Run {
    undo: Vec<Undo>,
    report: InstallReport,
}

/// Where and why an install stopped
struct Failed {
    formula: String,
    phase: Phase,
    source: Error,
}

impl Failed {
    fn new(formula: &Formula, phase: Phase, source: Error) -> Self {
        Self {
            formula: formula.name().to_string(),
            phase,
            source,
        }
    }
}

/// Entry point for every operation that changes the prefix or the cellar
pub struct Installer {
    config: Config,
    cellar: Cellar,
    linker: Linker,
    conn: Connection,
    fetcher: Box<dyn SourceFetcher>,
    cancel: Arc<AtomicBool>,
}

impl Installer {
    /// Open the cellar, prefix and history named by `config`
    pub fn new(config: Config) -> Result<Self> {
        let fetcher = ArchiveFetcher::new(config.cache_dir())?;
        Self::with_fetcher(config, fetcher)
    }

    /// Like [`Installer::new`] with a custom source fetcher
    pub fn with_fetcher(config: Config, fetcher: impl SourceFetcher + 'static) -> Result<Self> {
        let cellar = Cellar::open(&config.cellar)?;
        let linker = Linker::new(&config.prefix, &cellar)?;

        let db_path = config.db_path();
        db::init(&db_path)?;
        let conn = db::open(&db_path)?;

        debug!(
            "Installer ready: prefix {}, cellar {}",
            linker.prefix().display(),
            cellar.root().display()
        );
        Ok(Self {
            config,
            cellar,
            linker,
            conn,
            fetcher: Box::new(fetcher),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cellar(&self) -> &Cellar {
        &self.cellar
    }

    /// Canonical prefix directory
    pub fn prefix(&self) -> &Path {
        self.linker.prefix()
    }

    /// Flag that cancels the running install when set
    ///
    /// Cancellation is observed between steps and while a script build is
    /// running, and is handled like a build failure. The flag is cleared
    /// when the install finishes.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Install `root` and everything it depends on, all or nothing
    pub fn install(&mut self, root: &str, formulas: &FormulaSet) -> Result<InstallReport> {
        let order = resolver::resolve(root, formulas).map_err(|source| {
            Error::Transaction(Box::new(TransactionFailure {
                formula: root.to_string(),
                phase: Phase::Resolve,
                source,
                cleanup_warnings: Vec::new(),
            }))
        })?;

        let _lock = PrefixLock::acquire(&self.config.lock_path(), &format!("install {}", root))?;
        let mut changeset = Changeset::new("install", format!("Install {}", root));
        changeset.insert(&self.conn)?;

        info!(
            "Installing {} ({} formula(s) in chain)",
            root,
            order.len()
        );

        let mut run = Run::default();
        let result = order
            .iter()
            .try_for_each(|formula| self.install_formula(formula, &mut run));
        self.cancel.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.record_install(&mut changeset, &run.report);
                info!(
                    "Installed {}: {} built, {} linked, {} superseded",
                    root,
                    run.report.installed.len(),
                    run.report.relinked.len(),
                    run.report.superseded.len()
                );
                Ok(run.report)
            }
            Err(failed) => {
                warn!(
                    "{} failed during {}: {}; rolling back",
                    failed.formula, failed.phase, failed.source
                );
                let cleanup_warnings = self.roll_back(run.undo);
                let failure = TransactionFailure {
                    formula: failed.formula,
                    phase: failed.phase,
                    source: failed.source,
                    cleanup_warnings,
                };
                if let Err(e) = changeset.roll_back(&self.conn, &failure.to_string()) {
                    warn!("Failed to record rollback in history: {}", e);
                }
                Err(Error::Transaction(Box::new(failure)))
            }
        }
    }

    fn install_formula(&self, formula: &Arc<Formula>, run: &mut Run) -> std::result::Result<(), Failed> {
        let existing = self
            .cellar
            .lookup(formula.name(), Some(formula.version()))
            .map_err(|e| Failed::new(formula, Phase::Adopt, e))?;

        if let Some(mut keg) = existing {
            if keg.keg_only || keg.is_linked() {
                debug!("{} is already installed", keg.id);
                return Ok(());
            }
            self.link_into_prefix(&mut keg, run)
                .map_err(|e| Failed::new(formula, Phase::Link, e))?;
            run.report.relinked.push(keg.id);
            return Ok(());
        }

        if self.is_cancelled() {
            return Err(Failed::new(formula, Phase::Build, cancelled(formula)));
        }

        let work_dir = self
            .work_dir(formula)
            .map_err(|e| Failed::new(formula, Phase::Fetch, e))?;
        let source_dir = self
            .fetcher
            .fetch(formula, work_dir.path())
            .map_err(|e| Failed::new(formula, Phase::Fetch, e))?;

        let staging = self
            .cellar
            .staging_dir(formula.name())
            .map_err(|e| Failed::new(formula, Phase::Build, e))?;
        self.build(formula, source_dir, staging.path())
            .map_err(|e| Failed::new(formula, Phase::Build, e))?;

        let mut keg = self
            .cellar
            .adopt(formula, staging.path())
            .map_err(|e| Failed::new(formula, Phase::Adopt, e))?;
        run.undo.push(Undo::Remove(keg.id.clone()));

        if keg.keg_only {
            info!("{} is keg-only; not linking", keg.id);
        } else {
            self.link_into_prefix(&mut keg, run)
                .map_err(|e| Failed::new(formula, Phase::Link, e))?;
        }

        run.report.installed.push(keg);
        Ok(())
    }

    /// Run the formula's build procedure into `staging_dir`
    fn build(&self, formula: &Arc<Formula>, source_dir: PathBuf, staging_dir: &Path) -> Result<()> {
        let keg_path = self.cellar.keg_path(formula.name(), formula.version());
        let env = BuildEnvironment::compute(
            &self.config.build,
            self.linker.prefix(),
            staging_dir,
            &keg_path,
        );
        let ctx = BuildContext {
            formula: Arc::clone(formula),
            source_dir,
            staging_dir: staging_dir.to_path_buf(),
            keg_path,
            env,
            timeout: self.config.build_timeout(),
            cancel: Arc::clone(&self.cancel),
        };

        info!("Building {}", formula);
        formula
            .build_procedure()
            .build(&ctx)
            .map_err(|e| as_build_failure(formula, e))?;

        if self.is_cancelled() {
            return Err(cancelled(formula));
        }
        if fs::read_dir(staging_dir)?.next().is_none() {
            return Err(Error::BuildFailure {
                formula: formula.name().to_string(),
                reason: "nothing was installed".to_string(),
            });
        }
        Ok(())
    }

    /// Link `keg`, unlinking older versions of the same formula that stand
    /// in the way or remain linked
    fn link_into_prefix(&self, keg: &mut Keg, run: &mut Run) -> Result<()> {
        loop {
            match self.linker.link(keg) {
                Ok(()) => break,
                Err(Error::LinkConflict {
                    path,
                    owner: Some(owner),
                }) if owner.name == keg.id.name && owner.version < keg.id.version => {
                    let mut older = match self.cellar.lookup(&owner.name, Some(&owner.version))? {
                        Some(older) if older.is_linked() => older,
                        // A stray link into an older keg that is not linked
                        _ => {
                            return Err(Error::LinkConflict {
                                path,
                                owner: Some(owner),
                            });
                        }
                    };
                    info!("Upgrading {}: unlinking {}", keg.id, older.id);
                    self.linker.unlink(&mut older)?;
                    run.undo.push(Undo::Relink(older.id.clone()));
                    run.report.superseded.push(older.id);
                }
                Err(e) => return Err(e),
            }
        }
        run.undo.push(Undo::Unlink(keg.id.clone()));

        for mut other in self.cellar.versions(keg.name())? {
            if other.is_linked() && other.id.version < keg.id.version {
                info!("Superseding {} with {}", other.id, keg.id);
                self.linker.unlink(&mut other)?;
                run.undo.push(Undo::Relink(other.id.clone()));
                run.report.superseded.push(other.id);
            }
        }
        Ok(())
    }

    /// Undo steps newest first; returns what could not be undone
    fn roll_back(&self, undo: Vec<Undo>) -> Vec<String> {
        let mut warnings = Vec::new();
        for step in undo.into_iter().rev() {
            debug!("Rollback: {}", step);
            match self.undo_step(&step) {
                Ok(step_warnings) => warnings.extend(
                    step_warnings
                        .into_iter()
                        .map(|w| format!("{}: {}", step, w)),
                ),
                Err(e) => {
                    warn!("Rollback step '{}' failed: {}", step, e);
                    warnings.push(format!("{}: {}", step, e));
                }
            }
        }
        warnings
    }

    fn undo_step(&self, step: &Undo) -> Result<Vec<String>> {
        match step {
            Undo::Remove(id) => {
                let Some(mut keg) = self.cellar.lookup(&id.name, Some(&id.version))? else {
                    return Ok(Vec::new());
                };
                let mut warnings = Vec::new();
                if keg.is_linked() {
                    warnings = self.linker.unlink(&mut keg)?.warnings;
                }
                self.cellar.remove(keg)?;
                Ok(warnings)
            }
            Undo::Unlink(id) => match self.cellar.lookup(&id.name, Some(&id.version))? {
                Some(mut keg) if keg.is_linked() => Ok(self.linker.unlink(&mut keg)?.warnings),
                _ => Ok(Vec::new()),
            },
            Undo::Relink(id) => {
                let mut keg = self
                    .cellar
                    .lookup(&id.name, Some(&id.version))?
                    .ok_or_else(|| Error::NotInstalled(id.to_string()))?;
                self.linker.link(&mut keg)?;
                Ok(Vec::new())
            }
        }
    }

    fn record_install(&self, changeset: &mut Changeset, report: &InstallReport) {
        let rows = report
            .installed
            .iter()
            .map(|keg| (keg.id.clone(), KegAction::Installed))
            .chain(report.relinked.iter().map(|id| (id.clone(), KegAction::Linked)))
            .chain(
                report
                    .superseded
                    .iter()
                    .map(|id| (id.clone(), KegAction::Superseded)),
            )
            .collect::<Vec<_>>();

        if let Err(e) = self.apply_changeset(changeset, &rows) {
            warn!("Failed to record install in history: {}", e);
        }
    }

    fn apply_changeset(&self, changeset: &mut Changeset, rows: &[(KegId, KegAction)]) -> Result<()> {
        let changeset_id = changeset
            .id
            .ok_or_else(|| Error::InitError("Changeset has not been inserted".to_string()))?;
        db::transaction(&self.conn, |tx| {
            for (id, action) in rows {
                ChangesetKeg::new(changeset_id, &id.name, id.version.as_str(), *action).insert(tx)?;
            }
            changeset.update_status(tx, ChangesetStatus::Applied)
        })
    }

    /// Run a single-keg operation under the prefix lock as one changeset
    fn recorded<T>(
        &self,
        operation: &str,
        description: String,
        f: impl FnOnce(&mut Vec<(KegId, KegAction)>) -> Result<T>,
    ) -> Result<T> {
        let _lock = PrefixLock::acquire(&self.config.lock_path(), &description)?;
        let mut changeset = Changeset::new(operation, description);
        changeset.insert(&self.conn)?;

        let mut rows = Vec::new();
        match f(&mut rows) {
            Ok(value) => {
                if let Err(e) = self.apply_changeset(&mut changeset, &rows) {
                    warn!("Failed to record {} in history: {}", operation, e);
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(db_err) = changeset.roll_back(&self.conn, &e.to_string()) {
                    warn!("Failed to record failed {} in history: {}", operation, db_err);
                }
                Err(e)
            }
        }
    }

    /// Unlink (if linked) and delete a keg; the newest version when none is given
    pub fn uninstall(&mut self, name: &str, version: Option<&Version>) -> Result<KegId> {
        self.recorded("uninstall", describe("Uninstall", name, version), |rows| {
            let mut keg = self.require(name, version)?;
            if keg.is_linked() {
                self.linker.unlink(&mut keg)?;
                rows.push((keg.id.clone(), KegAction::Unlinked));
            }
            let id = keg.id.clone();
            self.cellar.remove(keg)?;
            rows.push((id.clone(), KegAction::Removed));
            info!("Uninstalled {}", id);
            Ok(id)
        })
    }

    /// Link an installed keg; the newest version when none is given
    ///
    /// Unlike an install, an explicit link never unlinks other versions;
    /// a conflict with one of them is reported as is.
    pub fn link(&mut self, name: &str, version: Option<&Version>) -> Result<Keg> {
        self.recorded("link", describe("Link", name, version), |rows| {
            let mut keg = self.require(name, version)?;
            self.linker.link(&mut keg)?;
            rows.push((keg.id.clone(), KegAction::Linked));
            Ok(keg)
        })
    }

    /// Unlink a keg; without a version, whichever version is linked
    pub fn unlink(&mut self, name: &str, version: Option<&Version>) -> Result<UnlinkReport> {
        self.recorded("unlink", describe("Unlink", name, version), |rows| {
            let mut keg = match version {
                Some(_) => self.require(name, version)?,
                None => match self.cellar.versions(name)?.into_iter().rev().find(Keg::is_linked) {
                    Some(keg) => keg,
                    None => self.require(name, None)?,
                },
            };
            let report = self.linker.unlink(&mut keg)?;
            rows.push((keg.id.clone(), KegAction::Unlinked));
            Ok(report)
        })
    }

    pub fn lookup(&self, name: &str, version: Option<&Version>) -> Result<Option<Keg>> {
        self.cellar.lookup(name, version)
    }

    /// Every installed keg
    pub fn list(&self) -> Result<Vec<Keg>> {
        self.cellar.list()
    }

    /// Recorded changesets, newest first
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        Changeset::list_all(&self.conn)?
            .into_iter()
            .map(|changeset| {
                let kegs = changeset.kegs(&self.conn)?;
                Ok(HistoryEntry { changeset, kegs })
            })
            .collect()
    }

    fn require(&self, name: &str, version: Option<&Version>) -> Result<Keg> {
        self.cellar.lookup(name, version)?.ok_or_else(|| {
            Error::NotInstalled(match version {
                Some(version) => format!("{}@{}", name, version),
                None => name.to_string(),
            })
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Scratch directory for one formula's sources, removed on drop
    fn work_dir(&self, formula: &Formula) -> Result<tempfile::TempDir> {
        let root = self.config.state_dir.join("tmp");
        fs::create_dir_all(&root)?;
        Ok(tempfile::Builder::new()
            .prefix(&format!("{}-{}-", formula.name(), formula.version()))
            .tempdir_in(root)?)
    }
}

fn describe(verb: &str, name: &str, version: Option<&Version>) -> String {
    match version {
        Some(version) => format!("{} {}@{}", verb, name, version),
        None => format!("{} {}", verb, name),
    }
}

fn cancelled(formula: &Formula) -> Error {
    Error::BuildFailure {
        formula: formula.name().to_string(),
        reason: "cancelled".to_string(),
    }
}

fn as_build_failure(formula: &Formula, error: Error) -> Error {
    match error {
        Error::BuildFailure { .. } => error,
        other => Error::BuildFailure {
            formula: formula.name().to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cellar::KegState;
    use crate::formula::{Dependency, Source};
    use tempfile::TempDir;

    fn test_config(root: &TempDir) -> Config {
        let mut config = Config::for_prefix(root.path().join("prefix"));
        config.cellar = root.path().join("Cellar");
        config.state_dir = root.path().join("state");
        config
    }

    /// Formula whose build writes each of `files` into the staging directory
    fn formula(name: &str, version: &str, deps: &[&str], files: &[&str]) -> Formula {
        let files: Vec<String> = files.iter().map(|f| f.to_string()).collect();
        let label = format!("{}@{}", name, version);
        deps.iter()
            .fold(
                Formula::builder(name, Version::parse(version).unwrap()),
                |b, dep| b.depends_on(Dependency::any(*dep)),
            )
            .build_with(move |ctx: &BuildContext| -> Result<()> {
                for file in &files {
                    let path = ctx.staging_dir.join(file);
                    fs::create_dir_all(path.parent().unwrap())?;
                    fs::write(path, &label)?;
                }
                Ok(())
            })
            .build()
            .unwrap()
    }

    fn set(formulas: Vec<Formula>) -> FormulaSet {
        let mut set = FormulaSet::new();
        for f in formulas {
            set.insert(f).unwrap();
        }
        set
    }

    fn failure(err: &Error) -> &TransactionFailure {
        match err {
            Error::Transaction(failure) => failure,
            other => panic!("expected a transaction failure, got {:?}", other),
        }
    }

    #[test]
    fn test_undo_steps_display() {
        let id = KegId::new("git", Version::parse("1.0").unwrap());
        assert_eq!(Undo::Remove(id.clone()).to_string(), "remove git@1.0");
        assert_eq!(Undo::Relink(id).to_string(), "relink git@1.0");
    }

    #[test]
    fn test_install_links_chain_in_order() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![
            formula("app", "1.0", &["lib"], &["bin/app"]),
            formula("lib", "2.1", &[], &["lib/liblib.a", "include/lib.h"]),
        ]);

        let report = installer.install("app", &formulas).unwrap();

        let names: Vec<_> = report.installed.iter().map(|k| k.name()).collect();
        assert_eq!(names, vec!["lib", "app"]);
        assert!(report.installed.iter().all(|k| k.state == KegState::Linked));
        assert!(installer.prefix().join("include/lib.h").exists());
        assert_eq!(
            fs::read_to_string(installer.prefix().join("bin/app")).unwrap(),
            "app@1.0"
        );
    }

    #[test]
    fn test_reinstall_is_noop() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![formula("a", "1.0", &[], &["bin/a"])]);

        installer.install("a", &formulas).unwrap();
        let report = installer.install("a", &formulas).unwrap();
        assert!(report.installed.is_empty());
        assert!(report.relinked.is_empty());
    }

    #[test]
    fn test_install_links_existing_unlinked_keg() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![formula("a", "1.0", &[], &["bin/a"])]);

        installer.install("a", &formulas).unwrap();
        installer.unlink("a", None).unwrap();
        assert!(!installer.prefix().join("bin/a").exists());

        let report = installer.install("a", &formulas).unwrap();
        assert!(report.installed.is_empty());
        assert_eq!(report.relinked.len(), 1);
        assert!(installer.prefix().join("bin/a").exists());
    }

    #[test]
    fn test_empty_build_output_is_build_failure() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![formula("hollow", "1.0", &[], &[])]);

        let err = installer.install("hollow", &formulas).unwrap_err();
        let failure = failure(&err);
        assert_eq!(failure.phase, Phase::Build);
        assert!(matches!(
            failure.source,
            Error::BuildFailure { ref reason, .. } if reason == "nothing was installed"
        ));
        assert!(installer.list().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_install_rolls_back_and_clears_flag() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![formula("a", "1.0", &[], &["bin/a"])]);

        installer.cancel_handle().store(true, Ordering::SeqCst);
        let err = installer.install("a", &formulas).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::BuildFailure { reason, .. } if reason == "cancelled"
        ));
        assert!(installer.list().unwrap().is_empty());

        assert!(!installer.cancel_handle().load(Ordering::SeqCst));
        installer.install("a", &formulas).unwrap();
    }

    #[test]
    fn test_cancel_during_build_is_build_failure() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let cancel = installer.cancel_handle();
        let slow = Formula::builder("slow", Version::parse("1.0").unwrap())
            .build_with(move |ctx: &BuildContext| -> Result<()> {
                fs::write(ctx.staging_dir.join("out"), "partial")?;
                cancel.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        let err = installer.install("slow", &set(vec![slow])).unwrap_err();
        assert_eq!(failure(&err).phase, Phase::Build);
        assert!(installer.list().unwrap().is_empty());
    }

    #[test]
    fn test_fetch_failure_reports_fetch_phase() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let broken = Formula::builder("remote", Version::parse("1.0").unwrap())
            .source(Source {
                url: "file:///nonexistent/remote-1.0.tar.gz".to_string(),
                sha256: None,
            })
            .build_with(|_: &BuildContext| -> Result<()> { Ok(()) })
            .build()
            .unwrap();

        let err = installer.install("remote", &set(vec![broken])).unwrap_err();
        let failure = failure(&err);
        assert_eq!(failure.phase, Phase::Fetch);
        assert_eq!(failure.formula, "remote");
    }

    #[test]
    fn test_missing_dependency_touches_nothing() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![formula("app", "1.0", &["ghost"], &["bin/app"])]);

        let err = installer.install("app", &formulas).unwrap_err();
        assert_eq!(failure(&err).phase, Phase::Resolve);
        assert!(matches!(err.root_cause(), Error::MissingDependency { .. }));
        assert!(installer.history().unwrap().is_empty());
    }

    #[test]
    fn test_uninstall_unlinks_and_removes() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![formula("a", "1.0", &[], &["bin/a"])]);
        installer.install("a", &formulas).unwrap();

        let id = installer.uninstall("a", None).unwrap();
        assert_eq!(id.to_string(), "a@1.0");
        assert!(installer.lookup("a", None).unwrap().is_none());
        assert!(!installer.prefix().join("bin/a").exists());
        assert!(matches!(
            installer.uninstall("a", None),
            Err(Error::NotInstalled(_))
        ));
    }

    #[test]
    fn test_unlink_without_version_finds_linked_keg() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        installer
            .install("a", &set(vec![formula("a", "1.0", &[], &["bin/a"])]))
            .unwrap();
        installer
            .install("a", &set(vec![formula("a", "2.0", &[], &["bin/a"])]))
            .unwrap();
        installer.unlink("a", None).unwrap();
        installer.link("a", Some(&Version::parse("1.0").unwrap())).unwrap();

        let report = installer.unlink("a", None).unwrap();
        assert_eq!(report.removed, vec![PathBuf::from("bin/a")]);
        let v1 = installer
            .lookup("a", Some(&Version::parse("1.0").unwrap()))
            .unwrap()
            .unwrap();
        assert_eq!(v1.state, KegState::Unlinked);
    }

    #[test]
    fn test_link_looks_up_keg_after_taking_prefix_lock() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        installer
            .install("a", &set(vec![formula("a", "1.0", &[], &["bin/a"])]))
            .unwrap();
        installer.unlink("a", None).unwrap();

        // Another holder of the prefix lock removes the keg before releasing it
        let lock = PrefixLock::acquire(&installer.config().lock_path(), "test").unwrap();
        let keg_dir = installer
            .cellar()
            .keg_path("a", &Version::parse("1.0").unwrap());
        let holder = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            fs::remove_dir_all(&keg_dir).unwrap();
            drop(lock);
        });

        let err = installer.link("a", None).unwrap_err();
        holder.join().unwrap();
        assert!(matches!(err, Error::NotInstalled(_)), "got {:?}", err);
        assert!(fs::symlink_metadata(installer.prefix().join("bin/a")).is_err());

        let history = installer.history().unwrap();
        assert_eq!(history[0].changeset.operation, "link");
        assert_eq!(history[0].changeset.description, "Link a");
        assert_eq!(history[0].changeset.status, ChangesetStatus::RolledBack);
    }

    #[test]
    fn test_history_records_operations() {
        let root = TempDir::new().unwrap();
        let mut installer = Installer::new(test_config(&root)).unwrap();
        let formulas = set(vec![formula("a", "1.0", &[], &["bin/a"])]);
        installer.install("a", &formulas).unwrap();
        installer.unlink("a", None).unwrap();

        let history = installer.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].changeset.operation, "unlink");
        assert_eq!(history[1].changeset.operation, "install");
        assert_eq!(history[1].changeset.status, ChangesetStatus::Applied);
        assert_eq!(history[1].kegs.len(), 1);
        assert_eq!(history[1].kegs[0].action, KegAction::Installed);
    }
}
