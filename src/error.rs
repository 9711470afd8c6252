// src/error.rs

use crate::cellar::{KegId, KegState};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Core error types for Brewer
#[derive(Error, Debug)]
pub enum Error {
    /// A requested formula or one of its dependencies has no descriptor
    #[error("{}", missing_dependency_message(.dependent, .dependency))]
    MissingDependency {
        dependent: Option<String>,
        dependency: String,
    },

    /// A dependency exists but its version does not satisfy the declared constraint
    #[error("{dependent} requires {dependency} {constraint}, but only {found} is available")]
    UnsatisfiedConstraint {
        dependent: String,
        dependency: String,
        constraint: String,
        found: String,
    },

    /// The dependency graph contains a cycle
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A keg for this exact formula and version already exists in the cellar
    #[error("{0} is already installed")]
    AlreadyInstalled(KegId),

    /// No keg matches the lookup
    #[error("{0} is not installed")]
    NotInstalled(String),

    /// Operation attempted against a keg in the wrong lifecycle state
    #[error("Cannot {operation} {keg}: keg is {state}")]
    InvalidState {
        keg: KegId,
        state: KegState,
        operation: &'static str,
    },

    /// A prefix path is already claimed by another keg or an unmanaged file
    #[error("{}", link_conflict_message(.path, .owner))]
    LinkConflict {
        path: PathBuf,
        owner: Option<KegId>,
    },

    /// The external build step failed, timed out or was cancelled
    #[error("Build of {formula} failed: {reason}")]
    BuildFailure { formula: String, reason: String },

    /// Source download or extraction failure
    #[error("Failed to fetch {formula}: {reason}")]
    Fetch { formula: String, reason: String },

    /// Downloaded source does not match its declared checksum
    #[error("Checksum mismatch for {formula}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        formula: String,
        expected: String,
        actual: String,
    },

    /// Version string could not be parsed
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Formula descriptor is malformed
    #[error("Invalid formula: {0}")]
    InvalidFormula(String),

    /// A path would escape the tree it must stay inside
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// An install transaction failed and was rolled back
    #[error("{0}")]
    Transaction(Box<TransactionFailure>),

    /// Configuration file problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Receipt (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Formula or configuration TOML parse errors
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// HTTP errors while downloading sources
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),
}

impl Error {
    /// The error that originally caused a failure, looking through transaction wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Transaction(failure) => failure.source.root_cause(),
            other => other,
        }
    }

    /// Cleanup problems encountered while rolling back, if any
    pub fn cleanup_warnings(&self) -> &[String] {
        match self {
            Error::Transaction(failure) => &failure.cleanup_warnings,
            _ => &[],
        }
    }
}

fn missing_dependency_message(dependent: &Option<String>, dependency: &str) -> String {
    match dependent {
        Some(dependent) => format!("{} depends on {}, which has no formula", dependent, dependency),
        None => format!("No formula named {}", dependency),
    }
}

fn link_conflict_message(path: &std::path::Path, owner: &Option<KegId>) -> String {
    match owner {
        Some(owner) => format!("Cannot link {}: already linked by {}", path.display(), owner),
        None => format!(
            "Cannot link {}: path exists and is not managed by any keg",
            path.display()
        ),
    }
}

/// Phase of an install transaction, used to report where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolve,
    Fetch,
    Build,
    Adopt,
    Link,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolve => "resolve",
            Phase::Fetch => "fetch",
            Phase::Build => "build",
            Phase::Adopt => "adopt",
            Phase::Link => "link",
        };
        f.write_str(name)
    }
}

/// A failed install: the formula and phase that failed, the original
/// error, and any problems hit while undoing the transaction
#[derive(Debug)]
pub struct TransactionFailure {
    pub formula: String,
    pub phase: Phase,
    pub source: Error,
    pub cleanup_warnings: Vec<String>,
}

impl fmt::Display for TransactionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Install failed at {} of {}: {}",
            self.phase, self.formula, self.source
        )?;
        if !self.cleanup_warnings.is_empty() {
            write!(
                f,
                " ({} rollback warning(s): {})",
                self.cleanup_warnings.len(),
                self.cleanup_warnings.join("; ")
            )?;
        }
        Ok(())
    }
}

/// Result type alias using Brewer's Error type
pub type Result<T> = std::result::Result<T, Error>;
