// src/lib.rs

//! Brewer Package Manager
//!
//! Source-based package manager: formulas are built from source into
//! versioned, immutable kegs, and the active version of each is projected
//! into a shared prefix as symbolic links.
//!
//! # Architecture
//!
//! - Formulas: declarative package descriptions with dependency constraints
//! - Resolver: dependencies-first build order with cycle detection
//! - Cellar: one directory per keg, each with a JSON receipt holding its state
//! - Linker: symlink projection of kegs into the prefix, conflict-checked
//! - Transactions: all-or-nothing installs with rollback and a SQLite history

pub mod build;
pub mod cellar;
pub mod config;
pub mod db;
mod error;
pub mod fetch;
pub mod formula;
pub mod link;
pub mod resolver;
pub mod transaction;
pub mod version;

pub use error::{Error, Phase, Result, TransactionFailure};
