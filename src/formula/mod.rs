// src/formula/mod.rs

//! Formula descriptors
//!
//! A formula is plain data: identity, version, declared dependencies and
//! where to fetch the source. The only behaviour it carries is a handle to
//! a [`BuildProcedure`], invoked uniformly by the install transaction.
//! Descriptors are immutable once built; a different version is a
//! different descriptor.

pub mod loader;

use crate::build::BuildProcedure;
use crate::error::{Error, Result};
use crate::version::{Version, VersionConstraint};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

pub use loader::{load_dir, load_file};

/// A declared dependency on another formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub constraint: VersionConstraint,
}

impl Dependency {
    pub fn new(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
        }
    }

    /// Dependency accepting any version
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, VersionConstraint::Any)
    }
}

/// Where a formula's source comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub url: String,
    /// Expected SHA-256 of the downloaded archive, lowercase hex
    pub sha256: Option<String>,
}

/// Immutable description of one installable package
pub struct Formula {
    name: String,
    version: Version,
    dependencies: Vec<Dependency>,
    keg_only: bool,
    source: Option<Source>,
    homepage: Option<String>,
    description: Option<String>,
    build: Arc<dyn BuildProcedure>,
}

impl Formula {
    /// Start describing a formula
    pub fn builder(name: impl Into<String>, version: Version) -> FormulaBuilder {
        FormulaBuilder {
            name: name.into(),
            version,
            dependencies: Vec::new(),
            keg_only: false,
            source: None,
            homepage: None,
            description: None,
            build: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn keg_only(&self) -> bool {
        self.keg_only
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn homepage(&self) -> Option<&str> {
        self.homepage.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn build_procedure(&self) -> &dyn BuildProcedure {
        self.build.as_ref()
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("keg_only", &self.keg_only)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Builder for [`Formula`]; validation happens in [`FormulaBuilder::build`]
pub struct FormulaBuilder {
    name: String,
    version: Version,
    dependencies: Vec<Dependency>,
    keg_only: bool,
    source: Option<Source>,
    homepage: Option<String>,
    description: Option<String>,
    build: Option<Arc<dyn BuildProcedure>>,
}

impl FormulaBuilder {
    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn keg_only(mut self, keg_only: bool) -> Self {
        self.keg_only = keg_only;
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn homepage(mut self, homepage: impl Into<String>) -> Self {
        self.homepage = Some(homepage.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn build_with(mut self, procedure: impl BuildProcedure + 'static) -> Self {
        self.build = Some(Arc::new(procedure));
        self
    }

    pub fn build_with_arc(mut self, procedure: Arc<dyn BuildProcedure>) -> Self {
        self.build = Some(procedure);
        self
    }

    /// Validate and freeze the descriptor
    pub fn build(self) -> Result<Formula> {
        validate_name(&self.name)?;

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            validate_name(&dep.name)?;
            if !seen.insert(dep.name.as_str()) {
                return Err(Error::InvalidFormula(format!(
                    "{} declares dependency {} more than once",
                    self.name, dep.name
                )));
            }
        }

        let build = self.build.ok_or_else(|| {
            Error::InvalidFormula(format!("{} has no build procedure", self.name))
        })?;

        Ok(Formula {
            name: self.name,
            version: self.version,
            dependencies: self.dependencies,
            keg_only: self.keg_only,
            source: self.source,
            homepage: self.homepage,
            description: self.description,
            build,
        })
    }
}

/// Formula names become cellar directory names
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(char::is_whitespace)
    {
        return Err(Error::InvalidFormula(format!(
            "invalid formula name '{}'",
            name
        )));
    }
    Ok(())
}

/// The full descriptor set resolution runs against, keyed by name
#[derive(Debug, Default, Clone)]
pub struct FormulaSet {
    formulas: BTreeMap<String, Arc<Formula>>,
}

impl FormulaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor; a second descriptor with the same name is rejected
    pub fn insert(&mut self, formula: Formula) -> Result<()> {
        if self.formulas.contains_key(formula.name()) {
            return Err(Error::InvalidFormula(format!(
                "duplicate formula {}",
                formula.name()
            )));
        }
        self.formulas
            .insert(formula.name().to_string(), Arc::new(formula));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Formula>> {
        self.formulas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    /// All descriptors in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Formula>> {
        self.formulas.values()
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}
