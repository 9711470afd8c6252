// src/formula/loader.rs

//! Formula descriptor provider backed by TOML files
//!
//! One formula per `<name>.toml` file. Build steps are shell commands run
//! by [`ScriptBuild`].

use super::{Dependency, Formula, FormulaSet, Source};
use crate::build::{OptLevel, ScriptBuild};
use crate::error::{Error, Result};
use crate::version::{Version, VersionConstraint};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FormulaFile {
    name: Option<String>,
    version: String,
    homepage: Option<String>,
    description: Option<String>,
    #[serde(default)]
    keg_only: bool,
    source: Option<SourceTable>,
    #[serde(default)]
    dependencies: Vec<DependencyTable>,
    #[serde(default)]
    build: BuildTable,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceTable {
    url: String,
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyTable {
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BuildTable {
    commands: Vec<String>,
    env: BTreeMap<String, String>,
    deparallelize: bool,
    optimization: Option<OptLevel>,
}

/// Parse a formula from TOML text; `fallback_name` is used when the file omits `name`
pub fn parse(contents: &str, fallback_name: &str) -> Result<Formula> {
    let file: FormulaFile = toml::from_str(contents)?;

    let name = match file.name {
        Some(name) if name != fallback_name && !fallback_name.is_empty() => {
            return Err(Error::InvalidFormula(format!(
                "formula file for {} declares name {}",
                fallback_name, name
            )));
        }
        Some(name) => name,
        None => fallback_name.to_string(),
    };

    let version = Version::parse(&file.version)?;
    let mut builder = Formula::builder(name, version).keg_only(file.keg_only);

    if let Some(source) = file.source {
        let sha256 = source.sha256.map(|s| s.trim().to_ascii_lowercase());
        if let Some(ref sum) = sha256
            && (sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(Error::InvalidFormula(format!(
                "sha256 '{}' is not a 64-digit hex digest",
                sum
            )));
        }
        builder = builder.source(Source {
            url: source.url,
            sha256,
        });
    }
    if let Some(homepage) = file.homepage {
        builder = builder.homepage(homepage);
    }
    if let Some(description) = file.description {
        builder = builder.description(description);
    }
    for dep in file.dependencies {
        let constraint = VersionConstraint::parse(&dep.version)?;
        builder = builder.depends_on(Dependency::new(dep.name, constraint));
    }

    let script = ScriptBuild {
        commands: file.build.commands,
        env: file.build.env,
        deparallelize: file.build.deparallelize,
        optimization: file.build.optimization,
    };

    builder.build_with(script).build()
}

/// Load a single `<name>.toml` formula file
pub fn load_file(path: &Path) -> Result<Formula> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::InvalidFormula(format!("bad formula path {}", path.display())))?;
    let contents = fs::read_to_string(path)?;

    parse(&contents, stem).map_err(|e| match e {
        Error::TomlParse(inner) => {
            Error::InvalidFormula(format!("{}: {}", path.display(), inner))
        }
        other => other,
    })
}

/// Load every `*.toml` file in `dir` into a descriptor set
pub fn load_dir(dir: &Path) -> Result<FormulaSet> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut set = FormulaSet::new();
    for path in paths {
        debug!("Loading formula {}", path.display());
        set.insert(load_file(&path)?)?;
    }
    Ok(set)
}
