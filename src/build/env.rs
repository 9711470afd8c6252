// src/build/env.rs

//! Build environment selection
//!
//! Compiler and flag selection is computed once per build invocation into
//! a [`BuildEnvironment`] value and handed to the build procedure. Nothing
//! here touches the process environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Flags added to every CFLAGS/CXXFLAGS: keep signal to noise high
pub const SAFE_CFLAGS: &str = "-w -pipe";

/// Variables copied from the invoking environment into every build
const PASSTHROUGH_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM", "TMPDIR"];

/// Prefix that compilers already search, so no -isystem/-L flags are added for it
const SYSTEM_PREFIX: &str = "/usr/local";

/// Compiler optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    #[default]
    O3,
    Os,
}

impl OptLevel {
    pub fn flag(&self) -> &'static str {
        match self {
            OptLevel::O0 => "-O0",
            OptLevel::O1 => "-O1",
            OptLevel::O2 => "-O2",
            OptLevel::O3 => "-O3",
            OptLevel::Os => "-Os",
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flag()[1..])
    }
}

/// User-tunable build settings, read from the `[build]` config table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Parallel make jobs; defaults to the number of available CPUs
    pub jobs: Option<usize>,
    /// Per-build timeout in seconds; no timeout when unset
    pub timeout_secs: Option<u64>,
    pub optimization: OptLevel,
    /// C compiler override
    pub cc: Option<String>,
    /// C++ compiler override
    pub cxx: Option<String>,
}

/// The environment a single build runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    /// An environment with no variables at all
    pub fn empty() -> Self {
        Self {
            vars: BTreeMap::new(),
        }
    }

    /// Select compilers and flags for building against `prefix`
    ///
    /// `staging_dir` is where the build must install its files and is
    /// exported as `PREFIX`; `keg_path` is where those files will live once
    /// adopted into the cellar.
    pub fn compute(
        settings: &BuildSettings,
        prefix: &Path,
        staging_dir: &Path,
        keg_path: &Path,
    ) -> Self {
        let mut env = Self::empty();

        for key in PASSTHROUGH_VARS {
            if let Ok(value) = std::env::var(key) {
                env.set(*key, value);
            }
        }

        let jobs = settings.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        env.set("MAKEFLAGS", format!("-j{}", jobs));

        if prefix != Path::new(SYSTEM_PREFIX) {
            env.set("CPPFLAGS", format!("-isystem {}/include", prefix.display()));
            env.set("LDFLAGS", format!("-L{}/lib", prefix.display()));
            // CMake ignores the variables above
            env.set("CMAKE_PREFIX_PATH", prefix.display().to_string());
        }
        env.prepend("PATH", prefix.join("bin").display().to_string(), ":");

        let cc = settings.cc.clone().unwrap_or_else(|| "/usr/bin/cc".to_string());
        let cxx = settings
            .cxx
            .clone()
            .unwrap_or_else(|| "/usr/bin/c++".to_string());
        env.set("LD", cc.clone());
        env.set("CC", cc);
        env.set("CXX", cxx);

        let mut cflags = vec![settings.optimization.flag()];
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) && !cfg!(target_os = "macos") {
            cflags.push("-mfpmath=sse");
        }
        cflags.push(SAFE_CFLAGS);
        let cflags = cflags.join(" ");
        env.set("CFLAGS", cflags.clone());
        env.set("CXXFLAGS", cflags);

        env.set("PREFIX", staging_dir.display().to_string());
        env.set("KEG_PATH", keg_path.display().to_string());

        env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }

    /// All variables, sorted by name
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn append(&mut self, key: &str, value: impl AsRef<str>, separator: &str) {
        let value = value.as_ref();
        match self.vars.get_mut(key) {
            Some(existing) if !existing.is_empty() => {
                existing.push_str(separator);
                existing.push_str(value);
            }
            _ => self.set(key, value),
        }
    }

    pub fn prepend(&mut self, key: &str, value: impl AsRef<str>, separator: &str) {
        let value = value.as_ref();
        match self.vars.get_mut(key) {
            Some(existing) if !existing.is_empty() => {
                *existing = format!("{}{}{}", value, separator, existing);
            }
            _ => self.set(key, value),
        }
    }

    /// Drop whitespace-separated tokens of `key` matching `pred`; an emptied
    /// variable is removed entirely
    pub fn remove_matching(&mut self, key: &str, pred: impl Fn(&str) -> bool) {
        let Some(existing) = self.vars.get(key) else {
            return;
        };
        let kept: Vec<&str> = existing.split_whitespace().filter(|t| !pred(t)).collect();
        if kept.is_empty() {
            self.vars.remove(key);
        } else {
            let joined = kept.join(" ");
            self.set(key, joined);
        }
    }

    /// Drop an exact flag from `key`
    pub fn remove(&mut self, key: &str, flag: &str) {
        self.remove_matching(key, |t| t == flag);
    }

    pub fn append_to_cflags(&mut self, flag: &str) {
        self.append("CFLAGS", flag, " ");
        self.append("CXXFLAGS", flag, " ");
    }

    pub fn remove_from_cflags(&mut self, pred: impl Fn(&str) -> bool) {
        self.remove_matching("CFLAGS", &pred);
        self.remove_matching("CXXFLAGS", &pred);
    }

    /// Replace whatever -O flag is set with `level`
    pub fn set_optimization(&mut self, level: OptLevel) {
        self.remove_from_cflags(|t| t.starts_with("-O"));
        self.append_to_cflags(level.flag());
    }

    pub fn minimal_optimization(&mut self) {
        let flags = format!("-Os {}", SAFE_CFLAGS);
        self.set("CFLAGS", flags.clone());
        self.set("CXXFLAGS", flags);
    }

    pub fn no_optimization(&mut self) {
        self.set("CFLAGS", SAFE_CFLAGS);
        self.set("CXXFLAGS", SAFE_CFLAGS);
    }

    /// Some builds fail to compile when warnings are disabled
    pub fn enable_warnings(&mut self) {
        self.remove_from_cflags(|t| t == "-w");
    }

    /// Force a serial make
    pub fn deparallelize(&mut self) {
        self.remove_matching("MAKEFLAGS", |t| t.starts_with("-j"));
    }
}
