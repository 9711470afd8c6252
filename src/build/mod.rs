// src/build/mod.rs

//! Build collaborator interface
//!
//! The install transaction treats building as opaque: it hands a
//! [`BuildProcedure`] a [`BuildContext`] (source tree, empty staging
//! directory, computed environment) and expects installed files in the
//! staging directory or an error. Any error, timeout or cancellation is
//! surfaced as [`Error::BuildFailure`].

pub mod env;

use crate::error::{Error, Result};
use crate::formula::Formula;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use wait_timeout::ChildExt;

pub use env::{BuildEnvironment, BuildSettings, OptLevel};

/// How often a running build is checked for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lines of build output quoted in a failure message
const LOG_TAIL_LINES: usize = 20;

/// Everything a build procedure may use
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub formula: Arc<Formula>,
    /// Unpacked source tree (empty for formulas without a source)
    pub source_dir: PathBuf,
    /// Fresh, empty directory the build installs into
    pub staging_dir: PathBuf,
    /// Final location of the keg once adopted
    pub keg_path: PathBuf,
    pub env: BuildEnvironment,
    pub timeout: Option<Duration>,
    pub cancel: Arc<AtomicBool>,
}

impl BuildContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Shorthand for a `BuildFailure` attributed to this formula
    pub fn failure(&self, reason: impl Into<String>) -> Error {
        Error::BuildFailure {
            formula: self.formula.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// A formula's build step
pub trait BuildProcedure: Send + Sync {
    /// Produce installed files under `ctx.staging_dir`
    fn build(&self, ctx: &BuildContext) -> Result<()>;
}

impl<F> BuildProcedure for F
where
    F: Fn(&BuildContext) -> Result<()> + Send + Sync,
{
    fn build(&self, ctx: &BuildContext) -> Result<()> {
        self(ctx)
    }
}

/// Build procedure that runs shell commands in the source tree
#[derive(Debug, Clone, Default)]
pub struct ScriptBuild {
    pub commands: Vec<String>,
    /// Extra variables set on top of the computed environment
    pub env: BTreeMap<String, String>,
    pub deparallelize: bool,
    pub optimization: Option<OptLevel>,
}

impl ScriptBuild {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn environment(&self, ctx: &BuildContext) -> BuildEnvironment {
        let mut env = ctx.env.clone();
        if self.deparallelize {
            env.deparallelize();
        }
        if let Some(level) = self.optimization {
            env.set_optimization(level);
        }
        for (key, value) in &self.env {
            env.set(key.clone(), value.clone());
        }
        env
    }

    fn run_command(
        &self,
        ctx: &BuildContext,
        env: &BuildEnvironment,
        command: &str,
        started: Instant,
    ) -> Result<()> {
        let log_path = ctx.source_dir.join(".brewer-build.log");
        let log = File::options().create(true).append(true).open(&log_path)?;

        debug!("[{}] $ {}", ctx.formula.name(), command);

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.source_dir)
            .env_clear()
            .envs(env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| ctx.failure(format!("failed to spawn '{}': {}", command, e)))?;

        let status = loop {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                break status;
            }
            if ctx.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ctx.failure("cancelled"));
            }
            if let Some(timeout) = ctx.timeout
                && started.elapsed() >= timeout
            {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ctx.failure(format!(
                    "timed out after {} seconds",
                    timeout.as_secs()
                )));
            }
        };

        if status.success() {
            return Ok(());
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(ctx.failure(format!(
            "'{}' exited with {}{}",
            command,
            code,
            log_tail(&log_path)
        )))
    }
}

impl BuildProcedure for ScriptBuild {
    fn build(&self, ctx: &BuildContext) -> Result<()> {
        let env = self.environment(ctx);
        let started = Instant::now();

        info!(
            "Building {} ({} command(s))",
            ctx.formula,
            self.commands.len()
        );
        for command in &self.commands {
            self.run_command(ctx, &env, command, started)?;
        }
        Ok(())
    }
}

fn log_tail(path: &std::path::Path) -> String {
    let mut bytes = Vec::new();
    if File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .is_err()
    {
        return String::new();
    }
    // Compilers and configure scripts may print text in any encoding
    let contents = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = contents.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    format!(":\n{}", lines[start..].join("\n"))
}
