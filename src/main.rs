// src/main.rs

use anyhow::{Context, Result, anyhow};
use brewer::cellar::Keg;
use brewer::config::{Config, DEFAULT_CONFIG_PATH};
use brewer::db::models::ChangesetStatus;
use brewer::formula::{FormulaSet, loader};
use brewer::transaction::Installer;
use brewer::version::Version;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "brewer")]
#[command(author, version, about = "Source-based package manager with versioned kegs and transactional installs", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "BREWER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the prefix, cellar and history database
    Init,
    /// Build and install a formula and its dependencies
    Install {
        /// Formula name
        name: String,
        /// Directory of <name>.toml formula files (default: formula_dir from config)
        #[arg(short, long)]
        formula_dir: Option<PathBuf>,
    },
    /// Unlink and delete an installed keg
    Uninstall {
        /// Keg as name or name@version (newest version if omitted)
        keg: String,
    },
    /// Link an installed keg into the prefix
    Link {
        /// Keg as name or name@version (newest version if omitted)
        keg: String,
    },
    /// Remove a keg's links from the prefix, keeping the keg
    Unlink {
        /// Keg as name or name@version (the linked version if omitted)
        keg: String,
    },
    /// List installed kegs
    List {
        /// Only show kegs currently linked into the prefix
        #[arg(long)]
        linked: bool,
    },
    /// Show installed versions of a formula and its description
    Info {
        /// Formula name
        name: String,
        /// Directory of <name>.toml formula files (default: formula_dir from config)
        #[arg(short, long)]
        formula_dir: Option<PathBuf>,
    },
    /// Show transaction history
    History,
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Split `name@version` into its parts
fn parse_keg_arg(arg: &str) -> Result<(String, Option<Version>)> {
    match arg.split_once('@') {
        Some((name, version)) => {
            let version = Version::parse(version)
                .with_context(|| format!("Invalid version in '{}'", arg))?;
            Ok((name.to_string(), Some(version)))
        }
        None => Ok((arg.to_string(), None)),
    }
}

fn load_formulas(flag: Option<PathBuf>, config: &Config) -> Result<FormulaSet> {
    let dir = flag
        .or_else(|| config.formula_dir.clone())
        .ok_or_else(|| anyhow!("No formula directory: pass --formula-dir or set formula_dir in the config"))?;
    loader::load_dir(&dir)
        .with_context(|| format!("Failed to load formulas from {}", dir.display()))
}

fn open_installer(config_path: &Path) -> Result<Installer> {
    let config = Config::load(Some(config_path))
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    Ok(Installer::new(config)?)
}

fn print_keg(keg: &Keg) {
    print!("  {} {} ({})", keg.name(), keg.version(), keg.state);
    if keg.keg_only {
        print!(" [keg-only]");
    }
    println!();
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => {
            let installer = open_installer(&cli.config)?;
            let config = installer.config();
            println!("Initialized brewer");
            println!("  Prefix: {}", installer.prefix().display());
            println!("  Cellar: {}", installer.cellar().root().display());
            println!("  Database: {}", config.db_path().display());
            Ok(())
        }
        Some(Commands::Install { name, formula_dir }) => {
            let mut installer = open_installer(&cli.config)?;
            let formulas = load_formulas(formula_dir, installer.config())?;
            info!("Loaded {} formula(s)", formulas.len());

            let report = match installer.install(&name, &formulas) {
                Ok(report) => report,
                Err(e) => {
                    for warning in e.cleanup_warnings() {
                        eprintln!("warning: rollback: {}", warning);
                    }
                    return Err(e.into());
                }
            };

            if report.installed.is_empty() && report.relinked.is_empty() {
                println!("{} is already installed", name);
                return Ok(());
            }
            for keg in &report.installed {
                println!("Installed {} -> {}", keg.id, keg.store_path.display());
            }
            for id in &report.relinked {
                println!("Linked {}", id);
            }
            for id in &report.superseded {
                println!("Unlinked {} (superseded)", id);
            }
            Ok(())
        }
        Some(Commands::Uninstall { keg }) => {
            let (name, version) = parse_keg_arg(&keg)?;
            let mut installer = open_installer(&cli.config)?;
            let id = installer.uninstall(&name, version.as_ref())?;
            println!("Uninstalled {}", id);
            Ok(())
        }
        Some(Commands::Link { keg }) => {
            let (name, version) = parse_keg_arg(&keg)?;
            let mut installer = open_installer(&cli.config)?;
            let keg = installer.link(&name, version.as_ref())?;
            println!("Linked {} ({} links)", keg.id, keg.manifest.links.len());
            Ok(())
        }
        Some(Commands::Unlink { keg }) => {
            let (name, version) = parse_keg_arg(&keg)?;
            let mut installer = open_installer(&cli.config)?;
            let report = installer.unlink(&name, version.as_ref())?;
            println!("Unlinked {} ({} links removed)", name, report.removed.len());
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            Ok(())
        }
        Some(Commands::List { linked }) => {
            let installer = open_installer(&cli.config)?;
            let kegs = if linked {
                installer.cellar().linked_kegs()?
            } else {
                installer.list()?
            };

            if kegs.is_empty() {
                println!("No kegs installed.");
            } else {
                println!("Installed kegs:");
                for keg in &kegs {
                    print_keg(keg);
                }
                println!("\nTotal: {} keg(s)", kegs.len());
            }
            Ok(())
        }
        Some(Commands::Info { name, formula_dir }) => {
            let installer = open_installer(&cli.config)?;

            if formula_dir.is_some() || installer.config().formula_dir.is_some() {
                let formulas = load_formulas(formula_dir, installer.config())?;
                if let Some(formula) = formulas.get(&name) {
                    println!("{}", formula);
                    if let Some(description) = formula.description() {
                        println!("  {}", description);
                    }
                    if let Some(homepage) = formula.homepage() {
                        println!("  Homepage: {}", homepage);
                    }
                    for dep in formula.dependencies() {
                        println!("  Depends on: {} {}", dep.name, dep.constraint);
                    }
                    if formula.keg_only() {
                        println!("  Keg-only: not linked into the prefix");
                    }
                }
            }

            let kegs = installer.cellar().versions(&name)?;
            if kegs.is_empty() {
                println!("{} is not installed.", name);
            } else {
                println!("Installed versions:");
                for keg in &kegs {
                    print_keg(keg);
                    println!("    {}", keg.store_path.display());
                }
            }
            Ok(())
        }
        Some(Commands::History) => {
            let installer = open_installer(&cli.config)?;
            let history = installer.history()?;

            if history.is_empty() {
                println!("No transaction history.");
            } else {
                println!("Transaction history:");
                for entry in &history {
                    let changeset = &entry.changeset;
                    let timestamp = changeset
                        .applied_at
                        .as_ref()
                        .or(changeset.rolled_back_at.as_ref())
                        .or(changeset.created_at.as_ref())
                        .map(|s| s.as_str())
                        .unwrap_or("pending");

                    println!(
                        "  [{}] {} - {} ({})",
                        changeset.id.unwrap_or_default(),
                        timestamp,
                        changeset.description,
                        changeset.status
                    );
                    for keg in &entry.kegs {
                        println!("      {} {}@{}", keg.action, keg.name, keg.version);
                    }
                    if changeset.status == ChangesetStatus::RolledBack
                        && let Some(error) = &changeset.error
                    {
                        println!("      error: {}", error);
                    }
                }
                println!("\nTotal: {} transaction(s)", history.len());
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "brewer", &mut io::stdout());
            Ok(())
        }
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}
