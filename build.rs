// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn keg_arg(help: &'static str) -> Arg {
    Arg::new("keg").required(true).value_name("NAME[@VERSION]").help(help)
}

fn formula_dir_arg() -> Arg {
    Arg::new("formula_dir")
        .short('f')
        .long("formula-dir")
        .value_name("DIR")
        .help("Directory of <name>.toml formula files (default: formula_dir from config)")
}

fn build_cli() -> Command {
    Command::new("brewer")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Brewer Contributors")
        .about("Source-based package manager with versioned kegs and transactional installs")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .global(true)
                .env("BREWER_CONFIG")
                .default_value("/etc/brewer.toml")
                .help("Configuration file"),
        )
        .subcommand(Command::new("init").about("Create the prefix, cellar and history database"))
        .subcommand(
            Command::new("install")
                .about("Build and install a formula and its dependencies")
                .arg(Arg::new("name").required(true).help("Formula name"))
                .arg(formula_dir_arg()),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Unlink and delete an installed keg")
                .arg(keg_arg("Keg to remove (newest version if omitted)")),
        )
        .subcommand(
            Command::new("link")
                .about("Link an installed keg into the prefix")
                .arg(keg_arg("Keg to link (newest version if omitted)")),
        )
        .subcommand(
            Command::new("unlink")
                .about("Remove a keg's links from the prefix, keeping the keg")
                .arg(keg_arg("Keg to unlink (the linked version if omitted)")),
        )
        .subcommand(
            Command::new("list").about("List installed kegs").arg(
                Arg::new("linked")
                    .long("linked")
                    .action(ArgAction::SetTrue)
                    .help("Only show kegs currently linked into the prefix"),
            ),
        )
        .subcommand(
            Command::new("info")
                .about("Show installed versions of a formula and its description")
                .arg(Arg::new("name").required(true).help("Formula name"))
                .arg(formula_dir_arg()),
        )
        .subcommand(Command::new("history").about("Show transaction history"))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(Arg::new("shell").required(true).help("bash, zsh, fish, elvish or powershell")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("brewer.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
