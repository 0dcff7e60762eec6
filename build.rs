// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn store_arg() -> Arg {
    Arg::new("store")
        .short('d')
        .long("store")
        .value_name("PATH")
        .default_value("/var/lib/cellar/receipts.db")
        .help("Receipt database path")
}

fn catalog_arg() -> Arg {
    Arg::new("catalog")
        .short('c')
        .long("catalog")
        .value_name("DIR")
        .default_value("/etc/cellar/formulas")
        .help("Formula catalog directory")
}

fn with_arg() -> Arg {
    Arg::new("with")
        .long("with")
        .value_name("NAME")
        .action(clap::ArgAction::Append)
        .help("Enable an optional dependency (repeatable)")
}

fn build_cli() -> Command {
    Command::new("cellar")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Cellar Contributors")
        .about("Formula-driven source package builder")
        .subcommand_required(false)
        .subcommand(
            Command::new("install")
                .about("Build and install formulas with their dependencies")
                .arg(
                    Arg::new("names")
                        .required(true)
                        .num_args(1..)
                        .help("Formula names to install"),
                )
                .arg(catalog_arg())
                .arg(store_arg())
                .arg(
                    Arg::new("root")
                        .short('r')
                        .long("root")
                        .default_value("/usr/local")
                        .help("Install root directory"),
                )
                .arg(
                    Arg::new("cache")
                        .long("cache")
                        .default_value("/var/cache/cellar/sources")
                        .help("Source cache directory"),
                )
                .arg(
                    Arg::new("best_effort")
                        .long("best-effort")
                        .action(clap::ArgAction::SetTrue)
                        .help("Keep going after a failure instead of aborting"),
                )
                .arg(
                    Arg::new("parallel")
                        .short('j')
                        .long("parallel")
                        .action(clap::ArgAction::SetTrue)
                        .help("Build independent formulas concurrently"),
                )
                .arg(with_arg()),
        )
        .subcommand(
            Command::new("plan")
                .about("Show the install plan without building anything")
                .arg(
                    Arg::new("names")
                        .required(true)
                        .num_args(1..)
                        .help("Formula names to plan for"),
                )
                .arg(catalog_arg())
                .arg(store_arg())
                .arg(with_arg()),
        )
        .subcommand(
            Command::new("list")
                .about("List installed formulas")
                .arg(store_arg()),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Remove an installed formula and its files")
                .arg(Arg::new("name").required(true).help("Formula name to remove"))
                .arg(catalog_arg())
                .arg(store_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell"])
                        .help("Shell type"),
                ),
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
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("cellar.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
