// src/main.rs

use anyhow::Result;
use cellar::build::{BuildExecutor, CancelToken};
use cellar::fetch::{HttpTransport, SourceCache, Transport};
use cellar::formula::{DirCatalog, InstallPaths};
use cellar::orchestrator::{
    FailurePolicy, InstallOptions, InstallReport, NodeOutcome, Orchestrator,
};
use cellar::store::ReceiptStore;
use clap::{CommandFactory, Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "cellar")]
#[command(author, version, about = "Formula-driven source package builder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and install formulas with their dependencies
    Install {
        /// Formula names to install
        #[arg(required = true)]
        names: Vec<String>,
        /// Formula catalog directory
        #[arg(short = 'c', long, default_value = "/etc/cellar/formulas")]
        catalog: PathBuf,
        /// Receipt database path
        #[arg(short = 'd', long, default_value = "/var/lib/cellar/receipts.db")]
        store: PathBuf,
        /// Install root (prefix, bin, etc, var live under it)
        #[arg(short = 'r', long, default_value = "/usr/local")]
        root: PathBuf,
        /// Source cache directory
        #[arg(long, default_value = "/var/cache/cellar/sources")]
        cache: PathBuf,
        /// Keep going after a failure instead of aborting
        #[arg(long)]
        best_effort: bool,
        /// Build independent formulas concurrently
        #[arg(short = 'j', long)]
        parallel: bool,
        /// Enable an optional dependency (repeatable)
        #[arg(long = "with", value_name = "NAME")]
        with: Vec<String>,
    },
    /// Show the install plan without building anything
    Plan {
        /// Formula names to plan for
        #[arg(required = true)]
        names: Vec<String>,
        /// Formula catalog directory
        #[arg(short = 'c', long, default_value = "/etc/cellar/formulas")]
        catalog: PathBuf,
        /// Receipt database path
        #[arg(short = 'd', long, default_value = "/var/lib/cellar/receipts.db")]
        store: PathBuf,
        /// Enable an optional dependency (repeatable)
        #[arg(long = "with", value_name = "NAME")]
        with: Vec<String>,
    },
    /// List installed formulas
    List {
        /// Receipt database path
        #[arg(short = 'd', long, default_value = "/var/lib/cellar/receipts.db")]
        store: PathBuf,
    },
    /// Remove an installed formula and its files
    Uninstall {
        /// Formula name to remove
        name: String,
        /// Formula catalog directory
        #[arg(short = 'c', long, default_value = "/etc/cellar/formulas")]
        catalog: PathBuf,
        /// Receipt database path
        #[arg(short = 'd', long, default_value = "/var/lib/cellar/receipts.db")]
        store: PathBuf,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn print_report(report: &InstallReport) {
    for (name, outcome) in report.outcomes() {
        match outcome {
            NodeOutcome::Installed { warnings } => {
                println!("  installed  {}", name);
                for warning in warnings {
                    println!("    warning: {}", warning);
                }
            }
            NodeOutcome::Skipped => println!("  up-to-date {}", name),
            NodeOutcome::Failed { reason, output } => {
                println!("  FAILED     {} ({})", name, reason);
                if let Some(output) = output {
                    for line in output.lines() {
                        println!("    | {}", line);
                    }
                }
            }
        }
    }
}

fn run_install(
    names: &[String],
    catalog: &Path,
    store: &Path,
    root: &Path,
    cache: &Path,
    options: &InstallOptions,
) -> Result<()> {
    let catalog = DirCatalog::new(catalog);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let cache = SourceCache::new(cache, transport)?;
    let executor = BuildExecutor::new();
    let store = ReceiptStore::open(store)?;
    let paths = InstallPaths::under_root(root);

    let orchestrator = Orchestrator::new(&catalog, &cache, &executor, &store, paths);
    let report = orchestrator.install(names, options, &CancelToken::new())?;

    print_report(&report);
    if !report.is_success() {
        anyhow::bail!("some formulas failed to install");
    }
    Ok(())
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
        Some(Commands::Install {
            names,
            catalog,
            store,
            root,
            cache,
            best_effort,
            parallel,
            with,
        }) => {
            info!("Installing {:?}", names);
            let options = InstallOptions {
                policy: if best_effort {
                    FailurePolicy::BestEffort
                } else {
                    FailurePolicy::FailFast
                },
                include_optional: with.into_iter().collect::<HashSet<_>>(),
                parallel,
            };
            run_install(&names, &catalog, &store, &root, &cache, &options)
        }
        Some(Commands::Plan {
            names,
            catalog,
            store,
            with,
        }) => {
            let catalog = DirCatalog::new(catalog);
            let store = ReceiptStore::open(&store)?;
            // Planning never fetches; a throwaway cache satisfies the wiring.
            let scratch = tempfile::tempdir()?;
            let cache = SourceCache::new(
                scratch.path(),
                Arc::new(HttpTransport::new()?) as Arc<dyn Transport>,
            )?;
            let executor = BuildExecutor::new();
            let orchestrator = Orchestrator::new(
                &catalog,
                &cache,
                &executor,
                &store,
                InstallPaths::under_root(Path::new("/usr/local")),
            );

            let options = InstallOptions {
                include_optional: with.into_iter().collect::<HashSet<_>>(),
                ..Default::default()
            };
            let plan = orchestrator.plan(&names, &options)?;

            if plan.is_empty() {
                println!("Nothing to do.");
            } else {
                println!("Install plan ({} node(s)):", plan.len());
                for node in plan.nodes() {
                    let status = if node.skip_build { "up-to-date" } else { "build" };
                    println!(
                        "  {} {} {}",
                        status, node.formula.name, node.formula.version
                    );
                }
            }
            Ok(())
        }
        Some(Commands::List { store }) => {
            let store = ReceiptStore::open(&store)?;
            let receipts = store.list()?;

            if receipts.is_empty() {
                println!("No formulas installed.");
            } else {
                println!("Installed formulas:");
                for receipt in &receipts {
                    print!("  {} {}", receipt.name, receipt.version_spec);
                    if !receipt.build_options.is_empty() {
                        print!(" [with: {}]", receipt.build_options.join(", "));
                    }
                    println!(" ({} files)", receipt.installed_paths.len());
                }
                println!("\nTotal: {} formula(s)", receipts.len());
            }
            Ok(())
        }
        Some(Commands::Uninstall {
            name,
            catalog,
            store,
        }) => {
            info!("Uninstalling {}", name);
            let catalog = DirCatalog::new(catalog);
            let store = ReceiptStore::open(&store)?;
            let scratch = tempfile::tempdir()?;
            let cache = SourceCache::new(
                scratch.path(),
                Arc::new(HttpTransport::new()?) as Arc<dyn Transport>,
            )?;
            let executor = BuildExecutor::new();
            let orchestrator = Orchestrator::new(
                &catalog,
                &cache,
                &executor,
                &store,
                InstallPaths::under_root(Path::new("/usr/local")),
            );

            let receipt = orchestrator.uninstall(&name)?;
            println!(
                "Removed {} {} ({} files)",
                receipt.name,
                receipt.version_spec,
                receipt.installed_paths.len()
            );
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "cellar", &mut std::io::stdout());
            Ok(())
        }
        None => {
            // No command provided, show help
            println!("Cellar Formula Engine v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'cellar --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_install_flags() {
        let cli = Cli::parse_from([
            "cellar",
            "install",
            "openconnect-keychain",
            "--best-effort",
            "--parallel",
            "--with",
            "stoken",
        ]);
        match cli.command {
            Some(Commands::Install {
                names,
                best_effort,
                parallel,
                with,
                ..
            }) => {
                assert_eq!(names, vec!["openconnect-keychain"]);
                assert!(best_effort);
                assert!(parallel);
                assert_eq!(with, vec!["stoken"]);
            }
            _ => panic!("expected install command"),
        }
    }

    #[test]
    fn test_install_requires_names() {
        assert!(Cli::try_parse_from(["cellar", "install"]).is_err());
    }
}
