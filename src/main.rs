// src/main.rs

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use pkgsync::control::{Command, PackageControl, Reporter, SuggestionKind};
use pkgsync::installer::Outcome;
use pkgsync::repository::HttpTransport;
use pkgsync::settings::TomlSettingsStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "pkgsync")]
#[command(author, version, about = "Keep a directory of package files in sync with a remote catalog", long_about = None)]
struct Cli {
    /// Settings file (default: <config dir>/pkgsync/pkgsync.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Install directory (default: <data dir>/pkgsync/packages)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Catalog cache directory (default: <cache dir>/pkgsync)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a package from the repository
    Install {
        /// Package name
        package: String,
    },
    /// Remove an installed package
    Remove {
        /// Package name
        package: String,
    },
    /// Update an installed package to the latest release
    Update {
        /// Package name
        package: String,
    },
    /// Remove a package and install it again from the repository
    Reinstall {
        /// Package name
        package: String,
    },
    /// Reinstall a package that was not installed through pkgsync
    ReinstallUntracked {
        /// Package name
        package: String,
    },
    /// Refresh the package list from the repository
    UpdateRepo,
    /// Update all tracked packages to the latest release
    UpdateAll,
    /// Reinstall all packages that were not installed through pkgsync
    ReinstallAllUntracked,
    /// Check installed packages against the tracked list
    Check,
    /// List candidate packages for a command
    List {
        /// Command to list candidates for
        #[arg(value_enum)]
        kind: ListKind,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ListKind {
    Install,
    Remove,
    Update,
    Reinstall,
    ReinstallUntracked,
}

impl From<ListKind> for SuggestionKind {
    fn from(kind: ListKind) -> Self {
        match kind {
            ListKind::Install => SuggestionKind::Install,
            ListKind::Remove => SuggestionKind::Remove,
            ListKind::Update => SuggestionKind::Update,
            ListKind::Reinstall => SuggestionKind::Reinstall,
            ListKind::ReinstallUntracked => SuggestionKind::ReinstallUntracked,
        }
    }
}

/// What to do once the client is built
enum Action {
    Run(Command),
    List(SuggestionKind),
}

/// Prints outcomes to stdout
struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, outcome: &Outcome) {
        if outcome.is_error() {
            eprintln!("{}", outcome);
        } else {
            println!("{}", outcome);
        }
    }
}

fn default_dir(base: Option<PathBuf>, what: &str) -> Result<PathBuf> {
    base.map(|dir| dir.join("pkgsync"))
        .with_context(|| format!("Unable to determine the {} directory, pass it explicitly", what))
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

    let action = match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pkgsync", &mut std::io::stdout());
            return Ok(());
        }
        Commands::List { kind } => Action::List(kind.into()),
        Commands::Install { package } => Action::Run(Command::Install(package)),
        Commands::Remove { package } => Action::Run(Command::Remove(package)),
        Commands::Update { package } => Action::Run(Command::Update(package)),
        Commands::Reinstall { package } => Action::Run(Command::Reinstall(package)),
        Commands::ReinstallUntracked { package } => {
            Action::Run(Command::ReinstallUntracked(package))
        }
        Commands::UpdateRepo => Action::Run(Command::UpdateRepo),
        Commands::UpdateAll => Action::Run(Command::UpdateAll),
        Commands::ReinstallAllUntracked => Action::Run(Command::ReinstallAllUntracked),
        Commands::Check => Action::Run(Command::Check),
    };

    let config = match cli.config {
        Some(path) => path,
        None => default_dir(dirs::config_dir(), "config")?.join("pkgsync.toml"),
    };
    let root = match cli.root {
        Some(path) => path,
        None => default_dir(dirs::data_dir(), "data")?.join("packages"),
    };
    let cache_dir = match cli.cache_dir {
        Some(path) => path,
        None => default_dir(dirs::cache_dir(), "cache")?,
    };

    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create install directory {}", root.display()))?;
    info!("Packages root path: {}", root.display());

    let store = Arc::new(TomlSettingsStore::new(&config));
    let transport = Arc::new(HttpTransport::new()?);
    let control = PackageControl::new(store, transport, &root, &cache_dir)?
        .with_reporter(Arc::new(ConsoleReporter));

    match action {
        Action::List(kind) => {
            let suggestions = control.suggest(kind)?;
            if suggestions.is_empty() {
                println!("No packages to list");
            }
            for suggestion in suggestions {
                println!(
                    "{} {}: {}",
                    suggestion.name, suggestion.version, suggestion.description
                );
            }
        }
        Action::Run(command) => {
            let report = control.execute(&command)?;
            if let Some(reconciliation) = &report.reconciliation {
                if reconciliation.is_clean() && report.outcomes.is_empty() {
                    println!("All tracked packages installed and up to date");
                }
                for filename in &reconciliation.untracked {
                    println!("Untracked: {}", filename);
                }
                if !control.settings().autoupdate {
                    for name in &reconciliation.outdated {
                        println!("Out of date: {}", name);
                    }
                }
            }
            if report.has_failures() {
                anyhow::bail!(
                    "{} package operation(s) failed",
                    report.failures().count()
                );
            }
        }
    }

    Ok(())
}
