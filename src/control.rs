// src/control.rs

//! Package control: the command adapters
//!
//! `PackageControl` wires the catalog fetcher, the installer and the
//! settings store together behind a single command gate. Every command
//! reports one `Outcome` per package it touched through a `Reporter`, and
//! returns them as a `BatchReport`.

use crate::catalog::{Catalog, CatalogEntry, cache::CacheStore};
use crate::error::{Error, Result};
use crate::filesystem::list_installed;
use crate::gate::{CommandGate, Contention};
use crate::installer::{Installer, Outcome, OutcomeKind};
use crate::reconcile::{Reconciliation, reconcile};
use crate::repository::{CatalogFetcher, Transport};
use crate::settings::{Settings, SettingsStore};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Receives the terminal outcome of every package operation
pub trait Reporter: Send + Sync {
    fn report(&self, outcome: &Outcome);
}

/// Logs outcomes through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, outcome: &Outcome) {
        if outcome.is_error() {
            warn!("{}", outcome);
        } else {
            info!("{}", outcome);
        }
    }
}

/// A user command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Install(String),
    Remove(String),
    Update(String),
    /// Remove without persisting, then install
    Reinstall(String),
    /// Force-install a package whose file is present but not tracked
    ReinstallUntracked(String),
    /// Force a catalog refetch, then run the reconciliation pass
    UpdateRepo,
    /// Force a catalog refetch, then update every tracked package
    UpdateAll,
    /// Force-install every untracked file that resolves by filename
    ReinstallAllUntracked,
    /// Run the reconciliation pass
    Check,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Install(name) => write!(f, "install {}", name),
            Command::Remove(name) => write!(f, "remove {}", name),
            Command::Update(name) => write!(f, "update {}", name),
            Command::Reinstall(name) => write!(f, "reinstall {}", name),
            Command::ReinstallUntracked(name) => write!(f, "reinstall-untracked {}", name),
            Command::UpdateRepo => write!(f, "update-repo"),
            Command::UpdateAll => write!(f, "update-all"),
            Command::ReinstallAllUntracked => write!(f, "reinstall-all-untracked"),
            Command::Check => write!(f, "check"),
        }
    }
}

/// Commands that take a package argument, for suggestions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionKind {
    Install,
    Remove,
    Update,
    Reinstall,
    ReinstallUntracked,
}

/// A candidate package for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl Suggestion {
    fn from_entry(entry: &CatalogEntry) -> Self {
        let description = if entry.description().is_empty() {
            "no description".to_string()
        } else {
            entry.description().to_string()
        };
        Self {
            name: entry.name().to_string(),
            version: entry.version().to_string(),
            description,
        }
    }
}

/// Outcomes of one command, plus the drift sets when a pass ran
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<Outcome>,
    pub reconciliation: Option<Reconciliation>,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.is_error())
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(Outcome::is_error)
    }

    /// Outcomes of the given kind, by package name
    pub fn names(&self, kind: &OutcomeKind) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| &o.kind == kind)
            .map(|o| o.name.as_str())
            .collect()
    }
}

/// The package synchronization client
pub struct PackageControl {
    store: Arc<dyn SettingsStore>,
    settings: Mutex<Settings>,
    fetcher: CatalogFetcher,
    installer: Installer,
    gate: CommandGate,
    reporter: Arc<dyn Reporter>,
    untracked: Mutex<BTreeSet<String>>,
}

impl fmt::Debug for PackageControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageControl")
            .field("fetcher", &self.fetcher)
            .field("installer", &self.installer)
            .finish()
    }
}

impl PackageControl {
    /// Load settings from `store` and build the fetcher and installer
    pub fn new(
        store: Arc<dyn SettingsStore>,
        transport: Arc<dyn Transport>,
        install_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let settings = store.load()?;
        let install_root = install_root.into();
        debug!("Packages root path: {}", install_root.display());

        let fetcher = CatalogFetcher::new(
            transport.clone(),
            CacheStore::new(cache_dir),
            settings.repository.clone(),
            settings.alternate_repository.clone(),
            settings.update_interval(),
        );
        let installer = Installer::new(install_root, transport, store.clone());

        Ok(Self {
            store,
            settings: Mutex::new(settings),
            fetcher,
            installer,
            gate: CommandGate::new(),
            reporter: Arc::new(TracingReporter),
            untracked: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Current effective settings
    pub fn settings(&self) -> Settings {
        self.lock_settings().clone()
    }

    /// Untracked filenames found by the last pass
    pub fn untracked(&self) -> BTreeSet<String> {
        self.untracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fetcher(&self) -> &CatalogFetcher {
        &self.fetcher
    }

    fn lock_settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_untracked(&self, untracked: BTreeSet<String>) {
        *self.untracked.lock().unwrap_or_else(PoisonError::into_inner) = untracked;
    }

    /// Re-read the settings store after it changed on disk
    pub fn reload_settings(&self) -> Result<()> {
        debug!("Reading config");
        let settings = self.store.load()?;
        debug!("repo_url: {}", settings.repository);
        debug!("installed_packages: {:?}", settings.tracked);
        debug!("autoupdate: {}", settings.autoupdate);
        debug!("update_interval: {}", settings.update_interval_hours);

        self.fetcher.configure(
            settings.repository.clone(),
            settings.alternate_repository.clone(),
            settings.update_interval(),
        );
        *self.lock_settings() = settings;
        Ok(())
    }

    /// Fetch the catalog and persist any mirror relocation
    ///
    /// Must not be called with the settings lock held.
    fn catalog(&self, force: bool) -> Result<Arc<Catalog>> {
        let fetch = self.fetcher.fetch(force)?;
        if !fetch.relocations.is_empty() {
            let mut settings = self.lock_settings();
            let changed = fetch
                .relocations
                .iter()
                .fold(false, |changed, r| settings.apply_relocation(r) || changed);
            if changed && let Err(e) = self.store.save(&settings) {
                warn!("Failed to save relocated repository url: {}", e);
            }
        }
        Ok(fetch.catalog)
    }

    /// Run an installer operation on a copy of the settings
    ///
    /// The settings lock is not held during the transfer. The installer only
    /// changes the tracked set, so that is all that is written back.
    fn with_settings<T>(&self, op: impl FnOnce(&mut Settings) -> T) -> T {
        let mut settings = self.settings();
        let result = op(&mut settings);
        self.lock_settings().tracked = settings.tracked;
        result
    }

    fn record(&self, report: &mut BatchReport, name: &str, result: Result<Outcome>) {
        let outcome = result.unwrap_or_else(|e| Outcome::failed(name, &e));
        self.reporter.report(&outcome);
        report.outcomes.push(outcome);
    }

    fn not_found(&self, report: &mut BatchReport, name: &str) {
        self.record(report, name, Ok(Outcome::new(name, OutcomeKind::NotFound)));
    }

    /// Run a command; fails with `Error::Busy` if another one is running
    pub fn execute(&self, command: &Command) -> Result<BatchReport> {
        debug!("Executing command: {}", command);
        let _guard = self.gate.acquire(Contention::Reject)?;

        self.dispatch(command).inspect_err(|e| {
            error!("Error occurred while executing command '{}': {}", command, e);
        })
    }

    fn dispatch(&self, command: &Command) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        match command {
            Command::Install(name) => {
                let catalog = self.catalog(false)?;
                match catalog.get(name) {
                    Some(entry) => {
                        let result = self.with_settings(|s| self.installer.install(entry, s, false, true));
                        self.record(&mut report, name, result);
                    }
                    None => self.not_found(&mut report, name),
                }
            }
            Command::Remove(name) => {
                let catalog = self.catalog(false)?;
                match catalog.get(name) {
                    Some(entry) => {
                        let result = self.with_settings(|s| self.installer.remove(entry, s, true));
                        self.record(&mut report, name, result);
                    }
                    None => self.not_found(&mut report, name),
                }
            }
            Command::Update(name) => {
                let catalog = self.catalog(false)?;
                match catalog.get(name) {
                    Some(entry) => {
                        let result = self.with_settings(|s| self.installer.update(entry, s, false));
                        self.record(&mut report, name, result);
                    }
                    None => self.not_found(&mut report, name),
                }
            }
            Command::Reinstall(name) => {
                let catalog = self.catalog(false)?;
                match catalog.get(name) {
                    Some(entry) => {
                        let result = self.with_settings(|s| {
                            self.installer
                                .remove(entry, s, false)
                                .and_then(|_| self.installer.install(entry, s, false, true))
                        });
                        self.record(&mut report, name, result);
                    }
                    None => self.not_found(&mut report, name),
                }
            }
            Command::ReinstallUntracked(name) => {
                let catalog = self.catalog(false)?;
                match catalog.get(name) {
                    Some(entry) => {
                        let result = self.with_settings(|s| self.installer.install(entry, s, true, true));
                        self.record(&mut report, name, result);
                    }
                    None => self.not_found(&mut report, name),
                }
            }
            Command::UpdateRepo => {
                let catalog = self.catalog(true)?;
                return self.check_pass(&catalog);
            }
            Command::UpdateAll => {
                let catalog = self.catalog(true)?;
                let tracked = self.lock_settings().tracked.clone();
                for name in &tracked {
                    match catalog.get(name) {
                        Some(entry) => {
                            let result = self.with_settings(|s| self.installer.update(entry, s, false));
                            self.record(&mut report, name, result);
                        }
                        None => self.not_found(&mut report, name),
                    }
                }
                info!("Updating all packages finished");
            }
            Command::ReinstallAllUntracked => {
                let catalog = self.catalog(false)?;
                let untracked = self.refresh_untracked(&catalog)?;
                for filename in &untracked {
                    match catalog.get_by_filename(filename) {
                        Some(entry) => {
                            let result = self.with_settings(|s| self.installer.install(entry, s, true, false));
                            self.record(&mut report, entry.name(), result);
                        }
                        None => self.not_found(&mut report, filename),
                    }
                }
                let saved = self.store.save(&self.lock_settings());
                if let Err(e) = saved {
                    warn!("Failed to save settings: {}", e);
                    let installed: Vec<String> = report
                        .names(&OutcomeKind::Installed)
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    for name in installed {
                        let error = Error::ConfigError(format!("tracking not saved: {}", e));
                        self.record(&mut report, &name, Err(error));
                    }
                }
                info!("Reinstalling all untracked packages finished");
            }
            Command::Check => {
                let catalog = self.catalog(false)?;
                return self.check_pass(&catalog);
            }
        }

        Ok(report)
    }

    /// Candidate packages for a command, waiting for a running command first
    ///
    /// Only waits for the gate to clear; commands started meanwhile are not
    /// blocked by the listing.
    pub fn suggest(&self, kind: SuggestionKind) -> Result<Vec<Suggestion>> {
        if self.gate.is_busy() {
            info!("Another command is executing, waiting until it is finished");
        }
        self.gate.wait_idle();

        let catalog = self.catalog(false)?;
        let tracked = self.lock_settings().tracked.clone();

        let suggestions: Vec<Suggestion> = match kind {
            SuggestionKind::Install => {
                debug!("Suggesting packages to install");
                catalog
                    .entries()
                    .filter(|e| !tracked.contains(e.name()))
                    .map(Suggestion::from_entry)
                    .collect()
            }
            SuggestionKind::Remove | SuggestionKind::Update | SuggestionKind::Reinstall => {
                debug!("Suggesting packages to update/remove/reinstall");
                catalog
                    .entries()
                    .filter(|e| tracked.contains(e.name()))
                    .map(Suggestion::from_entry)
                    .collect()
            }
            SuggestionKind::ReinstallUntracked => {
                debug!("Suggesting packages to reinstall untracked");
                let untracked = self.refresh_untracked(&catalog)?;
                catalog
                    .entries()
                    .filter(|e| untracked.contains(e.filename()))
                    .map(Suggestion::from_entry)
                    .collect()
            }
        };

        Ok(suggestions)
    }

    /// Run the reconciliation pass, waiting for a running command first
    ///
    /// Hosts call this on start and whenever the settings file changes.
    pub fn check_installed(&self) -> Result<BatchReport> {
        let _guard = self.gate.acquire(Contention::Wait)?;
        let catalog = self.catalog(false)?;
        self.check_pass(&catalog)
    }

    /// Recompute the untracked set without repairing anything
    fn refresh_untracked(&self, catalog: &Catalog) -> Result<BTreeSet<String>> {
        let installed = list_installed(self.installer.root())?;
        let tracked = self.lock_settings().tracked.clone();
        let untracked = reconcile(&tracked, catalog, &installed).untracked;
        self.set_untracked(untracked.clone());
        Ok(untracked)
    }

    /// Repair missing packages, record untracked files, update outdated ones
    fn check_pass(&self, catalog: &Catalog) -> Result<BatchReport> {
        debug!("Checking installed packages");

        let installed = list_installed(self.installer.root())?;
        debug!("Filesystem packages: {:?}", installed.filenames().collect::<Vec<_>>());

        let (tracked, autoupdate) = {
            let settings = self.lock_settings();
            (settings.tracked.clone(), settings.autoupdate)
        };
        let reconciliation = reconcile(&tracked, catalog, &installed);
        let mut report = BatchReport::default();

        for name in &reconciliation.missing {
            debug!("Package '{}' not installed", name);
            if let Some(entry) = catalog.get(name) {
                let result = self.with_settings(|s| self.installer.install(entry, s, false, false));
                self.record(&mut report, name, result);
            }
        }

        if !reconciliation.untracked.is_empty() {
            info!(
                "{} package(s) not installed through pkgsync: {:?}",
                reconciliation.untracked.len(),
                reconciliation.untracked
            );
        }
        self.set_untracked(reconciliation.untracked.clone());

        if !reconciliation.outdated.is_empty() {
            info!(
                "{} package(s) are out of date: {:?}",
                reconciliation.outdated.len(),
                reconciliation.outdated
            );
            if autoupdate {
                for name in &reconciliation.outdated {
                    if let Some(entry) = catalog.get(name) {
                        let result = self.with_settings(|s| self.installer.update(entry, s, false));
                        self.record(&mut report, name, result);
                    }
                }
            }
        }

        report.reconciliation = Some(reconciliation);
        Ok(report)
    }
}
