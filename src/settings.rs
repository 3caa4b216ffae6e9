// src/settings.rs

//! User settings
//!
//! The settings file is TOML with a single `[main]` table:
//!
//! ```toml
//! [main]
//! repository = "https://example.com/packages.json"
//! alternate_repository = "https://mirror.example.com/packages.json"
//! installed_packages = """
//! Foo
//! Bar
//! """
//! autoupdate = true
//! update_interval = 12
//! ```
//!
//! `installed_packages` is the tracked set. It is newline-delimited, though
//! a TOML array is accepted too. Duplicates collapse on load.

use crate::error::{Error, Result};
use crate::filesystem::write_atomic;
use crate::repository::{MirrorRole, Relocation};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Catalog URL used when none is configured
pub const DEFAULT_REPOSITORY: &str = "http://ueffel.bplaced.de/uni/packages.json";

/// Outdated packages are updated during reconciliation by default
pub const DEFAULT_AUTOUPDATE: bool = true;

/// Hours a fetched catalog stays fresh
pub const DEFAULT_UPDATE_INTERVAL_HOURS: f64 = 12.0;

const MAIN_SECTION: &str = "main";

/// Package names the user has asked to keep installed
pub type TrackedSet = BTreeSet<String>;

/// Effective settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub repository: String,
    pub alternate_repository: Option<String>,
    pub tracked: TrackedSet,
    pub autoupdate: bool,
    pub update_interval_hours: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repository: DEFAULT_REPOSITORY.to_string(),
            alternate_repository: None,
            tracked: TrackedSet::new(),
            autoupdate: DEFAULT_AUTOUPDATE,
            update_interval_hours: DEFAULT_UPDATE_INTERVAL_HOURS,
        }
    }
}

impl Settings {
    /// Catalog cache lifetime; negative or non-finite values mean "always refetch"
    pub fn update_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.update_interval_hours * 3600.0).unwrap_or(Duration::ZERO)
    }

    /// Point the relocated mirror at its new URL; returns true if anything changed
    pub fn apply_relocation(&mut self, relocation: &Relocation) -> bool {
        let slot = match relocation.role {
            MirrorRole::Primary => &mut self.repository,
            MirrorRole::Alternate => self.alternate_repository.get_or_insert_with(String::new),
        };
        if *slot == relocation.to {
            return false;
        }
        *slot = relocation.to.clone();
        true
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Invalid settings: {}", e)))?;
        let main = file.main;

        let mut update_interval_hours = main.update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL_HOURS);
        if !update_interval_hours.is_finite() || update_interval_hours < 0.0 {
            warn!(
                "Invalid update_interval {}, using {}",
                update_interval_hours, DEFAULT_UPDATE_INTERVAL_HOURS
            );
            update_interval_hours = DEFAULT_UPDATE_INTERVAL_HOURS;
        }

        Ok(Self {
            repository: main
                .repository
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string()),
            alternate_repository: main.alternate_repository.filter(|r| !r.trim().is_empty()),
            tracked: main.installed_packages,
            autoupdate: main.autoupdate.unwrap_or(DEFAULT_AUTOUPDATE),
            update_interval_hours,
        })
    }

    /// Write the persisted keys into an existing TOML document
    ///
    /// Only the repository URLs and the tracked list are written. Anything
    /// else the user put in the file is left alone.
    pub fn merge_into(&self, existing: &str) -> Result<String> {
        let mut doc: toml::Table = if existing.trim().is_empty() {
            toml::Table::new()
        } else {
            toml::from_str(existing)
                .map_err(|e| Error::ConfigError(format!("Invalid settings: {}", e)))?
        };

        let main = doc
            .entry(MAIN_SECTION)
            .or_insert(toml::Value::Table(toml::Table::new()));
        if !main.is_table() {
            *main = toml::Value::Table(toml::Table::new());
        }
        let Some(main) = main.as_table_mut() else {
            return Err(Error::ConfigError("[main] is not a table".to_string()));
        };

        main.insert(
            "repository".to_string(),
            toml::Value::String(self.repository.clone()),
        );
        match &self.alternate_repository {
            Some(alternate) => {
                main.insert(
                    "alternate_repository".to_string(),
                    toml::Value::String(alternate.clone()),
                );
            }
            None => {
                main.remove("alternate_repository");
            }
        }
        main.insert(
            "installed_packages".to_string(),
            toml::Value::String(format_package_list(&self.tracked)),
        );

        toml::to_string(&doc)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize settings: {}", e)))
    }
}

/// Newline-delimited list with a trailing newline
fn format_package_list(tracked: &TrackedSet) -> String {
    let mut out = String::new();
    for name in tracked {
        out.push_str(name);
        out.push('\n');
    }
    out
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    main: MainSection,
}

#[derive(Debug, Default, Deserialize)]
struct MainSection {
    #[serde(default)]
    repository: Option<String>,
    #[serde(default)]
    alternate_repository: Option<String>,
    #[serde(default, deserialize_with = "deserialize_package_list")]
    installed_packages: TrackedSet,
    #[serde(default)]
    autoupdate: Option<bool>,
    #[serde(default)]
    update_interval: Option<f64>,
}

fn deserialize_package_list<'de, D>(deserializer: D) -> std::result::Result<TrackedSet, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PackageList {
        Lines(String),
        Items(Vec<String>),
    }

    let names: Vec<String> = match PackageList::deserialize(deserializer)? {
        PackageList::Lines(text) => text.lines().map(str::to_string).collect(),
        PackageList::Items(items) => items,
    };

    Ok(names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

/// Where settings are read from and written to
pub trait SettingsStore: Send + Sync {
    /// Load settings; a missing store yields defaults
    fn load(&self) -> Result<Settings>;

    /// Persist the repository URLs and the tracked set
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings in a TOML file
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> Result<Settings> {
        debug!("Reading settings from {}", self.path.display());

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file, using defaults");
                return Ok(Settings::default());
            }
            Err(e) => {
                return Err(Error::ConfigError(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let settings = Settings::from_toml(&content)?;
        debug!("repository: {}", settings.repository);
        debug!("installed_packages: {:?}", settings.tracked);
        debug!("autoupdate: {}", settings.autoupdate);
        debug!("update_interval: {}", settings.update_interval_hours);
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        debug!("Saving settings to {}", self.path.display());

        let existing = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(Error::ConfigError(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let merged = match settings.merge_into(&existing) {
            Ok(merged) => merged,
            Err(e) => {
                warn!("Rewriting unreadable settings file: {}", e);
                settings.merge_into("")?
            }
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to create settings directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        write_atomic(&self.path, merged.as_bytes())
    }
}

/// Settings kept in memory, counting saves (embedding hosts and tests)
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
    saves: AtomicUsize,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
            saves: AtomicUsize::new(0),
        }
    }

    /// Last saved settings
    pub fn snapshot(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = TomlSettingsStore::new(dir.path().join("pkgsync.toml"));
        let settings = store.load().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.update_interval(), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_parse_newline_list_dedups() {
        let settings = Settings::from_toml(
            r#"
[main]
repository = "https://repo.example/packages.json"
alternate_repository = "https://mirror.example/packages.json"
installed_packages = """
Foo
Bar

Foo
"""
autoupdate = false
update_interval = 1.5
"#,
        )
        .unwrap();

        assert_eq!(settings.repository, "https://repo.example/packages.json");
        assert_eq!(
            settings.alternate_repository.as_deref(),
            Some("https://mirror.example/packages.json")
        );
        assert_eq!(
            settings.tracked.iter().collect::<Vec<_>>(),
            vec!["Bar", "Foo"]
        );
        assert!(!settings.autoupdate);
        assert_eq!(settings.update_interval(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_array_list() {
        let settings =
            Settings::from_toml("[main]\ninstalled_packages = [\"Foo\", \"Foo\", \" Baz \"]\n")
                .unwrap();
        assert_eq!(settings.tracked.len(), 2);
        assert!(settings.tracked.contains("Baz"));
        assert_eq!(settings.repository, DEFAULT_REPOSITORY);
    }

    #[test]
    fn test_invalid_interval_falls_back() {
        let settings = Settings::from_toml("[main]\nupdate_interval = -3.0\n").unwrap();
        assert_eq!(settings.update_interval_hours, DEFAULT_UPDATE_INTERVAL_HOURS);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            Settings::from_toml("[main\nrepository = "),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_save_round_trip_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf/pkgsync.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "[main]\nautoupdate = false\nupdate_interval = 2.0\n\n[extra]\nkeep = 1\n",
        )
        .unwrap();

        let store = TomlSettingsStore::new(&path);
        let mut settings = store.load().unwrap();
        settings.tracked.insert("Foo".to_string());
        settings.tracked.insert("Bar".to_string());
        settings.repository = "https://moved.example/packages.json".to_string();
        store.save(&settings).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, settings);
        assert!(!reloaded.autoupdate);
        assert!(fs::read_to_string(&path).unwrap().contains("[extra]"));
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = TomlSettingsStore::new(dir.path().join("a/b/pkgsync.toml"));
        store.save(&Settings::default()).unwrap();
        assert_eq!(store.load().unwrap(), Settings::default());
    }

    #[test]
    fn test_apply_relocation() {
        let mut settings = Settings::default();
        let moved = Relocation {
            role: MirrorRole::Alternate,
            from: "http://old".to_string(),
            to: "http://new".to_string(),
        };
        assert!(settings.apply_relocation(&moved));
        assert_eq!(settings.alternate_repository.as_deref(), Some("http://new"));
        assert_eq!(settings.repository, DEFAULT_REPOSITORY);
        assert!(!settings.apply_relocation(&moved));
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let store = MemorySettingsStore::new(Settings::default());
        let mut settings = store.load().unwrap();
        settings.tracked.insert("Foo".to_string());
        store.save(&settings).unwrap();
        assert_eq!(store.save_count(), 1);
        assert!(store.snapshot().tracked.contains("Foo"));
    }
}
