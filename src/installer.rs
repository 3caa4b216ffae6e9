// src/installer.rs

//! Install, update, and remove package files
//!
//! Every download goes to a temp file in the install root and is renamed
//! over the final path only once the transfer is complete, with its mtime
//! already set to the release date. A failed transfer therefore never
//! leaves a file that looks installed.

use crate::catalog::{CatalogEntry, is_plain_filename};
use crate::error::{Error, Result};
use crate::filesystem::file_mtime;
use crate::repository::Transport;
use crate::settings::{Settings, SettingsStore};
use filetime::FileTime;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::Builder;
use tracing::{debug, info, warn};

/// Terminal result of a per-package operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    Installed,
    AlreadyInstalled,
    Updated,
    UpToDate,
    Removed,
    /// The name (or filename) did not resolve in the catalog
    NotFound,
    /// The operation failed; the message is the error
    Failed(String),
}

/// What happened to one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub name: String,
    pub kind: OutcomeKind,
}

impl Outcome {
    pub fn new(name: impl Into<String>, kind: OutcomeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn failed(name: impl Into<String>, error: &Error) -> Self {
        Self::new(name, OutcomeKind::Failed(error.to_string()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failed(_))
    }

    /// True for the success-path no-ops
    pub fn is_noop(&self) -> bool {
        matches!(
            self.kind,
            OutcomeKind::AlreadyInstalled | OutcomeKind::UpToDate | OutcomeKind::NotFound
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OutcomeKind::Installed => write!(f, "Installed package '{}'", self.name),
            OutcomeKind::AlreadyInstalled => write!(f, "Package '{}' already installed", self.name),
            OutcomeKind::Updated => write!(f, "Updated package '{}'", self.name),
            OutcomeKind::UpToDate => write!(f, "Package '{}' up to date", self.name),
            OutcomeKind::Removed => write!(f, "Removed package '{}'", self.name),
            OutcomeKind::NotFound => {
                write!(f, "Package '{}' not found in the repository", self.name)
            }
            OutcomeKind::Failed(error) => write!(f, "Package '{}' failed: {}", self.name, error),
        }
    }
}

/// Performs file operations in the install root
pub struct Installer {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SettingsStore>,
}

impl fmt::Debug for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installer").field("root", &self.root).finish()
    }
}

impl Installer {
    pub fn new(
        root: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            root: root.into(),
            transport,
            store,
        }
    }

    /// Install root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an entry's file lives
    pub fn package_path(&self, entry: &CatalogEntry) -> Result<PathBuf> {
        if !is_plain_filename(entry.filename()) {
            return Err(Error::IoError(format!(
                "Refusing to write '{}' outside {}",
                entry.filename(),
                self.root.display()
            )));
        }
        Ok(self.root.join(entry.filename()))
    }

    /// Download an entry and start tracking it
    ///
    /// An existing file is left alone unless `force` is set. The tracked set
    /// is only written to the settings store when `persist` is set, so batch
    /// callers can save once at the end.
    pub fn install(
        &self,
        entry: &CatalogEntry,
        settings: &mut Settings,
        force: bool,
        persist: bool,
    ) -> Result<Outcome> {
        debug!("Installing package {}", entry.name());

        let path = self.package_path(entry)?;
        if !force && path.is_file() {
            warn!("Package {} already installed", entry.name());
            return Ok(Outcome::new(entry.name(), OutcomeKind::AlreadyInstalled));
        }

        self.download(entry, &path)?;
        settings.tracked.insert(entry.name().to_string());
        if persist {
            self.store.save(settings)?;
        }

        info!("Installed package '{}'", entry.name());
        Ok(Outcome::new(entry.name(), OutcomeKind::Installed))
    }

    /// Replace an installed file if the catalog has a newer release
    ///
    /// A missing file falls back to a non-forced, non-persisting install.
    pub fn update(
        &self,
        entry: &CatalogEntry,
        settings: &mut Settings,
        force: bool,
    ) -> Result<Outcome> {
        debug!("Updating package {}", entry.name());

        let path = self.package_path(entry)?;
        let Some(mtime) = file_mtime(&path)? else {
            warn!(
                "Package '{}' not found while updating. Reinstalling",
                entry.name()
            );
            return self.install(entry, settings, false, false);
        };

        if force || entry.is_newer_than(mtime) {
            self.download(entry, &path)?;
            info!("Updated package '{}'", entry.name());
            Ok(Outcome::new(entry.name(), OutcomeKind::Updated))
        } else {
            info!("Package '{}' up to date", entry.name());
            Ok(Outcome::new(entry.name(), OutcomeKind::UpToDate))
        }
    }

    /// Delete an entry's file (if any) and stop tracking it
    pub fn remove(
        &self,
        entry: &CatalogEntry,
        settings: &mut Settings,
        persist: bool,
    ) -> Result<Outcome> {
        debug!("Removing package {}", entry.name());

        let path = self.package_path(entry)?;
        debug!("Package path: {}", path.display());

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Package file {} already absent", path.display());
            }
            Err(e) => {
                return Err(Error::IoError(format!(
                    "Failed to remove {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        settings.tracked.remove(entry.name());
        if persist {
            self.store.save(settings)?;
        }

        info!("Removed package '{}'", entry.name());
        Ok(Outcome::new(entry.name(), OutcomeKind::Removed))
    }

    /// Is the installed file older than the entry's release?
    ///
    /// A missing file is not outdated (it is missing).
    pub fn is_outdated(&self, entry: &CatalogEntry) -> Result<bool> {
        debug!("Checking if package is out of date: {}", entry.name());
        let path = self.package_path(entry)?;
        Ok(file_mtime(&path)?.is_some_and(|mtime| entry.is_newer_than(mtime)))
    }

    /// Stream the entry's resource to `dest` via a temp file and rename
    fn download(&self, entry: &CatalogEntry, dest: &Path) -> Result<()> {
        info!("Downloading {} to {}", entry.download_url(), dest.display());

        // The temp name does not end in the package suffix, so the probe
        // never reports a partial download.
        let mut temp = Builder::new()
            .prefix(&format!(".{}.", entry.filename()))
            .suffix(".part")
            .tempfile_in(&self.root)
            .map_err(|e| {
                Error::IoError(format!(
                    "Failed to create temp file in {}: {}",
                    self.root.display(),
                    e
                ))
            })?;

        let bytes = self.transport.download(entry.download_url(), &mut temp)?;
        temp.flush()?;
        temp.as_file().sync_all()?;

        filetime::set_file_mtime(temp.path(), FileTime::from_system_time(entry.release_time()))
            .map_err(|e| {
                Error::IoError(format!(
                    "Failed to set modification time on {}: {}",
                    temp.path().display(),
                    e
                ))
            })?;

        temp.persist(dest).map_err(|e| {
            Error::IoError(format!(
                "Failed to move download to {}: {}",
                dest.display(),
                e.error
            ))
        })?;

        debug!("Downloaded {} bytes to {}", bytes, dest.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Serves fixed bodies; `truncate` URLs fail halfway through
    #[derive(Default)]
    struct FakeDownloads {
        bodies: HashMap<String, Vec<u8>>,
        truncate: Vec<String>,
        count: Mutex<usize>,
    }

    impl Transport for FakeDownloads {
        fn get(&self, url: &str) -> Result<crate::repository::FetchedBody> {
            Err(Error::DownloadError(format!("unexpected get of {}", url)))
        }

        fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
            *self.count.lock().unwrap() += 1;
            let body = self
                .bodies
                .get(url)
                .ok_or_else(|| Error::DownloadError(format!("HTTP 404 Not Found from {}", url)))?;

            if self.truncate.iter().any(|u| u == url) {
                sink.write_all(&body[..body.len() / 2])?;
                return Err(Error::DownloadError("connection reset".to_string()));
            }
            sink.write_all(body)?;
            Ok(body.len() as u64)
        }
    }

    fn entry() -> CatalogEntry {
        CatalogEntry::new(
            "Foo".to_string(),
            "1.0".to_string(),
            "x".to_string(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            "http://x/f.pkg".to_string(),
        )
    }

    fn setup(transport: FakeDownloads) -> (TempDir, Arc<FakeDownloads>, Arc<MemorySettingsStore>, Installer) {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(transport);
        let store = Arc::new(MemorySettingsStore::new(Settings::default()));
        let installer = Installer::new(dir.path(), transport.clone(), store.clone());
        (dir, transport, store, installer)
    }

    fn serving(body: &[u8]) -> FakeDownloads {
        let mut transport = FakeDownloads::default();
        transport.bodies.insert("http://x/f.pkg".to_string(), body.to_vec());
        transport
    }

    fn downloads(transport: &FakeDownloads) -> usize {
        *transport.count.lock().unwrap()
    }

    #[test]
    fn test_install_sets_mtime_and_tracks() {
        let (dir, _transport, store, installer) = setup(serving(b"package bytes"));
        let mut settings = Settings::default();

        let outcome = installer.install(&entry(), &mut settings, false, true).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Installed);

        let path = dir.path().join("Foo.package");
        assert_eq!(fs::read(&path).unwrap(), b"package bytes");
        assert_eq!(
            fs::metadata(&path).unwrap().modified().unwrap(),
            entry().release_time()
        );
        assert!(settings.tracked.contains("Foo"));
        assert_eq!(store.save_count(), 1);
        assert!(store.snapshot().tracked.contains("Foo"));
    }

    #[test]
    fn test_install_twice_downloads_once() {
        let (_dir, transport, _store, installer) = setup(serving(b"bytes"));
        let mut settings = Settings::default();

        installer.install(&entry(), &mut settings, false, false).unwrap();
        let second = installer.install(&entry(), &mut settings, false, false).unwrap();

        assert_eq!(second.kind, OutcomeKind::AlreadyInstalled);
        assert!(second.is_noop());
        assert_eq!(downloads(&transport), 1);
    }

    #[test]
    fn test_forced_install_redownloads() {
        let (_dir, transport, _store, installer) = setup(serving(b"bytes"));
        let mut settings = Settings::default();

        installer.install(&entry(), &mut settings, false, false).unwrap();
        let forced = installer.install(&entry(), &mut settings, true, false).unwrap();

        assert_eq!(forced.kind, OutcomeKind::Installed);
        assert_eq!(downloads(&transport), 2);
    }

    #[test]
    fn test_install_without_persist_skips_save() {
        let (_dir, _transport, store, installer) = setup(serving(b"bytes"));
        let mut settings = Settings::default();

        installer.install(&entry(), &mut settings, false, false).unwrap();
        assert!(settings.tracked.contains("Foo"));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_truncated_download_leaves_nothing() {
        let mut transport = serving(&[1u8; 4096]);
        transport.truncate.push("http://x/f.pkg".to_string());
        let (dir, _transport, store, installer) = setup(transport);
        let mut settings = Settings::default();

        let result = installer.install(&entry(), &mut settings, false, true);
        assert!(matches!(result, Err(Error::DownloadError(_))));

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!settings.tracked.contains("Foo"));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_failed_update_keeps_existing_file() {
        let mut transport = serving(&[1u8; 4096]);
        transport.truncate.push("http://x/f.pkg".to_string());
        let (dir, _transport, _store, installer) = setup(transport);
        let path = dir.path().join("Foo.package");
        fs::write(&path, b"old release").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(0, 0)).unwrap();

        let mut settings = Settings::default();
        assert!(installer.update(&entry(), &mut settings, false).is_err());

        assert_eq!(fs::read(&path).unwrap(), b"old release");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_update_outdated_file() {
        let (dir, transport, _store, installer) = setup(serving(b"new release"));
        let path = dir.path().join("Foo.package");
        fs::write(&path, b"old release").unwrap();
        let older = entry().release_time() - Duration::from_secs(86_400);
        filetime::set_file_mtime(&path, FileTime::from_system_time(older)).unwrap();

        assert!(installer.is_outdated(&entry()).unwrap());
        let mut settings = Settings::default();
        let outcome = installer.update(&entry(), &mut settings, false).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Updated);
        assert_eq!(fs::read(&path).unwrap(), b"new release");
        assert!(!installer.is_outdated(&entry()).unwrap());
        assert_eq!(downloads(&transport), 1);
    }

    #[test]
    fn test_update_current_file_is_noop() {
        let (dir, transport, _store, installer) = setup(serving(b"new release"));
        let path = dir.path().join("Foo.package");
        fs::write(&path, b"current").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_system_time(SystemTime::now())).unwrap();

        let mut settings = Settings::default();
        let outcome = installer.update(&entry(), &mut settings, false).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::UpToDate);
        assert_eq!(downloads(&transport), 0);

        let forced = installer.update(&entry(), &mut settings, true).unwrap();
        assert_eq!(forced.kind, OutcomeKind::Updated);
        assert_eq!(downloads(&transport), 1);
    }

    #[test]
    fn test_update_missing_file_installs_without_persist() {
        let (dir, _transport, store, installer) = setup(serving(b"bytes"));
        let mut settings = Settings::default();

        let outcome = installer.update(&entry(), &mut settings, false).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Installed);
        assert!(dir.path().join("Foo.package").is_file());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_remove() {
        let (dir, _transport, store, installer) = setup(serving(b"bytes"));
        let mut settings = Settings::default();
        installer.install(&entry(), &mut settings, false, false).unwrap();

        let outcome = installer.remove(&entry(), &mut settings, true).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Removed);
        assert!(!dir.path().join("Foo.package").exists());
        assert!(!settings.tracked.contains("Foo"));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_remove_absent_file_is_tolerated() {
        let (_dir, _transport, store, installer) = setup(FakeDownloads::default());
        let mut settings = Settings::default();
        settings.tracked.insert("Foo".to_string());

        let outcome = installer.remove(&entry(), &mut settings, false).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Removed);
        assert!(settings.tracked.is_empty());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_unsafe_filename_is_refused() {
        let (_dir, transport, _store, installer) = setup(serving(b"bytes"));
        let evil = entry().with_filename("../escape.package");
        let mut settings = Settings::default();

        assert!(matches!(
            installer.install(&evil, &mut settings, false, false),
            Err(Error::IoError(_))
        ));
        assert_eq!(downloads(&transport), 0);
    }

    #[test]
    fn test_outcome_messages() {
        assert_eq!(
            Outcome::new("Foo", OutcomeKind::AlreadyInstalled).to_string(),
            "Package 'Foo' already installed"
        );
        assert_eq!(
            Outcome::new("Bar.package", OutcomeKind::NotFound).to_string(),
            "Package 'Bar.package' not found in the repository"
        );
        assert!(Outcome::new("Foo", OutcomeKind::Failed("x".into())).is_error());
    }
}
