// src/catalog/cache.rs

//! On-disk catalog cache
//!
//! Two files live in the cache directory:
//! - `packages.json`: the last fetched catalog plus the URL it came from
//! - `last.run`: when that fetch happened
//!
//! Reading is fail-soft: any problem is a cache miss, never an error.

use super::{format_release_date, parse_release_date, Catalog, CatalogDocument};
use crate::error::{Error, Result};
use crate::filesystem::write_atomic;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cached catalog filename
pub const CACHE_FILE: &str = "packages.json";

/// Last successful fetch timestamp filename
pub const LAST_RUN_FILE: &str = "last.run";

/// How far in the future `last.run` may be before it is distrusted
const MAX_CLOCK_SKEW_HOURS: i64 = 24;

/// A catalog loaded from the cache together with its fetch time
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub catalog: Catalog,
    pub last_fetch: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
    /// Usable without refetching?
    pub fn is_valid(&self, interval: Duration, now: DateTime<Utc>) -> bool {
        self.last_fetch
            .is_some_and(|last| is_fresh(last, interval, now))
    }
}

/// True iff `now < last_fetch + interval`
pub fn is_fresh(last_fetch: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(interval)
        .ok()
        .and_then(|ttl| last_fetch.checked_add_signed(ttl))
    {
        Some(expires) => now < expires,
        None => true,
    }
}

/// Catalog cache rooted at a host-owned directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    pub fn last_run_path(&self) -> PathBuf {
        self.dir.join(LAST_RUN_FILE)
    }

    /// Load the cached catalog, or `None` if it is absent or unusable
    pub fn load(&self) -> Option<CacheSnapshot> {
        match self.try_load() {
            Ok(Some(snapshot)) => {
                info!(
                    "Package list loaded from file cache '{}' ({} packages)",
                    snapshot.catalog.name(),
                    snapshot.catalog.len()
                );
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring catalog cache: {}", e);
                None
            }
        }
    }

    fn try_load(&self) -> Result<Option<CacheSnapshot>> {
        let path = self.catalog_path();
        if !path.is_file() {
            debug!("No catalog cache at {}", path.display());
            return Ok(None);
        }

        let content = fs::read(&path).map_err(|e| {
            Error::CacheCorrupt(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let doc: CatalogDocument = serde_json::from_slice(&content).map_err(|e| {
            Error::CacheCorrupt(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        let url = doc.url.clone().unwrap_or_default();
        let parsed = Catalog::from_document(doc, &url);
        if parsed.skipped > 0 {
            warn!("{} cached catalog entries were skipped", parsed.skipped);
        }

        Ok(Some(CacheSnapshot {
            catalog: parsed.catalog,
            last_fetch: self.last_fetch(),
        }))
    }

    /// Time of the last successful fetch, if it can be trusted
    pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
        self.last_fetch_at(Utc::now())
    }

    fn last_fetch_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let path = self.last_run_path();
        let raw = fs::read_to_string(&path).ok()?;

        let last = match parse_release_date(&raw) {
            Ok(last) => last,
            Err(e) => {
                warn!("Ignoring {}: {}", path.display(), e);
                return None;
            }
        };

        if last > now + chrono::Duration::hours(MAX_CLOCK_SKEW_HOURS) {
            warn!("Ignoring {}: timestamp {} is in the future", path.display(), last);
            return None;
        }

        Some(last)
    }

    /// Is there a cache whose last fetch is within `interval`?
    pub fn is_valid(&self, interval: Duration) -> bool {
        let now = Utc::now();
        self.last_fetch_at(now)
            .is_some_and(|last| is_fresh(last, interval, now))
            && self.catalog_path().is_file()
    }

    /// Persist a freshly fetched catalog and stamp the fetch time
    pub fn save(&self, catalog: &Catalog) -> Result<()> {
        self.save_at(catalog, Utc::now())
    }

    /// Same as `save` with an explicit fetch time
    pub fn save_at(&self, catalog: &Catalog, fetched_at: DateTime<Utc>) -> Result<()> {
        debug!("Writing catalog cache to {}", self.dir.display());

        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::IoError(format!(
                "Failed to create cache directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let json = serde_json::to_vec_pretty(&catalog.to_document())
            .map_err(|e| Error::ParseError(format!("Failed to serialize catalog: {}", e)))?;
        write_atomic(&self.catalog_path(), &json)?;
        write_atomic(
            &self.last_run_path(),
            format_release_date(&fetched_at).as_bytes(),
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn sample_catalog() -> Catalog {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Catalog::from_entries(
            "repo",
            "https://mirror.example/packages.json",
            vec![
                CatalogEntry::new(
                    "Foo".to_string(),
                    "1.0".to_string(),
                    "x".to_string(),
                    date,
                    "http://x/f.pkg".to_string(),
                ),
                CatalogEntry::new(
                    "Bar".to_string(),
                    "2.0".to_string(),
                    String::new(),
                    date,
                    "http://x/b.pkg".to_string(),
                )
                .with_filename("bar-custom.package")
                .with_owner("someone"),
            ],
        )
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        let catalog = sample_catalog();

        store.save(&catalog).unwrap();
        let snapshot = store.load().unwrap();

        assert_eq!(snapshot.catalog, catalog);
        assert_eq!(
            snapshot.catalog.source_url(),
            "https://mirror.example/packages.json"
        );
        assert!(snapshot.last_fetch.is_some());
        assert!(snapshot.is_valid(HOUR, Utc::now()));
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path().join("nested/cache"));
        store.save(&sample_catalog()).unwrap();
        assert!(store.catalog_path().is_file());
        assert!(store.last_run_path().is_file());
    }

    #[test]
    fn test_missing_cache_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        assert!(store.load().is_none());
        assert!(!store.is_valid(HOUR));
    }

    #[test]
    fn test_corrupt_cache_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        fs::write(store.catalog_path(), b"{ truncated").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_unparseable_last_run_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        store.save(&sample_catalog()).unwrap();

        fs::write(store.last_run_path(), b"garbage").unwrap();
        assert!(store.last_fetch().is_none());
        assert!(!store.is_valid(HOUR));

        // The catalog itself is still loadable
        let snapshot = store.load().unwrap();
        assert!(snapshot.last_fetch.is_none());
        assert!(!snapshot.is_valid(HOUR, Utc::now()));
    }

    #[test]
    fn test_last_run_without_offset() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        fs::write(store.last_run_path(), b"2024-01-01T00:00:00").unwrap();
        assert_eq!(
            store.last_fetch(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_far_future_last_run_is_distrusted() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        store
            .save_at(&sample_catalog(), Utc::now() + chrono::Duration::days(3))
            .unwrap();
        assert!(store.last_fetch().is_none());
        assert!(!store.is_valid(HOUR * 1000));
    }

    #[test]
    fn test_expired_cache_is_invalid() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        store
            .save_at(&sample_catalog(), Utc::now() - chrono::Duration::hours(13))
            .unwrap();

        assert!(!store.is_valid(HOUR * 12));
        assert!(store.is_valid(HOUR * 14));
    }

    #[test]
    fn test_is_fresh_boundary() {
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(is_fresh(last, HOUR, last));
        assert!(is_fresh(last, HOUR, last + chrono::Duration::minutes(59)));
        assert!(!is_fresh(last, HOUR, last + chrono::Duration::hours(1)));
        assert!(!is_fresh(last, Duration::ZERO, last));
    }
}
