// src/catalog/mod.rs

//! Catalog data model
//!
//! This module provides:
//! - `CatalogEntry`: one installable package file
//! - `Catalog`: a wholesale snapshot of a repository, indexed by name and filename
//! - Parsing of the JSON catalog document, skipping malformed entries
//! - The on-disk cache of the last fetched catalog (`cache`)

pub mod cache;
pub mod timestamp;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use tracing::{debug, warn};

pub use timestamp::{format_release_date, parse_release_date};

/// Suffix every installed package file carries
pub const PACKAGE_SUFFIX: &str = ".package";

/// A single package as described by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    name: String,
    version: String,
    description: String,
    date: DateTime<Utc>,
    download_url: String,
    filename: String,
    owner: Option<String>,
    homepage: Option<String>,
}

impl CatalogEntry {
    /// Create an entry with the default filename (`<name>.package`)
    pub fn new(
        name: String,
        version: String,
        description: String,
        date: DateTime<Utc>,
        download_url: String,
    ) -> Self {
        let filename = default_filename(&name);
        Self {
            name,
            version,
            description,
            date,
            download_url,
            filename,
            owner: None,
            homepage: None,
        }
    }

    /// Override the install filename (empty keeps the default)
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        if !filename.trim().is_empty() {
            self.filename = filename;
        }
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_homepage(mut self, homepage: impl Into<String>) -> Self {
        self.homepage = Some(homepage.into());
        self
    }

    /// Build an entry from one element of the document's `packages` array
    pub fn from_document(doc: EntryDocument) -> Result<Self> {
        let name = doc
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| Error::MalformedEntry("missing name".to_string()))?;

        let download_url = doc
            .download_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::MalformedEntry(format!("'{}': missing download_url", name)))?;

        let raw_date = doc
            .date
            .ok_or_else(|| Error::MalformedEntry(format!("'{}': missing date", name)))?;
        let date = parse_release_date(&raw_date)
            .map_err(|e| Error::MalformedEntry(format!("'{}': {}", name, e)))?;

        let mut entry = Self::new(
            name,
            doc.version.unwrap_or_default(),
            doc.description.unwrap_or_default(),
            date,
            download_url,
        );
        if let Some(filename) = doc.filename {
            entry = entry.with_filename(filename);
        }
        if !is_plain_filename(entry.filename()) {
            return Err(Error::MalformedEntry(format!(
                "'{}': filename '{}' is not a plain file name",
                entry.name, entry.filename
            )));
        }
        entry.owner = doc.owner;
        entry.homepage = doc.homepage;

        Ok(entry)
    }

    /// Serializable form, as written to the cache
    pub fn to_document(&self) -> EntryDocument {
        EntryDocument {
            name: Some(self.name.clone()),
            version: Some(self.version.clone()),
            description: Some(self.description.clone()),
            date: Some(format_release_date(&self.date)),
            download_url: Some(self.download_url.clone()),
            filename: Some(self.filename.clone()),
            owner: self.owner.clone(),
            homepage: self.homepage.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Release timestamp, the only staleness signal
    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    /// Release timestamp as a filesystem time
    pub fn release_time(&self) -> SystemTime {
        SystemTime::from(self.date)
    }

    pub fn download_url(&self) -> &str {
        &self.download_url
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Homepage, only if it is an http or https URL
    pub fn homepage(&self) -> Option<&str> {
        let raw = self.homepage.as_deref()?;
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some(raw),
            _ => None,
        }
    }

    /// True when a file last modified at `mtime` predates this release
    pub fn is_newer_than(&self, mtime: SystemTime) -> bool {
        mtime < self.release_time()
    }
}

/// Filename used when the catalog does not name one
pub fn default_filename(name: &str) -> String {
    format!("{}{}", name, PACKAGE_SUFFIX)
}

/// True for a single path component that stays inside its directory
pub fn is_plain_filename(filename: &str) -> bool {
    !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\'])
}

/// Package entry as it appears in the JSON document
///
/// Every field is optional here so a single bad entry can be rejected
/// without failing the whole document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

/// Top-level catalog document (network body or cache file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub name: String,
    /// Only present in the cache file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub packages: Vec<serde_json::Value>,
}

/// A repository's package list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    name: String,
    source_url: String,
    entries: BTreeMap<String, CatalogEntry>,
    by_filename: HashMap<String, String>,
}

/// Result of parsing a catalog document
#[derive(Debug, Clone)]
pub struct ParsedCatalog {
    pub catalog: Catalog,
    /// Number of entries dropped as malformed or duplicate
    pub skipped: usize,
}

impl Catalog {
    /// Build a catalog from entries; on duplicate names the first one wins
    pub fn from_entries(
        name: impl Into<String>,
        source_url: impl Into<String>,
        entries: impl IntoIterator<Item = CatalogEntry>,
    ) -> Self {
        let mut catalog = Self {
            name: name.into(),
            source_url: source_url.into(),
            entries: BTreeMap::new(),
            by_filename: HashMap::new(),
        };
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    /// Returns false when the name was already present
    fn insert(&mut self, entry: CatalogEntry) -> bool {
        if self.entries.contains_key(entry.name()) {
            return false;
        }
        self.by_filename
            .entry(entry.filename().to_string())
            .or_insert_with(|| entry.name().to_string());
        self.entries.insert(entry.name().to_string(), entry);
        true
    }

    /// Parse a JSON catalog body fetched from `source_url`
    pub fn parse(body: &[u8], source_url: &str) -> Result<ParsedCatalog> {
        let doc: CatalogDocument = serde_json::from_slice(body)
            .map_err(|e| Error::ParseError(format!("Invalid catalog document: {}", e)))?;
        Ok(Self::from_document(doc, source_url))
    }

    /// Convert a parsed document, skipping entries that fail validation
    pub fn from_document(doc: CatalogDocument, source_url: &str) -> ParsedCatalog {
        let mut catalog = Self::from_entries(doc.name, source_url, Vec::new());
        let mut skipped = 0;

        for value in doc.packages {
            let entry = serde_json::from_value::<EntryDocument>(value)
                .map_err(|e| Error::MalformedEntry(e.to_string()))
                .and_then(CatalogEntry::from_document);

            match entry {
                Ok(entry) => {
                    let name = entry.name().to_string();
                    if !catalog.insert(entry) {
                        debug!("Duplicate catalog entry '{}' ignored", name);
                        skipped += 1;
                    }
                }
                Err(e) => {
                    warn!("Skipping catalog entry: {}", e);
                    skipped += 1;
                }
            }
        }

        ParsedCatalog { catalog, skipped }
    }

    /// Serializable form including the source URL
    pub fn to_document(&self) -> CatalogDocument {
        CatalogDocument {
            name: self.name.clone(),
            url: Some(self.source_url.clone()),
            packages: self
                .entries
                .values()
                .map(|entry| {
                    serde_json::to_value(entry.to_document()).unwrap_or(serde_json::Value::Null)
                })
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// URL the catalog was actually fetched from
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Look up an entry by package name
    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    /// Look up an entry by its install filename
    pub fn get_by_filename(&self, filename: &str) -> Option<&CatalogEntry> {
        self.by_filename
            .get(filename)
            .and_then(|name| self.entries.get(name))
    }

    /// Entries in name order
    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
