// src/filesystem.rs

//! Install directory probing and atomic file writes

use crate::catalog::PACKAGE_SUFFIX;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::debug;

/// Package files present in the install root with their modification times
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemState {
    files: BTreeMap<String, SystemTime>,
}

impl FilesystemState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from (filename, mtime) pairs
    pub fn from_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, SystemTime)>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(|(n, t)| (n.into(), t)).collect(),
        }
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    pub fn modified(&self, filename: &str) -> Option<SystemTime> {
        self.files.get(filename).copied()
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// List package files directly inside `root`
///
/// Only regular files ending in the package suffix are reported; there is
/// no recursion. A missing or unreadable root is an error.
pub fn list_installed(root: &Path) -> Result<FilesystemState> {
    let entries = fs::read_dir(root).map_err(|e| {
        Error::IoError(format!(
            "Failed to read install directory {}: {}",
            root.display(),
            e
        ))
    })?;

    let mut files = BTreeMap::new();
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.ends_with(PACKAGE_SUFFIX) {
            continue;
        }

        // Follow symlinks so a linked package file counts as installed
        let metadata = match fs::metadata(entry.path()) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            continue;
        }
        files.insert(name, metadata.modified()?);
    }

    debug!("Filesystem packages: {:?}", files.keys().collect::<Vec<_>>());
    Ok(FilesystemState { files })
}

/// Modification time of a file, or `None` if it is not a regular file
pub fn file_mtime(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(Some(metadata.modified()?)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace `path` with `contents` via a temp file and rename
///
/// A concurrent reader sees either the old file or the new one, never a
/// partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| {
        Error::IoError(format!("Failed to create temp file in {}: {}", dir.display(), e))
    })?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| {
        Error::IoError(format!("Failed to replace {}: {}", path.display(), e.error))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_installed_filters_suffix_and_dirs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Foo.package"), b"foo").unwrap();
        fs::write(dir.path().join("Bar.package"), b"bar").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("Dir.package")).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/Deep.package"), b"x").unwrap();

        let state = list_installed(dir.path()).unwrap();
        assert_eq!(state.len(), 2);
        assert!(state.contains("Foo.package"));
        assert!(state.contains("Bar.package"));
        assert!(!state.contains("Dir.package"));
        assert!(!state.contains("Deep.package"));
        assert!(state.modified("Foo.package").is_some());
    }

    #[test]
    fn test_list_installed_missing_root_is_error() {
        let dir = TempDir::new().unwrap();
        let result = list_installed(&dir.path().join("missing"));
        assert!(matches!(result, Err(Error::IoError(_))));
    }

    #[test]
    fn test_file_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.package");
        assert_eq!(file_mtime(&path).unwrap(), None);
        fs::write(&path, b"a").unwrap();
        assert!(file_mtime(&path).unwrap().is_some());
        assert_eq!(file_mtime(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
