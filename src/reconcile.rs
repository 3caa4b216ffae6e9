// src/reconcile.rs

//! Drift detection between the tracked set, the catalog and the disk

use crate::catalog::Catalog;
use crate::filesystem::FilesystemState;
use crate::settings::TrackedSet;
use std::collections::BTreeSet;

/// The three drift sets of one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Tracked names that resolve but whose file is absent
    pub missing: BTreeSet<String>,
    /// Installed filenames with no entry, or whose entry is not tracked
    pub untracked: BTreeSet<String>,
    /// Tracked names whose file predates the entry's release
    pub outdated: BTreeSet<String>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.untracked.is_empty() && self.outdated.is_empty()
    }
}

/// Compare the tracked set against the catalog and the installed files
///
/// Tracked names the catalog does not know are skipped.
pub fn reconcile(
    tracked: &TrackedSet,
    catalog: &Catalog,
    installed: &FilesystemState,
) -> Reconciliation {
    let mut result = Reconciliation::default();

    for name in tracked {
        let Some(entry) = catalog.get(name) else {
            continue;
        };
        match installed.modified(entry.filename()) {
            None => {
                result.missing.insert(name.clone());
            }
            Some(mtime) if entry.is_newer_than(mtime) => {
                result.outdated.insert(name.clone());
            }
            Some(_) => {}
        }
    }

    for filename in installed.filenames() {
        let accounted = catalog
            .get_by_filename(filename)
            .is_some_and(|entry| tracked.contains(entry.name()));
        if !accounted {
            result.untracked.insert(filename.to_string());
        }
    }

    result
}
