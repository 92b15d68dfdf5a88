use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::models::ErrorKind;

// ============================================================================
// File Entries
// ============================================================================

/// One file of a multi-file dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub is_primary: bool,
}

/// File listing with exactly one primary entry (unless empty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileListing {
    pub files: Vec<FileEntry>,
    pub primary_file_id: Option<String>,
}

impl FileListing {
    /// Normalize primary designation: the first flagged entry wins, and when
    /// nothing is flagged the first entry becomes primary.
    pub fn from_entries(mut files: Vec<FileEntry>) -> Self {
        let primary_idx = files.iter().position(|f| f.is_primary).or(if files.is_empty() {
            None
        } else {
            Some(0)
        });

        for (idx, file) in files.iter_mut().enumerate() {
            file.is_primary = Some(idx) == primary_idx;
        }

        let primary_file_id = primary_idx.map(|idx| files[idx].id.clone());
        Self {
            files,
            primary_file_id,
        }
    }

    pub fn get(&self, file_id: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.id == file_id)
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.get(file_id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.id.as_str())
    }
}

// ============================================================================
// Selection Set
// ============================================================================

/// File ids picked by the user for a bundled download.
///
/// Only explicit user actions mutate it; refreshing the listing does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SelectionSet {
    ids: BTreeSet<String>,
}

impl SelectionSet {
    /// Flip membership of `file_id`. Returns whether it is selected afterwards.
    pub fn toggle(&mut self, file_id: &str) -> bool {
        if self.ids.remove(file_id) {
            false
        } else {
            self.ids.insert(file_id.to_string());
            true
        }
    }

    pub fn select_all<'a>(&mut self, file_ids: impl IntoIterator<Item = &'a str>) {
        self.ids.extend(file_ids.into_iter().map(str::to_string));
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.ids.contains(file_id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }
}

// ============================================================================
// Downloads
// ============================================================================

/// File content received from the backend.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundledFile {
    pub file_id: String,
    pub filename: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file_id: String,
    pub filename: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub cancelled: bool,
}

/// Per-file result of a bundled download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleReport {
    pub succeeded: Vec<BundledFile>,
    pub failed: Vec<FileFailure>,
}

impl BundleReport {
    pub fn is_partial(&self) -> bool {
        !self.succeeded.is_empty() && !self.failed.is_empty()
    }

    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }

    /// Bundle-level kind, if anything failed.
    pub fn kind(&self) -> Option<ErrorKind> {
        if self.failed.is_empty() {
            None
        } else {
            Some(ErrorKind::PartialFailure)
        }
    }
}

/// Downloaded payloads paired with their report.
#[derive(Debug, Clone)]
pub struct BundleOutcome {
    pub files: Vec<FilePayload>,
    pub report: BundleReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, primary: bool) -> FileEntry {
        FileEntry {
            id: id.to_string(),
            filename: format!("{}.csv", id),
            file_type: Some("csv".to_string()),
            size_bytes: 10,
            is_primary: primary,
        }
    }

    #[test]
    fn listing_keeps_flagged_primary() {
        let listing =
            FileListing::from_entries(vec![entry("f1", false), entry("f2", true), entry("f3", false)]);
        assert_eq!(listing.primary_file_id.as_deref(), Some("f2"));
        assert_eq!(listing.files.iter().filter(|f| f.is_primary).count(), 1);
    }

    #[test]
    fn listing_defaults_primary_to_first_entry() {
        let listing = FileListing::from_entries(vec![entry("f1", false), entry("f2", false)]);
        assert_eq!(listing.primary_file_id.as_deref(), Some("f1"));
        assert!(listing.files[0].is_primary);
    }

    #[test]
    fn listing_drops_extra_primary_flags() {
        let listing = FileListing::from_entries(vec![entry("f1", false), entry("f2", true), entry("f3", true)]);
        assert_eq!(listing.primary_file_id.as_deref(), Some("f2"));
        assert!(!listing.files[2].is_primary);
    }

    #[test]
    fn empty_listing_has_no_primary() {
        let listing = FileListing::from_entries(Vec::new());
        assert!(listing.files.is_empty());
        assert_eq!(listing.primary_file_id, None);
    }

    #[test]
    fn double_toggle_restores_membership() {
        let mut selection = SelectionSet::default();
        selection.toggle("f1");

        let before = selection.clone();
        assert!(selection.toggle("f2"));
        assert!(!selection.toggle("f2"));
        assert_eq!(selection, before);

        assert!(!selection.toggle("f1"));
        assert!(selection.toggle("f1"));
        assert_eq!(selection, before);
    }

    #[test]
    fn select_all_then_clear() {
        let listing = FileListing::from_entries(vec![entry("b", false), entry("a", false)]);
        let mut selection = SelectionSet::default();
        selection.select_all(listing.ids());
        assert_eq!(selection.to_vec(), vec!["a".to_string(), "b".to_string()]);

        selection.clear();
        assert!(selection.is_empty());
    }
}
