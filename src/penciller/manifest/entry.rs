use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{endkey_passed, Key};
use crate::sst::SstFile;

/// A file in the leveled manifest. The key range is inclusive on both ends;
/// `owner` is the live reader handle, `filename` identifies persisted state.
#[derive(Clone)]
pub struct ManifestEntry {
    pub start_key: Key,
    pub end_key: Key,
    pub filename: String,
    pub owner: Arc<SstFile>,
}

impl ManifestEntry {
    pub fn new(owner: Arc<SstFile>, filename: String, start_key: Key, end_key: Key) -> Self {
        Self {
            start_key,
            end_key,
            filename,
            owner,
        }
    }

    /// True when `key` falls within this entry's inclusive range.
    pub fn contains(&self, key: &Key) -> bool {
        &self.start_key <= key && key <= &self.end_key
    }

    /// True when this entry's range intersects `[start, end]`, where a
    /// `None` end is the open upper bound.
    pub fn overlaps(&self, start: &Key, end: Option<&Key>) -> bool {
        &self.end_key >= start && !endkey_passed(end, &self.start_key)
    }
}

impl std::fmt::Debug for ManifestEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestEntry")
            .field("filename", &self.filename)
            .finish()
    }
}

/// The owner-free form of an entry written into manifest files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub start_key: Key,
    pub end_key: Key,
    pub filename: String,
}

impl From<&ManifestEntry> for PersistedEntry {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            start_key: entry.start_key.clone(),
            end_key: entry.end_key.clone(),
            filename: entry.filename.clone(),
        }
    }
}
