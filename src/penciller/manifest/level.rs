use super::entry::ManifestEntry;
use crate::codec::Key;
use crate::error::{Error, Result};

/// An ordered run of manifest entries at one level.
///
/// L0 holds at most one entry whose range may overlap anything below it.
/// L1 and deeper hold disjoint entries kept sorted by `start_key`.
#[derive(Clone, Debug)]
pub struct Level {
    pub level_num: usize,
    entries: Vec<ManifestEntry>,
}

impl Level {
    pub fn new(level_num: usize) -> Self {
        Self {
            level_num,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Entry count past which this level has compaction work. L0 tolerates
    /// no resident file; level `n` holds up to `8^n` entries.
    pub fn work_threshold(&self) -> usize {
        if self.level_num == 0 {
            0
        } else {
            8usize.pow(self.level_num as u32)
        }
    }

    /// Find the entry whose range contains `key`. L0 is scanned whole; the
    /// deeper levels are disjoint and sorted, so at most one entry can match.
    pub fn key_lookup(&self, key: &Key) -> Option<&ManifestEntry> {
        if self.level_num == 0 {
            return self.entries.iter().find(|e| e.contains(key));
        }
        let idx = self.entries.partition_point(|e| &e.start_key <= key);
        if idx == 0 {
            return None;
        }
        let candidate = &self.entries[idx - 1];
        candidate.contains(key).then_some(candidate)
    }

    /// All entries intersecting `[start, end]`, in key order. A `None` end
    /// is the open upper bound.
    pub fn range_lookup(&self, start: &Key, end: Option<&Key>) -> Vec<ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// Insert an entry, keeping the level sorted by `start_key`.
    pub fn insert(&mut self, entry: ManifestEntry) -> Result<()> {
        if self.level_num == 0 && !self.entries.is_empty() {
            return Err(Error::InvalidData(
                "level zero already holds a file".to_string(),
            ));
        }
        self.entries.push(entry);
        self.entries.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        Ok(())
    }

    /// Remove the contiguous run of `count` entries starting at the entry
    /// whose `start_key` matches.
    pub fn remove_run(&mut self, start_key: &Key, count: usize) -> Result<Vec<ManifestEntry>> {
        let idx = self
            .entries
            .iter()
            .position(|e| &e.start_key == start_key)
            .ok_or_else(|| {
                Error::InvalidData(format!(
                    "no entry at level {} with the requested start key",
                    self.level_num
                ))
            })?;
        if idx + count > self.entries.len() {
            return Err(Error::InvalidData(format!(
                "removal run of {count} exceeds level {} length",
                self.level_num
            )));
        }
        Ok(self.entries.drain(idx..idx + count).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::sst::SstFile;
    use crate::tmpfs::TempDir;

    fn k(i: u32) -> Key {
        Key::object(b"b", format!("k{i:04}").as_bytes())
    }

    fn entry(dir: &TempDir, filename: &str, lo: u32, hi: u32) -> ManifestEntry {
        let records: Vec<(Key, Value)> =
            (lo..=hi).map(|i| (k(i), Value::active(i as u64))).collect();
        let (owner, start, end) =
            SstFile::create(dir.path(), filename, records, hi as u64).unwrap();
        ManifestEntry::new(owner, filename.to_string(), start, end)
    }

    #[test]
    fn test_insert_keeps_sorted() -> crate::error::Result<()> {
        let dir = TempDir::new()?;
        let mut level = Level::new(1);
        level.insert(entry(&dir, "1_1_1.sst", 30, 39))?;
        level.insert(entry(&dir, "1_1_0.sst", 10, 19))?;
        level.insert(entry(&dir, "1_1_2.sst", 50, 59))?;

        let starts: Vec<&Key> = level.entries().iter().map(|e| &e.start_key).collect();
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[test]
    fn test_level0_single_entry() -> crate::error::Result<()> {
        let dir = TempDir::new()?;
        let mut level = Level::new(0);
        level.insert(entry(&dir, "1_0_0.sst", 0, 9))?;
        assert!(level.insert(entry(&dir, "2_0_0.sst", 0, 9)).is_err());
        Ok(())
    }

    #[test]
    fn test_key_lookup_sorted_level() -> crate::error::Result<()> {
        let dir = TempDir::new()?;
        let mut level = Level::new(1);
        level.insert(entry(&dir, "1_1_0.sst", 10, 19))?;
        level.insert(entry(&dir, "1_1_1.sst", 30, 39))?;

        assert_eq!(level.key_lookup(&k(15)).unwrap().filename, "1_1_0.sst");
        assert_eq!(level.key_lookup(&k(30)).unwrap().filename, "1_1_1.sst");
        assert!(level.key_lookup(&k(25)).is_none());
        assert!(level.key_lookup(&k(5)).is_none());
        assert!(level.key_lookup(&k(45)).is_none());
        Ok(())
    }

    #[test]
    fn test_range_lookup_bounds_scan() -> crate::error::Result<()> {
        let dir = TempDir::new()?;
        let mut level = Level::new(1);
        level.insert(entry(&dir, "1_1_0.sst", 10, 19))?;
        level.insert(entry(&dir, "1_1_1.sst", 30, 39))?;
        level.insert(entry(&dir, "1_1_2.sst", 50, 59))?;

        let hits = level.range_lookup(&k(15), Some(&k(35)));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].filename, "1_1_0.sst");
        assert_eq!(hits[1].filename, "1_1_1.sst");

        let open_ended = level.range_lookup(&k(35), None);
        assert_eq!(open_ended.len(), 2);

        assert!(level.range_lookup(&k(20), Some(&k(29))).is_empty());
        Ok(())
    }

    #[test]
    fn test_remove_run() -> crate::error::Result<()> {
        let dir = TempDir::new()?;
        let mut level = Level::new(1);
        level.insert(entry(&dir, "1_1_0.sst", 10, 19))?;
        level.insert(entry(&dir, "1_1_1.sst", 30, 39))?;
        level.insert(entry(&dir, "1_1_2.sst", 50, 59))?;

        let removed = level.remove_run(&k(30), 2)?;
        assert_eq!(removed.len(), 2);
        assert_eq!(level.len(), 1);
        assert_eq!(level.entries()[0].filename, "1_1_0.sst");

        assert!(level.remove_run(&k(30), 1).is_err());
        Ok(())
    }

    #[test]
    fn test_work_threshold() {
        assert_eq!(Level::new(0).work_threshold(), 0);
        assert_eq!(Level::new(1).work_threshold(), 8);
        assert_eq!(Level::new(2).work_threshold(), 64);
        assert_eq!(Level::new(7).work_threshold(), 2_097_152);
    }
}
