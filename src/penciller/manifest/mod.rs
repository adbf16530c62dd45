//! The leveled manifest: the authoritative mapping from level to ordered
//! set of SST files, plus the bookkeeping that keeps superseded files alive
//! while snapshots still reference them.
//!
//! # Persistence
//!
//! One blob is written per committed generation:
//!
//! ```text
//! <manifest_dir>/nonzero_<manifest_sqn>.crr
//!
//! +-----------+----------------------------------------+
//! | crc32:u32 | bincode { levels, manifest_sqn,        |
//! | 4 bytes   |           basement }                   |
//! +-----------+----------------------------------------+
//! ```
//!
//! The writer first produces `nonzero_<sqn>.pnd` and renames it to `.crr`;
//! the rename is the commit point, so readers only ever observe a fully
//! written generation. On open the highest generation is tried first and
//! corrupt candidates are skipped. Level zero is never persisted here — its
//! presence is recovered by probing the filesystem for the L0 filename of
//! the next generation.

pub mod entry;
pub mod level;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::codec::Key;
use crate::error::{Error, Result};
use crate::sst::SstFile;

pub use entry::{ManifestEntry, PersistedEntry};
pub use level::Level;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Levels L0 through L7.
pub const MAX_LEVELS: usize = 8;

const COMMITTED_EXT: &str = "crr";
const PENDING_EXT: &str = "pnd";

/// A registered snapshot holder: the manifest generation it observed and
/// the deadline past which it is silently dropped.
#[derive(Clone, Debug)]
pub struct SnapshotRef {
    pub holder: u64,
    pub manifest_sqn: u64,
    pub deadline: Instant,
}

#[derive(Serialize, Deserialize)]
struct PersistedManifest {
    levels: Vec<Vec<PersistedEntry>>,
    manifest_sqn: u64,
    basement: usize,
}

/// The in-memory manifest. All mutations are pure in-memory transformations;
/// persistence is explicit through [`Manifest::save_pending`] and
/// [`Manifest::commit`].
#[derive(Clone, Debug)]
pub struct Manifest {
    levels: Vec<Level>,
    manifest_sqn: u64,
    basement: usize,
    snapshots: Vec<SnapshotRef>,
    pending_deletes: HashMap<String, u64>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            levels: (0..MAX_LEVELS).map(Level::new).collect(),
            manifest_sqn: 0,
            basement: 0,
            snapshots: Vec::new(),
            pending_deletes: HashMap::new(),
        }
    }

    pub fn manifest_sqn(&self) -> u64 {
        self.manifest_sqn
    }

    /// The deepest non-empty level, or 0 when every level is empty.
    pub fn basement(&self) -> usize {
        self.basement
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn entries(&self, level: usize) -> &[ManifestEntry] {
        self.levels[level].entries()
    }

    pub fn level0_present(&self) -> bool {
        !self.levels[0].is_empty()
    }

    fn recompute_basement(&mut self) {
        self.basement = self
            .levels
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| !l.is_empty())
            .map(|(n, _)| n)
            .unwrap_or(0);
    }

    /// Find the entry containing `key` at `level`.
    pub fn key_lookup(&self, level: usize, key: &Key) -> Option<&ManifestEntry> {
        self.levels[level].key_lookup(key)
    }

    /// All entries at `level` intersecting `[start, end]`.
    pub fn range_lookup(
        &self,
        level: usize,
        start: &Key,
        end: Option<&Key>,
    ) -> Vec<ManifestEntry> {
        self.levels[level].range_lookup(start, end)
    }

    /// Insert an entry at `level` and advance the generation to `new_sqn`.
    /// Several operations may share one generation while a change is being
    /// assembled, but the counter never moves backwards.
    pub fn insert(&mut self, level: usize, entry: ManifestEntry, new_sqn: u64) -> Result<()> {
        if new_sqn < self.manifest_sqn {
            return Err(Error::InvalidData(format!(
                "manifest sqn regression: {new_sqn} < {}",
                self.manifest_sqn
            )));
        }
        self.levels[level].insert(entry)?;
        self.manifest_sqn = new_sqn;
        self.recompute_basement();
        Ok(())
    }

    /// Remove the contiguous run of `count` entries at `level` starting at
    /// `start_key`; the removed filenames join the pending-delete set at
    /// `new_sqn`.
    pub fn remove(
        &mut self,
        level: usize,
        start_key: &Key,
        count: usize,
        new_sqn: u64,
    ) -> Result<Vec<ManifestEntry>> {
        let removed = self.levels[level].remove_run(start_key, count)?;
        for entry in &removed {
            self.pending_deletes.insert(entry.filename.clone(), new_sqn);
        }
        self.manifest_sqn = self.manifest_sqn.max(new_sqn);
        self.recompute_basement();
        Ok(removed)
    }

    /// Move one entry from `src_level` down to `src_level + 1` without
    /// marking it pending-delete: the file itself survives unchanged.
    pub fn switch(&mut self, src_level: usize, start_key: &Key, new_sqn: u64) -> Result<()> {
        let mut removed = self.levels[src_level].remove_run(start_key, 1)?;
        let entry = removed.pop().unwrap();
        self.levels[src_level + 1].insert(entry)?;
        self.manifest_sqn = self.manifest_sqn.max(new_sqn);
        self.recompute_basement();
        Ok(())
    }

    /// Levels holding more entries than their threshold, shallowest first,
    /// with the total excess across all of them.
    pub fn check_for_work(&self) -> (Vec<usize>, usize) {
        let mut over = Vec::new();
        let mut excess = 0;
        for level in &self.levels {
            let threshold = level.work_threshold();
            if level.len() > threshold {
                over.push(level.level_num);
                excess += level.len() - threshold;
            }
        }
        (over, excess)
    }

    /// Pick an entry at `level` to merge down. Selection is uniformly
    /// random to avoid worst-case accumulation under adversarial writes.
    pub fn mergefile_selector(&self, level: usize, rng: &mut StdRng) -> Option<ManifestEntry> {
        let entries = self.levels[level].entries();
        if entries.is_empty() {
            return None;
        }
        Some(entries[rng.gen_range(0..entries.len())].clone())
    }

    // ===== snapshot registry =====

    /// Record a snapshot holder observing the current generation.
    pub fn add_snapshot(&mut self, holder: u64, timeout: Duration) {
        self.snapshots.push(SnapshotRef {
            holder,
            manifest_sqn: self.manifest_sqn,
            deadline: Instant::now() + timeout,
        });
    }

    pub fn release_snapshot(&mut self, holder: u64) {
        self.snapshots.retain(|s| s.holder != holder);
    }

    /// Drop snapshots whose deadline has passed. The holder discovers its
    /// handle is dead on next use.
    pub fn drop_expired_snapshots(&mut self, now: Instant) {
        self.snapshots.retain(|s| {
            if s.deadline <= now {
                tracing::warn!(holder = s.holder, "snapshot deadline exceeded, dropping");
                false
            } else {
                true
            }
        });
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// The lowest generation any live snapshot observed, or 0 when none.
    pub fn min_snapshot_sqn(&self) -> u64 {
        self.snapshots
            .iter()
            .map(|s| s.manifest_sqn)
            .min()
            .unwrap_or(0)
    }

    // ===== pending deletes =====

    pub fn is_pending_delete(&self, filename: &str) -> bool {
        self.pending_deletes.contains_key(filename)
    }

    pub fn pending_delete_files(&self) -> Vec<String> {
        self.pending_deletes.keys().cloned().collect()
    }

    /// True when no live snapshot can still observe `filename`; a true
    /// answer removes it from the pending set. With no registered snapshots
    /// nothing pins a superseded file, so it is always ready.
    pub fn ready_to_delete(&mut self, filename: &str) -> bool {
        let Some(&removal_sqn) = self.pending_deletes.get(filename) else {
            return false;
        };
        let ready = self.snapshots.is_empty() || self.min_snapshot_sqn() >= removal_sqn;
        if ready {
            self.pending_deletes.remove(filename);
        }
        ready
    }

    // ===== clerk / snapshot copies =====

    /// A copy with the snapshot registry and pending-delete set blanked;
    /// handed to the clerk and to snapshot holders, which have no right to
    /// mutate those global fields.
    pub fn copy_blanked(&self) -> Manifest {
        Manifest {
            levels: self.levels.clone(),
            manifest_sqn: self.manifest_sqn,
            basement: self.basement,
            snapshots: Vec::new(),
            pending_deletes: HashMap::new(),
        }
    }

    /// Graft the registry fields the clerk's copy lacked back onto a
    /// returned manifest: the live snapshot set and any pending deletes
    /// accumulated before the clerk started.
    pub fn adopt_registries_from(&mut self, prior: &Manifest) {
        self.snapshots = prior.snapshots.clone();
        for (filename, sqn) in &prior.pending_deletes {
            self.pending_deletes.entry(filename.clone()).or_insert(*sqn);
        }
    }

    // ===== persistence =====

    fn generation_filename(sqn: u64, ext: &str) -> String {
        format!("nonzero_{sqn}.{ext}")
    }

    /// Write this manifest as a pending (uncommitted) generation file.
    pub fn save_pending(&self, dir: &Path) -> Result<PathBuf> {
        debug_assert!(
            self.levels[0].is_empty(),
            "level zero must never be persisted"
        );
        let persisted = PersistedManifest {
            levels: self
                .levels
                .iter()
                .map(|l| l.entries().iter().map(PersistedEntry::from).collect())
                .collect(),
            manifest_sqn: self.manifest_sqn,
            basement: self.basement,
        };
        let body = bincode::serialize(&persisted)?;
        let mut framed = vec![0u8; 4];
        BigEndian::write_u32(&mut framed, CRC32.checksum(&body));
        framed.extend_from_slice(&body);

        let path = dir.join(Self::generation_filename(self.manifest_sqn, PENDING_EXT));
        let mut file = fs::File::create(&path)?;
        file.write_all(&framed)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Commit this generation: rename `.pnd` to `.crr`. The rename is the
    /// commit point.
    pub fn commit(&self, dir: &Path) -> Result<()> {
        let pending = dir.join(Self::generation_filename(self.manifest_sqn, PENDING_EXT));
        let committed = dir.join(Self::generation_filename(self.manifest_sqn, COMMITTED_EXT));
        fs::rename(pending, committed)?;
        Ok(())
    }

    /// Committed generations present in `dir`, numerically descending.
    fn committed_generations(dir: &Path) -> Result<Vec<u64>> {
        let mut generations = Vec::new();
        for dirent in fs::read_dir(dir)? {
            let name = dirent?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(sqn) = name
                .strip_prefix("nonzero_")
                .and_then(|rest| rest.strip_suffix(".crr"))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                generations.push(sqn);
            }
        }
        generations.sort_unstable_by(|a, b| b.cmp(a));
        Ok(generations)
    }

    fn load_generation(manifest_dir: &Path, files_dir: &Path, sqn: u64) -> Result<Manifest> {
        let path = manifest_dir.join(Self::generation_filename(sqn, COMMITTED_EXT));
        let bytes = fs::read(&path)?;
        if bytes.len() < 4 {
            return Err(Error::InvalidData(format!(
                "manifest generation {sqn} truncated"
            )));
        }
        let (crc_bytes, body) = bytes.split_at(4);
        if BigEndian::read_u32(crc_bytes) != CRC32.checksum(body) {
            return Err(Error::InvalidData(format!(
                "manifest generation {sqn} checksum mismatch"
            )));
        }
        let persisted: PersistedManifest = bincode::deserialize(body)?;

        let mut manifest = Manifest::new();
        for (level_num, persisted_level) in persisted.levels.iter().enumerate().take(MAX_LEVELS) {
            for persisted_entry in persisted_level {
                let (owner, start_key, end_key) =
                    SstFile::open(files_dir, &persisted_entry.filename)?;
                manifest.levels[level_num].insert(ManifestEntry::new(
                    owner,
                    persisted_entry.filename.clone(),
                    start_key,
                    end_key,
                ))?;
            }
        }
        manifest.manifest_sqn = persisted.manifest_sqn;
        manifest.recompute_basement();
        Ok(manifest)
    }

    /// Open the newest intact committed generation, falling back generation
    /// by generation on corruption. With `tolerate_loss` an exhausted search
    /// starts empty (the upstream journal replays the difference); without
    /// it the open fails.
    pub fn load(manifest_dir: &Path, files_dir: &Path, tolerate_loss: bool) -> Result<Manifest> {
        let generations = Self::committed_generations(manifest_dir)?;
        if generations.is_empty() {
            return Ok(Manifest::new());
        }
        for sqn in &generations {
            match Self::load_generation(manifest_dir, files_dir, *sqn) {
                Ok(manifest) => {
                    tracing::info!(manifest_sqn = sqn, "opened manifest generation");
                    return Ok(manifest);
                }
                Err(e) => {
                    tracing::warn!(manifest_sqn = sqn, error = %e, "skipping manifest generation");
                }
            }
        }
        if tolerate_loss {
            tracing::error!("no intact manifest generation found, starting empty");
            Ok(Manifest::new())
        } else {
            Err(Error::InvalidData(
                "no intact manifest generation found".to_string(),
            ))
        }
    }

    /// Remove committed generations older than the current one, and any
    /// stray pending files. Only the newest `.crr` is needed for
    /// correctness.
    pub fn garbage_collect(&self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for dirent in entries.flatten() {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix("nonzero_") else {
                continue;
            };
            let stale = match rest.strip_suffix(".crr") {
                Some(digits) => digits
                    .parse::<u64>()
                    .map(|sqn| sqn < self.manifest_sqn)
                    .unwrap_or(false),
                None => rest.ends_with(&format!(".{PENDING_EXT}")),
            };
            if stale {
                if let Err(e) = fs::remove_file(dirent.path()) {
                    tracing::warn!(file = name, error = %e, "failed to remove stale manifest file");
                }
            }
        }
    }

    // ===== invariants =====

    /// Check the structural invariants: sorted disjoint runs at L1+, at
    /// most one L0 entry, and a correct basement.
    pub fn validate(&self) -> Result<()> {
        if self.levels[0].len() > 1 {
            return Err(Error::InvalidData(
                "level zero holds more than one entry".to_string(),
            ));
        }
        for level in &self.levels[1..] {
            let entries = level.entries();
            for pair in entries.windows(2) {
                if pair[0].start_key >= pair[1].start_key {
                    return Err(Error::InvalidData(format!(
                        "level {} is not sorted by start key",
                        level.level_num
                    )));
                }
                if pair[0].end_key >= pair[1].start_key {
                    return Err(Error::InvalidData(format!(
                        "level {} entries overlap",
                        level.level_num
                    )));
                }
            }
        }
        let expected_basement = self
            .levels
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| !l.is_empty())
            .map(|(n, _)| n)
            .unwrap_or(0);
        if self.basement != expected_basement {
            return Err(Error::InvalidData(format!(
                "basement {} does not match deepest non-empty level {}",
                self.basement, expected_basement
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::tmpfs::TempDir;
    use rand::SeedableRng;

    fn k(i: u32) -> Key {
        Key::object(b"b", format!("k{i:04}").as_bytes())
    }

    fn entry(dir: &Path, filename: &str, lo: u32, hi: u32) -> ManifestEntry {
        let records: Vec<(Key, Value)> =
            (lo..=hi).map(|i| (k(i), Value::active(i as u64))).collect();
        let (owner, start, end) = SstFile::create(dir, filename, records, hi as u64).unwrap();
        ManifestEntry::new(owner, filename.to_string(), start, end)
    }

    #[test]
    fn test_insert_advances_sqn_and_basement() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();

        manifest.insert(1, entry(dir.path(), "1_1_0.sst", 10, 19), 1)?;
        assert_eq!(manifest.manifest_sqn(), 1);
        assert_eq!(manifest.basement(), 1);

        manifest.insert(3, entry(dir.path(), "2_3_0.sst", 30, 39), 2)?;
        assert_eq!(manifest.basement(), 3);

        // The generation counter only moves forward.
        assert!(manifest
            .insert(1, entry(dir.path(), "3_1_0.sst", 50, 59), 1)
            .is_err());
        manifest.validate()
    }

    #[test]
    fn test_key_lookup_descends_to_owner() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        manifest.insert(1, entry(dir.path(), "1_1_0.sst", 10, 19), 1)?;
        manifest.insert(1, entry(dir.path(), "2_1_0.sst", 30, 39), 2)?;

        let hit = manifest.key_lookup(1, &k(35)).unwrap();
        assert_eq!(hit.filename, "2_1_0.sst");
        assert!(manifest.key_lookup(1, &k(25)).is_none());
        assert!(manifest.key_lookup(2, &k(35)).is_none());
        Ok(())
    }

    #[test]
    fn test_remove_marks_pending_deletes() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        manifest.insert(1, entry(dir.path(), "1_1_0.sst", 10, 19), 1)?;
        manifest.insert(1, entry(dir.path(), "2_1_0.sst", 30, 39), 2)?;

        let removed = manifest.remove(1, &k(10), 2, 3)?;
        assert_eq!(removed.len(), 2);
        assert_eq!(manifest.level_len(1), 0);
        assert_eq!(manifest.manifest_sqn(), 3);
        assert!(manifest.is_pending_delete("1_1_0.sst"));
        assert!(manifest.is_pending_delete("2_1_0.sst"));
        assert_eq!(manifest.basement(), 0);
        Ok(())
    }

    #[test]
    fn test_switch_moves_without_pending_delete() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        manifest.insert(1, entry(dir.path(), "1_1_0.sst", 10, 19), 1)?;

        manifest.switch(1, &k(10), 2)?;
        assert_eq!(manifest.level_len(1), 0);
        assert_eq!(manifest.level_len(2), 1);
        assert!(!manifest.is_pending_delete("1_1_0.sst"));
        assert_eq!(manifest.basement(), 2);
        manifest.validate()
    }

    #[test]
    fn test_check_for_work() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        let (no_work, excess) = manifest.check_for_work();
        assert!(no_work.is_empty());
        assert_eq!(excess, 0);

        // A resident L0 file is always work.
        manifest.insert(0, entry(dir.path(), "1_0_0.sst", 0, 9), 1)?;
        let (work, excess) = manifest.check_for_work();
        assert_eq!(work, vec![0]);
        assert_eq!(excess, 1);

        // Nine disjoint files push L1 one over its threshold of eight.
        for n in 0..9u32 {
            let filename = format!("{}_1_0.sst", n + 2);
            let lo = 100 + n * 10;
            manifest.insert(
                1,
                entry(dir.path(), &filename, lo, lo + 5),
                (n + 2) as u64,
            )?;
        }
        let (work, excess) = manifest.check_for_work();
        assert_eq!(work, vec![0, 1]);
        assert_eq!(excess, 2);
        Ok(())
    }

    #[test]
    fn test_mergefile_selector_seeded() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        for n in 0..4u32 {
            let filename = format!("{}_1_0.sst", n + 1);
            let lo = 10 * n;
            manifest.insert(
                1,
                entry(dir.path(), &filename, lo, lo + 5),
                (n + 1) as u64,
            )?;
        }

        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        let picks_a: Vec<String> = (0..8)
            .map(|_| manifest.mergefile_selector(1, &mut rng_a).unwrap().filename)
            .collect();
        let picks_b: Vec<String> = (0..8)
            .map(|_| manifest.mergefile_selector(1, &mut rng_b).unwrap().filename)
            .collect();
        assert_eq!(picks_a, picks_b);
        assert!(manifest.mergefile_selector(2, &mut rng_a).is_none());
        Ok(())
    }

    #[test]
    fn test_snapshot_registry_and_ready_to_delete() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        manifest.insert(1, entry(dir.path(), "1_1_0.sst", 10, 19), 1)?;

        // Snapshot observes generation 1, then the file is superseded at 2.
        manifest.add_snapshot(77, Duration::from_secs(600));
        assert_eq!(manifest.min_snapshot_sqn(), 1);
        manifest.remove(1, &k(10), 1, 2)?;

        assert!(!manifest.ready_to_delete("1_1_0.sst"));
        assert!(manifest.is_pending_delete("1_1_0.sst"));

        manifest.release_snapshot(77);
        assert!(manifest.ready_to_delete("1_1_0.sst"));
        assert!(!manifest.is_pending_delete("1_1_0.sst"));

        // Unknown files are never ready.
        assert!(!manifest.ready_to_delete("1_1_0.sst"));
        Ok(())
    }

    #[test]
    fn test_expired_snapshots_are_dropped() -> Result<()> {
        let mut manifest = Manifest::new();
        manifest.add_snapshot(1, Duration::from_secs(0));
        manifest.add_snapshot(2, Duration::from_secs(600));

        manifest.drop_expired_snapshots(Instant::now() + Duration::from_millis(1));
        assert_eq!(manifest.snapshot_count(), 1);
        Ok(())
    }

    #[test]
    fn test_copy_blanked_and_adopt() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        manifest.insert(1, entry(dir.path(), "1_1_0.sst", 10, 19), 1)?;
        manifest.add_snapshot(9, Duration::from_secs(600));
        manifest.remove(1, &k(10), 1, 2)?;

        let mut clerk_copy = manifest.copy_blanked();
        assert_eq!(clerk_copy.snapshot_count(), 0);
        assert!(clerk_copy.pending_delete_files().is_empty());
        assert_eq!(clerk_copy.manifest_sqn(), 2);

        clerk_copy.adopt_registries_from(&manifest);
        assert_eq!(clerk_copy.snapshot_count(), 1);
        assert!(clerk_copy.is_pending_delete("1_1_0.sst"));
        Ok(())
    }

    #[test]
    fn test_persist_commit_load_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest_dir = dir.path().join("manifest");
        let files_dir = dir.path().join("files");
        fs::create_dir_all(&manifest_dir)?;
        fs::create_dir_all(&files_dir)?;

        let mut manifest = Manifest::new();
        manifest.insert(1, entry(&files_dir, "1_1_0.sst", 10, 19), 1)?;
        manifest.insert(2, entry(&files_dir, "2_2_0.sst", 30, 49), 2)?;

        let pending = manifest.save_pending(&manifest_dir)?;
        assert!(pending.ends_with("nonzero_2.pnd"));
        // Uncommitted generations are invisible to load.
        let loaded = Manifest::load(&manifest_dir, &files_dir, true)?;
        assert_eq!(loaded.manifest_sqn(), 0);

        manifest.commit(&manifest_dir)?;
        let loaded = Manifest::load(&manifest_dir, &files_dir, true)?;
        assert_eq!(loaded.manifest_sqn(), 2);
        assert_eq!(loaded.basement(), 2);
        assert_eq!(loaded.level_len(1), 1);
        assert_eq!(loaded.level_len(2), 1);
        assert_eq!(loaded.key_lookup(1, &k(12)).unwrap().filename, "1_1_0.sst");
        loaded.validate()
    }

    #[test]
    fn test_load_falls_back_on_corruption() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest_dir = dir.path().join("manifest");
        let files_dir = dir.path().join("files");
        fs::create_dir_all(&manifest_dir)?;
        fs::create_dir_all(&files_dir)?;

        let mut manifest = Manifest::new();
        manifest.insert(1, entry(&files_dir, "1_1_0.sst", 10, 19), 1)?;
        manifest.save_pending(&manifest_dir)?;
        manifest.commit(&manifest_dir)?;

        manifest.insert(1, entry(&files_dir, "2_1_0.sst", 30, 39), 2)?;
        manifest.save_pending(&manifest_dir)?;
        manifest.commit(&manifest_dir)?;

        // Corrupt the newest generation; load falls back to the previous.
        let newest = manifest_dir.join("nonzero_2.crr");
        let mut bytes = fs::read(&newest)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&newest, bytes)?;

        let loaded = Manifest::load(&manifest_dir, &files_dir, true)?;
        assert_eq!(loaded.manifest_sqn(), 1);
        assert_eq!(loaded.level_len(1), 1);
        Ok(())
    }

    #[test]
    fn test_load_exhausted_candidates() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest_dir = dir.path().join("manifest");
        let files_dir = dir.path().join("files");
        fs::create_dir_all(&manifest_dir)?;
        fs::create_dir_all(&files_dir)?;

        fs::write(manifest_dir.join("nonzero_5.crr"), b"garbage")?;

        let loaded = Manifest::load(&manifest_dir, &files_dir, true)?;
        assert_eq!(loaded.manifest_sqn(), 0);

        match Manifest::load(&manifest_dir, &files_dir, false) {
            Err(Error::InvalidData(_)) => {}
            other => panic!("expected refusal, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_garbage_collect_keeps_newest() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest_dir = dir.path().join("manifest");
        let files_dir = dir.path().join("files");
        fs::create_dir_all(&manifest_dir)?;
        fs::create_dir_all(&files_dir)?;

        let mut manifest = Manifest::new();
        manifest.insert(1, entry(&files_dir, "1_1_0.sst", 10, 19), 1)?;
        manifest.save_pending(&manifest_dir)?;
        manifest.commit(&manifest_dir)?;

        manifest.insert(1, entry(&files_dir, "2_1_0.sst", 30, 39), 2)?;
        manifest.save_pending(&manifest_dir)?;
        manifest.commit(&manifest_dir)?;
        fs::write(manifest_dir.join("nonzero_9.pnd"), b"stray")?;

        manifest.garbage_collect(&manifest_dir);
        assert!(!manifest_dir.join("nonzero_1.crr").exists());
        assert!(manifest_dir.join("nonzero_2.crr").exists());
        assert!(!manifest_dir.join("nonzero_9.pnd").exists());
        Ok(())
    }

    #[test]
    fn test_validate_rejects_overlap() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        manifest.insert(1, entry(dir.path(), "1_1_0.sst", 10, 25), 1)?;
        manifest.insert(1, entry(dir.path(), "2_1_0.sst", 20, 39), 2)?;
        assert!(manifest.validate().is_err());
        Ok(())
    }
}
