//! The merged read path.
//!
//! Point lookups probe the L0 cache behind its hash index and then descend
//! level by level, returning the first hit; the descent order makes the
//! first hit the highest SQN. Range folds run a k-way merge over the
//! materialized cache and one lazy stream per level, resolving equal keys
//! by SQN dominance.

use std::collections::VecDeque;
use std::time::Instant;

use crate::codec::{endkey_passed, key_dominates, Dominance, Key, Value};
use crate::penciller::cache::L0Cache;
use crate::penciller::manifest::{Manifest, MAX_LEVELS};
use crate::sst::{SstPointer, ITERATOR_SCANWIDTH};

/// Probe the cache and the levels for `key`. Returns the highest-SQN live
/// record or `None`.
pub fn fetch(
    manifest: &Manifest,
    cache: Option<&L0Cache>,
    key: &Key,
    hash: u32,
    slow_fetch: std::time::Duration,
) -> Option<(Key, Value)> {
    if let Some(cache) = cache {
        if let Some(hit) = cache.lookup(key, hash) {
            return Some(hit);
        }
    }
    for level in 0..MAX_LEVELS {
        if let Some(entry) = manifest.key_lookup(level, key) {
            let started = Instant::now();
            let probed = entry.owner.get(key, hash);
            let elapsed = started.elapsed();
            if elapsed > slow_fetch {
                tracing::warn!(
                    level,
                    file = %entry.filename,
                    elapsed_us = elapsed.as_micros() as u64,
                    "slow sst fetch"
                );
            }
            if probed.is_some() {
                return probed;
            }
        }
    }
    None
}

/// True iff the live record for `key` carries an SQN at or below `sqn`.
/// A missing key answers false: a later tombstone may have existed.
pub fn check_sqn(
    manifest: &Manifest,
    cache: Option<&L0Cache>,
    key: &Key,
    hash: u32,
    sqn: u64,
    slow_fetch: std::time::Duration,
) -> bool {
    match fetch(manifest, cache, key, hash, slow_fetch) {
        Some((_, value)) => value.sqn() <= sqn,
        None => false,
    }
}

/// One level's contribution to a range fold: a queue of concrete records
/// backed by lazy pointers that are expanded a few records at a time.
pub struct QueryLevel {
    pub level: usize,
    front: VecDeque<(Key, Value)>,
    pointers: VecDeque<SstPointer>,
}

impl QueryLevel {
    pub fn new(level: usize, pointers: Vec<SstPointer>) -> Self {
        Self {
            level,
            front: VecDeque::new(),
            pointers: pointers.into(),
        }
    }

    /// Build the streams for every level intersecting `[start, end]`.
    pub fn from_manifest(manifest: &Manifest, start: &Key, end: Option<&Key>) -> Vec<QueryLevel> {
        (0..MAX_LEVELS)
            .map(|level| {
                let pointers = manifest
                    .range_lookup(level, start, end)
                    .iter()
                    .map(|entry| entry.owner.pointer(start, end))
                    .collect();
                QueryLevel::new(level, pointers)
            })
            .collect()
    }

    fn peek(&mut self) -> Option<&(Key, Value)> {
        while self.front.is_empty() {
            let pointer = self.pointers.front_mut()?;
            let expanded = pointer.expand(ITERATOR_SCANWIDTH);
            if expanded.is_empty() {
                self.pointers.pop_front();
            } else {
                self.front.extend(expanded);
            }
        }
        self.front.front()
    }

    fn pop(&mut self) -> Option<(Key, Value)> {
        self.peek()?;
        self.front.pop_front()
    }
}

/// The k-way dominance merge over the in-memory run and the level streams.
///
/// At each step the smallest key among all fronts is emitted. Equal keys
/// across levels resolve to the highest SQN (shallower level on a tie) with
/// the losers dropped; an equal key in the in-memory run shadows file
/// records of lower or equal SQN.
pub struct Keyfolder {
    imm: VecDeque<(Key, Value)>,
    levels: Vec<QueryLevel>,
    end: Option<Key>,
    // Winner of a level contest not yet consumed. Streams ascend, so it
    // stays minimal among the level sources until emitted or shadowed.
    pending: Option<(Key, Value)>,
}

impl Keyfolder {
    pub fn new(imm: Vec<(Key, Value)>, levels: Vec<QueryLevel>, end: Option<Key>) -> Self {
        Self {
            imm: imm.into(),
            levels,
            end,
            pending: None,
        }
    }

    fn imm_peek(&self) -> Option<&(Key, Value)> {
        let front = self.imm.front()?;
        if endkey_passed(self.end.as_ref(), &front.0) {
            return None;
        }
        Some(front)
    }

    /// Pop the best record at the minimal key across all levels, dropping
    /// shadowed records for the same key as a side effect.
    fn pop_level_candidate(&mut self) -> Option<(Key, Value)> {
        let end = self.end.clone();
        let mut min_key: Option<Key> = None;
        for level in self.levels.iter_mut() {
            if let Some((key, _)) = level.peek() {
                if endkey_passed(end.as_ref(), key) {
                    continue;
                }
                if min_key.as_ref().map_or(true, |m| key < m) {
                    min_key = Some(key.clone());
                }
            }
        }
        let min_key = min_key?;

        let mut best: Option<(Key, Value)> = None;
        for level in self.levels.iter_mut() {
            let matches = level
                .peek()
                .map(|(key, _)| *key == min_key)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let record = level.pop().unwrap();
            match &best {
                // Shallower levels were visited first, so a strictly higher
                // SQN is required to displace the current best.
                Some((_, value)) if record.1.sqn() <= value.sqn() => {}
                _ => best = Some(record),
            }
        }
        best
    }
}

impl Iterator for Keyfolder {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_none() {
            self.pending = self.pop_level_candidate();
        }
        let Some(imm) = self.imm_peek().cloned() else {
            return self.pending.take();
        };
        let Some(record) = self.pending.take() else {
            return self.imm.pop_front();
        };
        match key_dominates(&imm, &record) {
            Dominance::LeftFirst => {
                self.pending = Some(record);
                self.imm.pop_front()
            }
            Dominance::RightFirst => Some(record),
            Dominance::LeftDominant => {
                // In-memory shadows the file record; the loser is gone.
                self.imm.pop_front()
            }
            Dominance::RightDominant => {
                self.imm.pop_front();
                Some(record)
            }
        }
    }
}

/// Fold the merge through `f`, stopping after `max` emissions when `max`
/// is non-negative (`-1` folds the whole range).
pub fn fold_keys<A, F>(
    imm: Vec<(Key, Value)>,
    levels: Vec<QueryLevel>,
    end: Option<Key>,
    max: i64,
    init: A,
    mut f: F,
) -> A
where
    F: FnMut(A, Key, Value) -> A,
{
    let mut acc = init;
    let mut emitted: i64 = 0;
    for (key, value) in Keyfolder::new(imm, levels, end) {
        acc = f(acc, key, value);
        emitted += 1;
        if max >= 0 && emitted >= max {
            break;
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::SstFile;
    use crate::tmpfs::TempDir;
    use std::sync::Arc;

    fn key(name: &str) -> Key {
        Key::object(b"b", name.as_bytes())
    }

    fn level_from_file(
        dir: &TempDir,
        level: usize,
        filename: &str,
        records: Vec<(Key, Value)>,
        start: &Key,
        end: Option<&Key>,
    ) -> QueryLevel {
        let max_sqn = records.iter().map(|(_, v)| v.sqn()).max().unwrap();
        let (file, _, _) = SstFile::create(dir.path(), filename, records, max_sqn).unwrap();
        QueryLevel::new(level, vec![file.pointer(start, end)])
    }

    #[test]
    fn test_find_next_key_dominance_across_levels() -> crate::error::Result<()> {
        // Level 2 holds K1@5 and K5@4, level 3 holds K3@3, level 5 holds
        // K5@2. Emission order is K1, K3, K5, with K5 resolving to sqn 4
        // and the sqn-2 record dropped.
        let dir = TempDir::new()?;
        let start = key("K1");

        let l2 = level_from_file(
            &dir,
            2,
            "1_2_0.sst",
            vec![(key("K1"), Value::active(5)), (key("K5"), Value::active(4))],
            &start,
            None,
        );
        let l3 = level_from_file(
            &dir,
            3,
            "1_3_0.sst",
            vec![(key("K3"), Value::active(3))],
            &start,
            None,
        );
        let l5 = level_from_file(
            &dir,
            5,
            "1_5_0.sst",
            vec![(key("K5"), Value::active(2))],
            &start,
            None,
        );

        let folded: Vec<(Key, u64)> = Keyfolder::new(Vec::new(), vec![l2, l3, l5], None)
            .map(|(k, v)| (k, v.sqn()))
            .collect();
        assert_eq!(
            folded,
            vec![(key("K1"), 5), (key("K3"), 3), (key("K5"), 4)]
        );
        Ok(())
    }

    #[test]
    fn test_fold_with_in_memory_shadowing() -> crate::error::Result<()> {
        // In-memory K1@8, K6@7, K8@9 over a level emitting K1@5, K3@3,
        // K5@2; folding [K1, K6] yields (K1,8),(K3,3),(K5,2),(K6,7).
        let dir = TempDir::new()?;
        let start = key("K1");
        let end = key("K6");

        let level = level_from_file(
            &dir,
            1,
            "1_1_0.sst",
            vec![
                (key("K1"), Value::active(5)),
                (key("K3"), Value::active(3)),
                (key("K5"), Value::active(2)),
            ],
            &start,
            Some(&end),
        );
        let imm = vec![
            (key("K1"), Value::active(8)),
            (key("K6"), Value::active(7)),
            (key("K8"), Value::active(9)),
        ];

        let folded: Vec<(Key, u64)> =
            Keyfolder::new(imm, vec![level], Some(end))
                .map(|(k, v)| (k, v.sqn()))
                .collect();
        assert_eq!(
            folded,
            vec![
                (key("K1"), 8),
                (key("K3"), 3),
                (key("K5"), 2),
                (key("K6"), 7),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_fold_keys_respects_max() -> crate::error::Result<()> {
        let imm = vec![
            (key("K1"), Value::active(1)),
            (key("K2"), Value::active(2)),
            (key("K3"), Value::active(3)),
        ];
        let first = fold_keys(imm.clone(), Vec::new(), None, 1, Vec::new(), |mut acc, k, v| {
            acc.push((k, v.sqn()));
            acc
        });
        assert_eq!(first, vec![(key("K1"), 1)]);

        let unbounded = fold_keys(imm, Vec::new(), None, -1, 0usize, |acc, _, _| acc + 1);
        assert_eq!(unbounded, 3);
        Ok(())
    }

    #[test]
    fn test_fetch_descends_and_prefers_cache() -> crate::error::Result<()> {
        use crate::codec::{magic_hash, KeyHash};
        use crate::penciller::manifest::ManifestEntry;
        use std::collections::BTreeMap;
        use std::time::Duration;

        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();

        let (file, start, end) = SstFile::create(
            dir.path(),
            "1_1_0.sst",
            vec![(key("K1"), Value::active(3)), (key("K2"), Value::active(4))],
            4,
        )?;
        manifest.insert(1, ManifestEntry::new(file, "1_1_0.sst".into(), start, end), 1)?;

        let mut cache = L0Cache::new();
        let mut tree = BTreeMap::new();
        tree.insert(key("K1"), Value::active(9));
        cache.push(Arc::new(tree));

        let hash = |k: &Key| match magic_hash(k) {
            KeyHash::Lookup(h) => h,
            KeyHash::NoLookup => panic!("expected lookupable key"),
        };
        let slow = Duration::from_millis(20);

        let k1 = key("K1");
        let (_, v) = fetch(&manifest, Some(&cache), &k1, hash(&k1), slow).unwrap();
        assert_eq!(v.sqn(), 9);

        let k2 = key("K2");
        let (_, v) = fetch(&manifest, Some(&cache), &k2, hash(&k2), slow).unwrap();
        assert_eq!(v.sqn(), 4);

        let k9 = key("K9");
        assert!(fetch(&manifest, Some(&cache), &k9, hash(&k9), slow).is_none());

        assert!(check_sqn(&manifest, Some(&cache), &k2, hash(&k2), 4, slow));
        assert!(check_sqn(&manifest, Some(&cache), &k2, hash(&k2), 7, slow));
        assert!(!check_sqn(&manifest, Some(&cache), &k2, hash(&k2), 3, slow));
        assert!(!check_sqn(&manifest, Some(&cache), &k9, hash(&k9), 10, slow));
        Ok(())
    }
}
