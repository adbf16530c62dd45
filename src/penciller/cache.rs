//! The level-zero cache: pushed batches staged ahead of the L0 file.
//!
//! Each accepted push becomes an immutable batch; the cache is probed
//! newest-batch-first so that the first hit is always the highest SQN. A
//! merged 256-bucket hash-position index lets point lookups skip batches
//! that cannot contain the key.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::{endkey_passed, magic_hash, Key, KeyHash, Value};

/// Buckets in the merged hash-position index.
const INDEX_BUCKETS: usize = 256;

/// One immutable pushed batch and the highest SQN it carries.
#[derive(Clone)]
pub struct PushBatch {
    pub tree: Arc<BTreeMap<Key, Value>>,
    pub max_sqn: u64,
}

/// The L0 staging cache.
#[derive(Clone)]
pub struct L0Cache {
    // Oldest batch first; probes walk the index entries newest-first.
    batches: Vec<PushBatch>,
    index: Vec<Vec<(u32, u32)>>,
    key_count: usize,
}

impl Default for L0Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl L0Cache {
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            index: vec![Vec::new(); INDEX_BUCKETS],
            key_count: 0,
        }
    }

    /// Rebuild a cache around existing batches without the hash index, for
    /// clones that will only ever iterate.
    pub fn from_batches(batches: Vec<PushBatch>) -> Self {
        let key_count = batches.iter().map(|b| b.tree.len()).sum();
        Self {
            batches,
            index: vec![Vec::new(); INDEX_BUCKETS],
            key_count,
        }
    }

    /// Wrap a bookie-supplied tree as a batch.
    pub fn batch_from_tree(tree: Arc<BTreeMap<Key, Value>>) -> PushBatch {
        let max_sqn = tree.values().map(Value::sqn).max().unwrap_or(0);
        PushBatch { tree, max_sqn }
    }

    /// Total cached keys across all batches.
    pub fn len(&self) -> usize {
        self.key_count
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Batch `i` counting from the newest push, for slot-at-a-time reads.
    pub fn batch_newest_first(&self, i: usize) -> Arc<BTreeMap<Key, Value>> {
        Arc::clone(&self.batches[self.batches.len() - 1 - i].tree)
    }

    pub fn batches(&self) -> &[PushBatch] {
        &self.batches
    }

    /// Highest SQN ever accepted into the cache, or 0 when empty.
    pub fn max_sqn(&self) -> u64 {
        self.batches.iter().map(|b| b.max_sqn).max().unwrap_or(0)
    }

    /// Append a pushed batch, indexing its lookable keys. Returns the
    /// batch's highest SQN.
    pub fn push(&mut self, tree: Arc<BTreeMap<Key, Value>>) -> u64 {
        let slot = self.batches.len() as u32;
        let mut max_sqn = 0;
        for (key, value) in tree.iter() {
            max_sqn = max_sqn.max(value.sqn());
            if let KeyHash::Lookup(hash) = magic_hash(key) {
                self.index[hash as usize % INDEX_BUCKETS].push((slot, hash));
            }
        }
        self.key_count += tree.len();
        self.batches.push(PushBatch { tree, max_sqn });
        max_sqn
    }

    /// Hash-gated point probe. Index entries are walked newest-first, so
    /// the first tree hit carries the highest SQN in the cache.
    pub fn lookup(&self, key: &Key, hash: u32) -> Option<(Key, Value)> {
        let bucket = &self.index[hash as usize % INDEX_BUCKETS];
        for &(slot, entry_hash) in bucket.iter().rev() {
            if entry_hash != hash {
                continue;
            }
            if let Some(value) = self.batches[slot as usize].tree.get(key) {
                return Some((key.clone(), value.clone()));
            }
        }
        None
    }

    /// Merge every batch (and optionally a bookie-supplied tree, which is
    /// newer than anything pushed) into a single sorted run restricted to
    /// `[start, end]`. Per key the highest SQN survives.
    pub fn materialize_range(
        &self,
        start: &Key,
        end: Option<&Key>,
        bookie: Option<&BTreeMap<Key, Value>>,
    ) -> Vec<(Key, Value)> {
        let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
        let sources = self
            .batches
            .iter()
            .map(|b| b.tree.as_ref())
            .chain(bookie.into_iter());
        for tree in sources {
            for (key, value) in tree.range(start.clone()..) {
                if endkey_passed(end, key) {
                    break;
                }
                match merged.get(key) {
                    Some(existing) if existing.sqn() > value.sqn() => {}
                    _ => {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Drop every batch and the index, once their contents are safely in an
    /// L0 file.
    pub fn clear(&mut self) {
        self.batches.clear();
        self.index = vec![Vec::new(); INDEX_BUCKETS];
        self.key_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(i: u32) -> Key {
        Key::object(b"b", format!("k{i:04}").as_bytes())
    }

    fn lookup_hash(key: &Key) -> u32 {
        match magic_hash(key) {
            KeyHash::Lookup(h) => h,
            KeyHash::NoLookup => panic!("expected lookupable key"),
        }
    }

    fn batch(entries: &[(u32, u64)]) -> Arc<BTreeMap<Key, Value>> {
        Arc::new(
            entries
                .iter()
                .map(|&(i, sqn)| (k(i), Value::active(sqn)))
                .collect(),
        )
    }

    #[test]
    fn test_push_tracks_max_sqn_and_size() {
        let mut cache = L0Cache::new();
        let max = cache.push(batch(&[(1, 5), (2, 7), (3, 6)]));
        assert_eq!(max, 7);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.batch_count(), 1);
        assert_eq!(cache.max_sqn(), 7);
    }

    #[test]
    fn test_lookup_newest_batch_wins() {
        let mut cache = L0Cache::new();
        cache.push(batch(&[(1, 5), (2, 6)]));
        cache.push(batch(&[(1, 9)]));

        let key = k(1);
        let (_, value) = cache.lookup(&key, lookup_hash(&key)).unwrap();
        assert_eq!(value.sqn(), 9);

        let key2 = k(2);
        let (_, value) = cache.lookup(&key2, lookup_hash(&key2)).unwrap();
        assert_eq!(value.sqn(), 6);

        let missing = k(99);
        assert!(cache.lookup(&missing, lookup_hash(&missing)).is_none());
    }

    #[test]
    fn test_batch_newest_first() {
        let mut cache = L0Cache::new();
        cache.push(batch(&[(1, 1)]));
        cache.push(batch(&[(2, 2)]));

        assert!(cache.batch_newest_first(0).contains_key(&k(2)));
        assert!(cache.batch_newest_first(1).contains_key(&k(1)));
    }

    #[test]
    fn test_materialize_range_shadows_by_sqn() {
        let mut cache = L0Cache::new();
        cache.push(batch(&[(1, 5), (3, 3), (8, 2)]));
        cache.push(batch(&[(1, 9), (5, 4)]));

        let run = cache.materialize_range(&k(1), Some(&k(5)), None);
        let got: Vec<(u32, u64)> = run
            .iter()
            .map(|(key, value)| {
                let digits = &key.as_bytes()[key.as_bytes().len() - 4..];
                (
                    std::str::from_utf8(digits).unwrap().parse().unwrap(),
                    value.sqn(),
                )
            })
            .collect();
        assert_eq!(got, vec![(1, 9), (3, 3), (5, 4)]);
    }

    #[test]
    fn test_materialize_range_folds_bookie_tree() {
        let mut cache = L0Cache::new();
        cache.push(batch(&[(1, 5)]));

        let bookie = batch(&[(1, 12), (2, 11)]);
        let run = cache.materialize_range(&k(1), None, Some(bookie.as_ref()));
        assert_eq!(run.len(), 2);
        assert_eq!(run[0].1.sqn(), 12);
        assert_eq!(run[1].1.sqn(), 11);
    }

    #[test]
    fn test_clear() {
        let mut cache = L0Cache::new();
        cache.push(batch(&[(1, 5)]));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        let key = k(1);
        assert!(cache.lookup(&key, lookup_hash(&key)).is_none());
    }
}
