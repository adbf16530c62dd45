//! Point-in-time clones of the penciller.
//!
//! A snapshot carries a blanked copy of the manifest and a materialization
//! of the L0 cache taken at registration. Reads run entirely on the caller's
//! side, so range folds never block the live penciller. While registered,
//! the snapshot pins every file visible at its observed manifest generation
//! through the pending-delete protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec::{endkey_passed, magic_hash, Key, KeyHash, Value};
use crate::error::{Error, Result};
use crate::penciller::cache::L0Cache;
use crate::penciller::manifest::Manifest;
use crate::penciller::reader::{self, QueryLevel};
use crate::penciller::server::Command;

/// How a snapshot is registered.
#[derive(Clone, Debug)]
pub enum SnapshotMode {
    /// Full clone: cache plus hash index; services point and range reads.
    Full,
    /// Clone without the hash index; iteration only.
    NoLookup,
    /// The cache is merge-intersected with `[start, end]` immediately and
    /// only the resulting ordered run is retained; iteration only, and
    /// only within the registered range.
    Range { start: Key, end: Option<Key> },
}

pub(crate) enum SnapshotStore {
    Cache { cache: L0Cache, lookup: bool },
    Range { astree: Vec<(Key, Value)> },
}

pub(crate) struct SnapshotSeed {
    pub holder: u64,
    pub manifest: Manifest,
    pub store: SnapshotStore,
}

/// A registered point-in-time view. Dropping the snapshot releases it on a
/// best-effort basis; calling [`PencillerSnapshot::release`] is certain.
pub struct PencillerSnapshot {
    holder: u64,
    manifest: Manifest,
    store: SnapshotStore,
    slow_fetch: Duration,
    releaser: Option<mpsc::Sender<Command>>,
}

impl PencillerSnapshot {
    pub(crate) fn assemble(
        seed: SnapshotSeed,
        slow_fetch: Duration,
        releaser: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            holder: seed.holder,
            manifest: seed.manifest,
            store: seed.store,
            slow_fetch,
            releaser: Some(releaser),
        }
    }

    pub fn holder(&self) -> u64 {
        self.holder
    }

    /// The manifest as observed at registration.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Point lookup against the frozen view. Only full clones carry the
    /// hash index needed to answer.
    pub fn fetch(&self, key: &Key) -> Result<Option<(Key, Value)>> {
        let KeyHash::Lookup(hash) = magic_hash(key) else {
            return Err(Error::NotLookupable);
        };
        let SnapshotStore::Cache {
            cache,
            lookup: true,
        } = &self.store
        else {
            return Err(Error::NotLookupable);
        };
        Ok(reader::fetch(
            &self.manifest,
            Some(cache),
            key,
            hash,
            self.slow_fetch,
        ))
    }

    /// True iff the frozen view holds `key` with an SQN at or below `sqn`.
    pub fn check_sqn(&self, key: &Key, sqn: u64) -> Result<bool> {
        Ok(self
            .fetch(key)?
            .map(|(_, value)| value.sqn() <= sqn)
            .unwrap_or(false))
    }

    /// Fold the merged view of `[start, end]` through `f`, stopping after
    /// `max` records when `max` is non-negative.
    pub fn fetch_keys<A, F>(
        &self,
        start: &Key,
        end: Option<&Key>,
        max: i64,
        init: A,
        f: F,
    ) -> A
    where
        F: FnMut(A, Key, Value) -> A,
    {
        let imm = match &self.store {
            SnapshotStore::Cache { cache, .. } => cache.materialize_range(start, end, None),
            SnapshotStore::Range { astree } => astree
                .iter()
                .skip_while(|(key, _)| key < start)
                .take_while(|(key, _)| !endkey_passed(end, key))
                .cloned()
                .collect(),
        };
        let levels = QueryLevel::from_manifest(&self.manifest, start, end);
        reader::fold_keys(imm, levels, end.cloned(), max, init, f)
    }

    /// The first record at or after `start`, within the bound.
    pub fn fetch_next_key(&self, start: &Key, end: Option<&Key>) -> Option<(Key, Value)> {
        self.fetch_keys(start, end, 1, None, |_, key, value| Some((key, value)))
    }

    /// Release the registration, unpinning the files this view held.
    pub async fn release(mut self) {
        if let Some(releaser) = self.releaser.take() {
            let _ = releaser
                .send(Command::ReleaseSnapshot {
                    holder: self.holder,
                })
                .await;
        }
    }
}

impl Drop for PencillerSnapshot {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            let _ = releaser.try_send(Command::ReleaseSnapshot {
                holder: self.holder,
            });
        }
    }
}

/// Build the store for a registration against the live cache state.
pub(crate) fn build_store(
    mode: &SnapshotMode,
    cache: &L0Cache,
    bookie: Option<BTreeMap<Key, Value>>,
) -> SnapshotStore {
    match mode {
        SnapshotMode::Full => {
            let mut clone = cache.clone();
            if let Some(tree) = bookie {
                if !tree.is_empty() {
                    clone.push(Arc::new(tree));
                }
            }
            SnapshotStore::Cache {
                cache: clone,
                lookup: true,
            }
        }
        SnapshotMode::NoLookup => {
            let mut batches = cache.batches().to_vec();
            if let Some(tree) = bookie {
                if !tree.is_empty() {
                    batches.push(L0Cache::batch_from_tree(Arc::new(tree)));
                }
            }
            SnapshotStore::Cache {
                cache: L0Cache::from_batches(batches),
                lookup: false,
            }
        }
        SnapshotMode::Range { start, end } => SnapshotStore::Range {
            astree: cache.materialize_range(start, end.as_ref(), bookie.as_ref()),
        },
    }
}
