//! The penciller server: a single-writer actor owning the manifest and the
//! L0 cache.
//!
//! Every mutating operation arrives as a command on one channel and is
//! handled straight-line over in-memory state, so handlers never observe a
//! torn manifest. The compaction clerk and the L0 writer run as independent
//! tasks and report back through the same channel.
//!
//! # L0 admission states
//!
//! - **idle**: no L0 file exists; pushes append to the cache.
//! - **flushing**: the cache is frozen behind an in-flight L0 build;
//!   pushes are returned to the bookie.
//! - **l0 resident**: an L0 file sits in the manifest; a fresh cache keeps
//!   accepting pushes until the clerk merges the file down.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::codec::{magic_hash, Key, KeyHash, Value};
use crate::config::{PencillerConfig, SUPER_MAX_CACHE_SIZE};
use crate::error::{Error, Result};
use crate::penciller::cache::L0Cache;
use crate::penciller::clerk;
use crate::penciller::manifest::{Manifest, ManifestEntry, MAX_LEVELS};
use crate::penciller::reader;
use crate::penciller::snapshot::{
    build_store, PencillerSnapshot, SnapshotMode, SnapshotSeed,
};
use crate::sst::{self, L0Completion, SstFile};

/// Outcome of a push: accepted and durably ordered, or returned for the
/// bookie to hold and retry. A return is flow control, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushResult {
    Accepted,
    Returned,
}

/// A consistent view of the server's coordination state.
#[derive(Clone, Debug)]
pub struct PencillerStatus {
    pub ledger_sqn: u64,
    pub persisted_sqn: u64,
    pub manifest_sqn: u64,
    pub cache_keys: usize,
    pub cache_batches: usize,
    pub l0_pending: bool,
    pub level0_present: bool,
    pub work_ongoing: bool,
    pub work_backlog: bool,
    pub snapshot_count: usize,
    pub pending_delete_count: usize,
    pub level_lens: Vec<usize>,
}

pub(crate) enum Command {
    Push {
        batch: Arc<BTreeMap<Key, Value>>,
        reply: oneshot::Sender<Result<PushResult>>,
    },
    Fetch {
        key: Key,
        hash: KeyHash,
        reply: oneshot::Sender<Result<Option<(Key, Value)>>>,
    },
    CheckSqn {
        key: Key,
        hash: KeyHash,
        sqn: u64,
        reply: oneshot::Sender<bool>,
    },
    RegisterSnapshot {
        mode: SnapshotMode,
        long_running: bool,
        bookie: Option<BTreeMap<Key, Value>>,
        reply: oneshot::Sender<SnapshotSeed>,
    },
    ReleaseSnapshot {
        holder: u64,
    },
    WorkForClerk {
        reply: oneshot::Sender<Option<(usize, Manifest)>>,
    },
    ManifestChange {
        result: Result<Manifest>,
    },
    L0Complete {
        result: Result<L0Completion>,
    },
    ConfirmDelete {
        filename: String,
        reply: oneshot::Sender<bool>,
    },
    GetStartupSqn {
        reply: oneshot::Sender<u64>,
    },
    Status {
        reply: oneshot::Sender<PencillerStatus>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Doom {
        reply: oneshot::Sender<Result<Vec<PathBuf>>>,
    },
}

pub(crate) struct PencillerServer {
    config: PencillerConfig,
    manifest: Manifest,
    cache: L0Cache,
    ledger_sqn: u64,
    persisted_sqn: u64,
    l0_pending: bool,
    work_ongoing: bool,
    work_backlog: bool,
    rng: StdRng,
    next_holder: u64,
    clerk_prompt: Arc<Notify>,
    cmd_tx: mpsc::Sender<Command>,
}

impl PencillerServer {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Push { batch, reply } => self.handle_push(batch, reply),
                Command::Fetch { key, hash, reply } => {
                    let _ = reply.send(self.handle_fetch(&key, hash));
                }
                Command::CheckSqn {
                    key,
                    hash,
                    sqn,
                    reply,
                } => {
                    let answer = match hash {
                        KeyHash::Lookup(hash) => reader::check_sqn(
                            &self.manifest,
                            Some(&self.cache),
                            &key,
                            hash,
                            sqn,
                            self.config.slow_fetch,
                        ),
                        KeyHash::NoLookup => false,
                    };
                    let _ = reply.send(answer);
                }
                Command::RegisterSnapshot {
                    mode,
                    long_running,
                    bookie,
                    reply,
                } => {
                    let _ = reply.send(self.handle_register_snapshot(mode, long_running, bookie));
                }
                Command::ReleaseSnapshot { holder } => {
                    self.manifest.release_snapshot(holder);
                    self.sweep_deletes();
                }
                Command::WorkForClerk { reply } => {
                    let _ = reply.send(self.handle_work_for_clerk());
                }
                Command::ManifestChange { result } => self.handle_manifest_change(result),
                Command::L0Complete { result } => self.handle_l0_complete(result),
                Command::ConfirmDelete { filename, reply } => {
                    let _ = reply.send(self.handle_confirm_delete(&filename));
                }
                Command::GetStartupSqn { reply } => {
                    let _ = reply.send(self.persisted_sqn);
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Close { reply } => {
                    let _ = reply.send(self.handle_close().await);
                    break;
                }
                Command::Doom { reply } => {
                    let paths = vec![self.config.manifest_dir(), self.config.files_dir()];
                    let result = self.handle_close().await.map(|()| paths);
                    let _ = reply.send(result);
                    break;
                }
            }
        }
        tracing::info!("penciller server stopped");
    }

    // ===== push and the L0 state machine =====

    fn handle_push(
        &mut self,
        batch: Arc<BTreeMap<Key, Value>>,
        reply: oneshot::Sender<Result<PushResult>>,
    ) {
        if self.l0_pending || self.work_backlog {
            let _ = reply.send(Ok(PushResult::Returned));
            return;
        }
        if batch.is_empty() {
            let _ = reply.send(Ok(PushResult::Accepted));
            return;
        }
        let batch_max = batch.values().map(Value::sqn).max().unwrap_or(0);
        if batch_max < self.ledger_sqn {
            let _ = reply.send(Err(Error::SqnRegression {
                pushed: batch_max,
                ledger: self.ledger_sqn,
            }));
            return;
        }

        // The admission decision is final; reply before the index merge.
        let _ = reply.send(Ok(PushResult::Accepted));
        self.cache.push(batch);
        self.ledger_sqn = batch_max;
        self.maybe_start_l0_flush();
    }

    fn maybe_start_l0_flush(&mut self) {
        let size = self.cache.len();
        if size <= self.config.max_cache_size {
            return;
        }
        let free = !self.manifest.level0_present();
        let quiet = !self.work_ongoing;
        let jitter = size > SUPER_MAX_CACHE_SIZE
            || !self.config.coin_toss_flush
            || self.rng.gen_range(0..5) == 0;
        if !(free && quiet && jitter) {
            return;
        }

        self.l0_pending = true;
        let filename = sst::l0_filename(self.manifest.manifest_sqn() + 1);
        let n_slots = self.cache.batch_count();
        let slots: Vec<Arc<BTreeMap<Key, Value>>> = (0..n_slots)
            .map(|i| self.cache.batch_newest_first(i))
            .collect();
        let fetch_slot = move |i: usize| Arc::clone(&slots[i]);
        let dir = self.config.files_dir();
        let max_sqn = self.ledger_sqn;
        let tx = self.cmd_tx.clone();

        tracing::info!(keys = size, file = %filename, "level zero flush started");
        tokio::spawn(async move {
            let result = sst::write_level_zero(dir, filename, n_slots, fetch_slot, max_sqn).await;
            let _ = tx.send(Command::L0Complete { result }).await;
        });
    }

    fn handle_l0_complete(&mut self, result: Result<L0Completion>) {
        self.l0_pending = false;
        match result {
            Ok(completion) => {
                let new_sqn = self.manifest.manifest_sqn() + 1;
                let entry = ManifestEntry::new(
                    completion.file,
                    completion.filename.clone(),
                    completion.start_key,
                    completion.end_key,
                );
                if let Err(e) = self.manifest.insert(0, entry, new_sqn) {
                    tracing::error!(error = %e, "level zero insert failed");
                    return;
                }
                self.persisted_sqn = self.ledger_sqn;
                self.cache.clear();
                self.clerk_prompt.notify_one();
                tracing::info!(
                    file = %completion.filename,
                    persisted_sqn = self.persisted_sqn,
                    "level zero flush complete"
                );
                #[cfg(debug_assertions)]
                if let Err(e) = self.manifest.validate() {
                    tracing::error!(error = %e, "manifest invalid after level zero insert");
                }
            }
            Err(e) => {
                // The cache is retained; a later push retries the flush and
                // everything beyond persisted_sqn is journal-recoverable.
                tracing::error!(error = %e, "level zero build failed, cache retained");
            }
        }
    }

    // ===== reads =====

    fn handle_fetch(&self, key: &Key, hash: KeyHash) -> Result<Option<(Key, Value)>> {
        let KeyHash::Lookup(hash) = hash else {
            return Err(Error::NotLookupable);
        };
        Ok(reader::fetch(
            &self.manifest,
            Some(&self.cache),
            key,
            hash,
            self.config.slow_fetch,
        ))
    }

    // ===== snapshots =====

    fn handle_register_snapshot(
        &mut self,
        mode: SnapshotMode,
        long_running: bool,
        bookie: Option<BTreeMap<Key, Value>>,
    ) -> SnapshotSeed {
        let holder = self.next_holder;
        self.next_holder += 1;
        let timeout = if long_running {
            self.config.snapshot_timeout_long
        } else {
            self.config.snapshot_timeout
        };
        self.manifest.add_snapshot(holder, timeout);
        SnapshotSeed {
            holder,
            manifest: self.manifest.copy_blanked(),
            store: build_store(&mode, &self.cache, bookie),
        }
    }

    // ===== compaction protocol =====

    fn handle_work_for_clerk(&mut self) -> Option<(usize, Manifest)> {
        // The clerk re-asks at least every max_work_wait, which bounds how
        // long an expired snapshot can linger.
        self.manifest.drop_expired_snapshots(Instant::now());
        if self.config.pause_compaction || self.l0_pending || self.work_ongoing {
            return None;
        }
        let (overflow, excess) = self.manifest.check_for_work();
        if excess == 0 {
            self.work_backlog = false;
            return None;
        }
        let backlog = excess > self.config.backlog_tolerance;
        if backlog && !self.work_backlog {
            tracing::warn!(excess, "compaction backlog, gating pushes");
        }
        self.work_backlog = backlog;
        self.work_ongoing = true;
        Some((overflow[0], self.manifest.copy_blanked()))
    }

    fn handle_manifest_change(&mut self, result: Result<Manifest>) {
        self.work_ongoing = false;
        let mut new_manifest = match result {
            Ok(manifest) => manifest,
            Err(e) => {
                // Commit happens at the rename, so the old manifest is
                // intact and the half-written .pnd is garbage.
                tracing::error!(error = %e, "compaction failed, manifest unchanged");
                return;
            }
        };
        new_manifest.adopt_registries_from(&self.manifest);
        if let Err(e) = new_manifest.commit(&self.config.manifest_dir()) {
            tracing::error!(error = %e, "manifest commit failed, retaining previous");
            return;
        }
        tracing::info!(
            manifest_sqn = new_manifest.manifest_sqn(),
            basement = new_manifest.basement(),
            "manifest change committed"
        );
        self.manifest = new_manifest;
        #[cfg(debug_assertions)]
        if let Err(e) = self.manifest.validate() {
            tracing::error!(error = %e, "manifest invalid after commit");
        }
        self.sweep_deletes();
        self.clerk_prompt.notify_one();
    }

    /// Remove files whose pending delete is no longer pinned by any
    /// snapshot, and stale manifest generations.
    fn sweep_deletes(&mut self) {
        self.manifest.drop_expired_snapshots(Instant::now());
        if self.work_ongoing {
            return;
        }
        let files_dir = self.config.files_dir();
        for filename in self.manifest.pending_delete_files() {
            if self.manifest.ready_to_delete(&filename) {
                match SstFile::remove(&files_dir, &filename) {
                    Ok(()) => tracing::debug!(file = %filename, "deleted superseded sst"),
                    Err(e) => tracing::warn!(file = %filename, error = %e, "sst delete failed"),
                }
            }
        }
        self.manifest.garbage_collect(&self.config.manifest_dir());
    }

    fn handle_confirm_delete(&mut self, filename: &str) -> bool {
        if self.work_ongoing {
            return false;
        }
        let ready = self.manifest.ready_to_delete(filename);
        if ready {
            if let Err(e) = SstFile::remove(&self.config.files_dir(), filename) {
                tracing::warn!(file = %filename, error = %e, "sst delete failed");
            }
        }
        ready
    }

    // ===== shutdown =====

    async fn handle_close(&mut self) -> Result<()> {
        if !self.l0_pending && !self.cache.is_empty() {
            // Restart probes exactly one L0 name, derived from the last
            // committed generation. With an L0 file already resident the
            // in-memory generation is one ahead of the committed one, so a
            // file written under a fresh name would never be found again:
            // fold the resident file into a rewrite under its own name
            // instead.
            let resident = self.manifest.entries(0).first().cloned();
            let filename = match &resident {
                Some(entry) => entry.filename.clone(),
                None => sst::l0_filename(self.manifest.manifest_sqn() + 1),
            };
            let mut slots: Vec<Arc<BTreeMap<Key, Value>>> = (0..self.cache.batch_count())
                .map(|i| self.cache.batch_newest_first(i))
                .collect();
            if let Some(entry) = resident {
                // Oldest slot: every cached batch was pushed after the
                // resident file was written.
                slots.push(Arc::new(entry.owner.records().iter().cloned().collect()));
            }
            let n_slots = slots.len();
            let fetch_slot = move |i: usize| Arc::clone(&slots[i]);
            match sst::write_level_zero(
                self.config.files_dir(),
                filename.clone(),
                n_slots,
                fetch_slot,
                self.ledger_sqn,
            )
            .await
            {
                Ok(_) => {
                    self.persisted_sqn = self.ledger_sqn;
                    self.cache.clear();
                    tracing::info!(file = %filename, "final level zero written on close");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "final flush failed, journal will replay");
                }
            }
        } else if !self.cache.is_empty() {
            tracing::info!(
                keys = self.cache.len(),
                "cache discarded on close, journal will replay"
            );
        }
        self.clerk_prompt.notify_waiters();
        Ok(())
    }

    fn status(&self) -> PencillerStatus {
        PencillerStatus {
            ledger_sqn: self.ledger_sqn,
            persisted_sqn: self.persisted_sqn,
            manifest_sqn: self.manifest.manifest_sqn(),
            cache_keys: self.cache.len(),
            cache_batches: self.cache.batch_count(),
            l0_pending: self.l0_pending,
            level0_present: self.manifest.level0_present(),
            work_ongoing: self.work_ongoing,
            work_backlog: self.work_backlog,
            snapshot_count: self.manifest.snapshot_count(),
            pending_delete_count: self.manifest.pending_delete_files().len(),
            level_lens: (0..MAX_LEVELS).map(|l| self.manifest.level_len(l)).collect(),
        }
    }
}

/// The public handle to a penciller. Cloneable; all clones address the same
/// server task.
#[derive(Clone)]
pub struct Penciller {
    tx: mpsc::Sender<Command>,
    clerk_prompt: Arc<Notify>,
    slow_fetch: std::time::Duration,
}

impl Penciller {
    /// Open (or recover) a penciller under the configured root and start
    /// its server and clerk tasks.
    pub async fn start(config: PencillerConfig) -> Result<Penciller> {
        let manifest_dir = config.manifest_dir();
        let files_dir = config.files_dir();
        fs::create_dir_all(&manifest_dir)?;
        fs::create_dir_all(&files_dir)?;

        let mut manifest = Manifest::load(
            &manifest_dir,
            &files_dir,
            config.tolerate_manifest_loss,
        )?;
        manifest.garbage_collect(&manifest_dir);

        // L0 is never persisted in the manifest; probe the filesystem for
        // the file the next generation would have written.
        let l0_name = sst::l0_filename(manifest.manifest_sqn() + 1);
        if files_dir.join(&l0_name).exists() {
            match SstFile::open(&files_dir, &l0_name) {
                Ok((file, start_key, end_key)) => {
                    let new_sqn = manifest.manifest_sqn() + 1;
                    manifest.insert(
                        0,
                        ManifestEntry::new(file, l0_name.clone(), start_key, end_key),
                        new_sqn,
                    )?;
                    tracing::info!(file = %l0_name, "recovered level zero file");
                }
                Err(e) => {
                    // A torn L0 write from a crash; the journal replays it.
                    tracing::warn!(file = %l0_name, error = %e, "ignoring unreadable level zero file");
                }
            }
        }

        let startup_sqn = (0..MAX_LEVELS)
            .flat_map(|level| manifest.entries(level))
            .map(|entry| entry.owner.max_sqn())
            .max()
            .unwrap_or(0);
        tracing::info!(
            manifest_sqn = manifest.manifest_sqn(),
            startup_sqn,
            "penciller starting"
        );

        let (tx, rx) = mpsc::channel(64);
        let clerk_prompt = Arc::new(Notify::new());
        let server = PencillerServer {
            rng: StdRng::seed_from_u64(config.seed),
            manifest,
            cache: L0Cache::new(),
            ledger_sqn: startup_sqn,
            persisted_sqn: startup_sqn,
            l0_pending: false,
            work_ongoing: false,
            work_backlog: false,
            next_holder: 1,
            clerk_prompt: Arc::clone(&clerk_prompt),
            cmd_tx: tx.clone(),
            config: config.clone(),
        };
        let _server_task = tokio::spawn(server.run(rx));
        let _clerk_task = clerk::spawn(tx.clone(), Arc::clone(&clerk_prompt), config.clone());

        Ok(Penciller {
            tx,
            clerk_prompt,
            slow_fetch: config.slow_fetch,
        })
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.tx.send(command).await.map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Push a batch of journaled records. `Returned` means the penciller is
    /// flushing or backlogged; hold the batch and retry.
    pub async fn push_mem(&self, batch: BTreeMap<Key, Value>) -> Result<PushResult> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Push {
                batch: Arc::new(batch),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Point lookup: the highest-SQN live record for `key`, or `None`.
    pub async fn fetch(&self, key: &Key) -> Result<Option<(Key, Value)>> {
        self.fetch_with_hash(key, magic_hash(key)).await
    }

    /// Point lookup with a caller-computed hash.
    pub async fn fetch_with_hash(
        &self,
        key: &Key,
        hash: KeyHash,
    ) -> Result<Option<(Key, Value)>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Fetch {
                key: key.clone(),
                hash,
                reply,
            },
            rx,
        )
        .await?
    }

    /// True iff the live record for `key` has an SQN at or below `sqn`.
    pub async fn check_sqn(&self, key: &Key, sqn: u64) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::CheckSqn {
                key: key.clone(),
                hash: magic_hash(key),
                sqn,
                reply,
            },
            rx,
        )
        .await
    }

    /// Register a point-in-time snapshot. An optional bookie-supplied tree
    /// of not-yet-pushed records is folded into the clone.
    pub async fn register_snapshot(
        &self,
        mode: SnapshotMode,
        long_running: bool,
        bookie: Option<BTreeMap<Key, Value>>,
    ) -> Result<PencillerSnapshot> {
        let (reply, rx) = oneshot::channel();
        let seed = self
            .request(
                Command::RegisterSnapshot {
                    mode,
                    long_running,
                    bookie,
                    reply,
                },
                rx,
            )
            .await?;
        Ok(PencillerSnapshot::assemble(
            seed,
            self.slow_fetch,
            self.tx.clone(),
        ))
    }

    /// Fold the merged view of `[start, end]` through `f`. Runs against a
    /// transient range snapshot; the live penciller is never blocked.
    pub async fn fetch_keys<A, F>(
        &self,
        start: Key,
        end: Option<Key>,
        init: A,
        f: F,
    ) -> Result<A>
    where
        F: FnMut(A, Key, Value) -> A,
    {
        let snapshot = self
            .register_snapshot(
                SnapshotMode::Range {
                    start: start.clone(),
                    end: end.clone(),
                },
                false,
                None,
            )
            .await?;
        let acc = snapshot.fetch_keys(&start, end.as_ref(), -1, init, f);
        snapshot.release().await;
        Ok(acc)
    }

    /// The first record at or after `start` within the bound.
    pub async fn fetch_next_key(
        &self,
        start: Key,
        end: Option<Key>,
    ) -> Result<Option<(Key, Value)>> {
        let snapshot = self
            .register_snapshot(
                SnapshotMode::Range {
                    start: start.clone(),
                    end: end.clone(),
                },
                false,
                None,
            )
            .await?;
        let found = snapshot.fetch_next_key(&start, end.as_ref());
        snapshot.release().await;
        Ok(found)
    }

    /// Explicitly poll whether a pending-delete file may be removed.
    pub async fn confirm_delete(&self, filename: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::ConfirmDelete {
                filename: filename.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// The highest SQN known to be durably persisted in ledger files.
    pub async fn get_startup_sqn(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::GetStartupSqn { reply }, rx).await
    }

    /// A consistent snapshot of the server's coordination state.
    pub async fn status(&self) -> Result<PencillerStatus> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Status { reply }, rx).await
    }

    /// Controlled shutdown: write the cache as a final L0 file when no
    /// flush is pending, then stop the server and clerk.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let result = self.request(Command::Close { reply }, rx).await?;
        self.clerk_prompt.notify_waiters();
        result
    }

    /// Close and return the ledger paths for teardown.
    pub async fn doom(&self) -> Result<Vec<PathBuf>> {
        let (reply, rx) = oneshot::channel();
        let result = self.request(Command::Doom { reply }, rx).await?;
        self.clerk_prompt.notify_waiters();
        result
    }
}
