use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on cached keys; past this a flush fires regardless of the
/// coin toss.
pub const SUPER_MAX_CACHE_SIZE: usize = 40_000;

/// Configuration for a penciller.
#[derive(Debug, Clone)]
pub struct PencillerConfig {
    /// Root directory; the ledger lives under `<root>/ledger/`.
    pub root: PathBuf,

    /// Cached keys before an L0 flush becomes eligible (default: 10_000)
    pub max_cache_size: usize,

    /// When set, only 1 in 5 eligible pushes actually triggers a flush, to
    /// de-synchronize sibling nodes in a cluster (default: true)
    pub coin_toss_flush: bool,

    /// Compaction excess beyond which pushes are gated (default: 4)
    pub backlog_tolerance: usize,

    /// Hold the clerk idle: no compaction work is dispatched while set
    /// (default: false)
    pub pause_compaction: bool,

    /// Longest the clerk sleeps between asking for work (default: 300s)
    pub max_work_wait: Duration,

    /// Snapshot deadline for default registrations (default: 600s)
    pub snapshot_timeout: Duration,

    /// Snapshot deadline for long-running registrations (default: 3600s)
    pub snapshot_timeout_long: Duration,

    /// SST probe latency above which a fetch is logged (default: 20ms)
    pub slow_fetch: Duration,

    /// Records per SST file written by compaction (default: 4096)
    pub max_sst_slots: usize,

    /// Start empty when every persisted manifest fails its checksum,
    /// relying on journal replay, instead of refusing to open (default: true)
    pub tolerate_manifest_loss: bool,

    /// Seed for the per-penciller RNG (victim selection, coin toss)
    pub seed: u64,
}

impl Default for PencillerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./penciller"),
            max_cache_size: 10_000,
            coin_toss_flush: true,
            backlog_tolerance: 4,
            pause_compaction: false,
            max_work_wait: Duration::from_secs(300),
            snapshot_timeout: Duration::from_secs(600),
            snapshot_timeout_long: Duration::from_secs(3600),
            slow_fetch: Duration::from_millis(20),
            max_sst_slots: 4096,
            tolerate_manifest_loss: true,
            seed: 0,
        }
    }
}

impl PencillerConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Set the cache size that makes an L0 flush eligible.
    pub fn max_cache_size(mut self, keys: usize) -> Self {
        self.max_cache_size = keys;
        self
    }

    /// Enable or disable the 1-in-5 flush coin toss.
    pub fn coin_toss_flush(mut self, enabled: bool) -> Self {
        self.coin_toss_flush = enabled;
        self
    }

    /// Set the compaction backlog tolerance.
    pub fn backlog_tolerance(mut self, excess: usize) -> Self {
        self.backlog_tolerance = excess;
        self
    }

    /// Pause or resume compaction work dispatch.
    pub fn pause_compaction(mut self, paused: bool) -> Self {
        self.pause_compaction = paused;
        self
    }

    /// Set the clerk's idle wait.
    pub fn max_work_wait(mut self, wait: Duration) -> Self {
        self.max_work_wait = wait;
        self
    }

    /// Set the default snapshot timeout.
    pub fn snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    /// Set the records-per-file cap for compaction output.
    pub fn max_sst_slots(mut self, slots: usize) -> Self {
        self.max_sst_slots = slots;
        self
    }

    /// Refuse to open when no persisted manifest passes its checksum.
    pub fn tolerate_manifest_loss(mut self, tolerate: bool) -> Self {
        self.tolerate_manifest_loss = tolerate;
        self
    }

    /// Seed the per-penciller RNG for reproducible victim selection.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Directory holding committed and pending manifests.
    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("ledger").join("ledger_manifest")
    }

    /// Directory holding SST files.
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("ledger").join("ledger_files")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PencillerConfig::default();
        assert_eq!(config.max_cache_size, 10_000);
        assert!(config.coin_toss_flush);
        assert_eq!(config.backlog_tolerance, 4);
        assert_eq!(config.max_work_wait, Duration::from_secs(300));
        assert!(config.tolerate_manifest_loss);
    }

    #[test]
    fn test_config_builder() {
        let config = PencillerConfig::new("/tmp/test")
            .max_cache_size(64)
            .coin_toss_flush(false)
            .pause_compaction(true)
            .max_work_wait(Duration::from_millis(50))
            .seed(42);

        assert_eq!(config.root, PathBuf::from("/tmp/test"));
        assert_eq!(config.max_cache_size, 64);
        assert!(!config.coin_toss_flush);
        assert!(config.pause_compaction);
        assert_eq!(config.max_work_wait, Duration::from_millis(50));
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_ledger_paths() {
        let config = PencillerConfig::new("/data/db");
        assert_eq!(
            config.manifest_dir(),
            PathBuf::from("/data/db/ledger/ledger_manifest")
        );
        assert_eq!(
            config.files_dir(),
            PathBuf::from("/data/db/ledger/ledger_files")
        );
    }
}
