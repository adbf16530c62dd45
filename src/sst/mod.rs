//! Sorted-string-table files.
//!
//! The penciller core treats SST files through a narrow interface: write a
//! sorted batch, reopen it later, probe a key behind a hash gate, and walk a
//! range through lazy pointers. The format here is deliberately small — one
//! checksummed body per file, loaded whole on open:
//!
//! ```text
//! +-----------+----------------------------------+
//! | crc32:u32 | bincode body                     |
//! +-----------+----------------------------------+
//! | 4 bytes   | sorted records + max_sqn         |
//! +-----------+----------------------------------+
//! ```
//!
//! Within a file a key appears at most once. Point probes consult a small
//! hash-membership filter before the binary search so that misses stay cheap.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::codec::{endkey_passed, magic_hash, Key, KeyHash, Value};
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bits in the per-file hash membership filter.
const FILTER_BITS: usize = 4096;

/// Records expanded from a pointer per resolution step.
pub const ITERATOR_SCANWIDTH: usize = 4;

/// Filename of the level-zero file written at the given manifest generation.
pub fn l0_filename(manifest_sqn: u64) -> String {
    format!("{manifest_sqn}_0_0.sst")
}

/// Filename of the `n`th merge output at `level` for the given generation.
pub fn merge_filename(manifest_sqn: u64, level: usize, n: usize) -> String {
    format!("{manifest_sqn}_{level}_{n}.sst")
}

#[derive(Serialize, Deserialize)]
struct SstBody {
    records: Vec<(Key, Value)>,
    max_sqn: u64,
}

/// An immutable, open SST file.
pub struct SstFile {
    filename: String,
    records: Vec<(Key, Value)>,
    max_sqn: u64,
    filter: Vec<u64>,
}

impl SstFile {
    /// Write a new SST from sorted records and open it. Returns the handle
    /// with the file's key range.
    pub fn create(
        dir: &Path,
        filename: &str,
        records: Vec<(Key, Value)>,
        max_sqn: u64,
    ) -> Result<(Arc<SstFile>, Key, Key)> {
        if records.is_empty() {
            return Err(Error::InvalidData(format!(
                "refusing to write empty sst {filename}"
            )));
        }
        debug_assert!(records.windows(2).all(|w| w[0].0 < w[1].0));

        let body = bincode::serialize(&SstBody {
            records: records.clone(),
            max_sqn,
        })?;
        let mut framed = vec![0u8; 4];
        BigEndian::write_u32(&mut framed, CRC32.checksum(&body));
        framed.extend_from_slice(&body);

        let path = dir.join(filename);
        let mut file = fs::File::create(&path)?;
        file.write_all(&framed)?;
        file.sync_all()?;

        Ok(Self::from_records(filename.to_string(), records, max_sqn))
    }

    /// Open an existing SST file, verifying its checksum.
    pub fn open(dir: &Path, filename: &str) -> Result<(Arc<SstFile>, Key, Key)> {
        let bytes = fs::read(dir.join(filename))?;
        if bytes.len() < 4 {
            return Err(Error::InvalidData(format!("sst {filename} truncated")));
        }
        let (crc_bytes, body) = bytes.split_at(4);
        if BigEndian::read_u32(crc_bytes) != CRC32.checksum(body) {
            return Err(Error::InvalidData(format!(
                "sst {filename} checksum mismatch"
            )));
        }
        let body: SstBody = bincode::deserialize(body)?;
        if body.records.is_empty() {
            return Err(Error::InvalidData(format!("sst {filename} has no records")));
        }
        Ok(Self::from_records(
            filename.to_string(),
            body.records,
            body.max_sqn,
        ))
    }

    fn from_records(
        filename: String,
        records: Vec<(Key, Value)>,
        max_sqn: u64,
    ) -> (Arc<SstFile>, Key, Key) {
        let mut filter = vec![0u64; FILTER_BITS / 64];
        for (key, _) in &records {
            if let KeyHash::Lookup(hash) = magic_hash(key) {
                let bit = hash as usize % FILTER_BITS;
                filter[bit / 64] |= 1 << (bit % 64);
            }
        }
        let start_key = records.first().map(|(k, _)| k.clone()).unwrap();
        let end_key = records.last().map(|(k, _)| k.clone()).unwrap();
        let file = Arc::new(SstFile {
            filename,
            records,
            max_sqn,
            filter,
        });
        (file, start_key, end_key)
    }

    /// Highest SQN written into this file.
    pub fn max_sqn(&self) -> u64 {
        self.max_sqn
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Every record in key order; compaction merges read files whole.
    pub fn records(&self) -> &[(Key, Value)] {
        &self.records
    }

    /// Point probe behind the hash gate.
    pub fn get(&self, key: &Key, hash: u32) -> Option<(Key, Value)> {
        let bit = hash as usize % FILTER_BITS;
        if self.filter[bit / 64] & (1 << (bit % 64)) == 0 {
            return None;
        }
        self.records
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| self.records[i].clone())
    }

    /// A lazy pointer over this file's records in `[start, end]`.
    pub fn pointer(self: &Arc<Self>, start: &Key, end: Option<&Key>) -> SstPointer {
        let pos = self.records.partition_point(|(k, _)| k < start);
        SstPointer {
            file: Arc::clone(self),
            pos,
            end: end.cloned(),
        }
    }

    /// Delete the persisted file once its removal has been confirmed.
    pub fn remove(dir: &Path, filename: &str) -> Result<()> {
        fs::remove_file(dir.join(filename))?;
        Ok(())
    }
}

impl std::fmt::Debug for SstFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstFile")
            .field("filename", &self.filename)
            .field("records", &self.records.len())
            .field("max_sqn", &self.max_sqn)
            .finish()
    }
}

/// A lazy position inside one SST file's range. Resolving the pointer
/// faults in a handful of concrete records at a time.
#[derive(Clone)]
pub struct SstPointer {
    file: Arc<SstFile>,
    pos: usize,
    end: Option<Key>,
}

impl SstPointer {
    /// Expand up to `width` records, advancing the pointer.
    pub fn expand(&mut self, width: usize) -> Vec<(Key, Value)> {
        let mut out = Vec::with_capacity(width);
        while out.len() < width && self.pos < self.file.records.len() {
            let (key, value) = &self.file.records[self.pos];
            if endkey_passed(self.end.as_ref(), key) {
                self.pos = self.file.records.len();
                break;
            }
            out.push((key.clone(), value.clone()));
            self.pos += 1;
        }
        out
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.file.records.len()
            || endkey_passed(self.end.as_ref(), &self.file.records[self.pos].0)
    }
}

/// Completion report of an asynchronous level-zero build.
pub struct L0Completion {
    pub file: Arc<SstFile>,
    pub filename: String,
    pub start_key: Key,
    pub end_key: Key,
}

/// Build a level-zero SST from the frozen cache. The builder pulls one slot
/// per `fetch_slot` call — newest slot first, matching the cache order — and
/// merges them with newest-wins semantics before writing.
pub async fn write_level_zero<F>(
    dir: std::path::PathBuf,
    filename: String,
    n_slots: usize,
    fetch_slot: F,
    max_sqn: u64,
) -> Result<L0Completion>
where
    F: Fn(usize) -> Arc<BTreeMap<Key, Value>> + Send + 'static,
{
    let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
    // Oldest slot first so that newer slots overwrite on collision.
    for slot in (0..n_slots).rev() {
        let batch = fetch_slot(slot);
        for (key, value) in batch.iter() {
            merged.insert(key.clone(), value.clone());
        }
        tokio::task::yield_now().await;
    }

    let records: Vec<(Key, Value)> = merged.into_iter().collect();
    let (file, start_key, end_key) = SstFile::create(&dir, &filename, records, max_sqn)?;
    Ok(L0Completion {
        file,
        filename,
        start_key,
        end_key,
    })
}
