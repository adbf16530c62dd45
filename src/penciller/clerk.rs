//! The compaction clerk: the single background worker attached to each
//! penciller.
//!
//! The clerk loops asking the server for work. When a level is over its
//! threshold it receives that level together with a blanked manifest copy,
//! merges one victim file into the level below, persists the resulting
//! manifest as a pending generation, and posts the change back. The server
//! owns the commit; a clerk crash leaves the previous manifest intact.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::codec::{Key, Value};
use crate::config::PencillerConfig;
use crate::error::{Error, Result};
use crate::penciller::manifest::{Manifest, ManifestEntry, MAX_LEVELS};
use crate::penciller::server::Command;
use crate::sst::{self, SstFile};

pub(crate) fn spawn(
    tx: mpsc::Sender<Command>,
    prompt: Arc<Notify>,
    config: PencillerConfig,
) -> JoinHandle<()> {
    // A distinct but reproducible stream from the server's RNG.
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    tokio::spawn(async move {
        loop {
            let (reply, reply_rx) = oneshot::channel();
            if tx.send(Command::WorkForClerk { reply }).await.is_err() {
                break;
            }
            let work = match reply_rx.await {
                Ok(work) => work,
                Err(_) => break,
            };
            match work {
                None => {
                    tokio::select! {
                        _ = prompt.notified() => {}
                        _ = tokio::time::sleep(config.max_work_wait) => {}
                    }
                }
                Some((level, manifest)) => {
                    let result = merge_level(&config, level, manifest, &mut rng);
                    if let Err(e) = &result {
                        tracing::error!(level, error = %e, "compaction merge failed");
                    }
                    if tx.send(Command::ManifestChange { result }).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("compaction clerk stopped");
    })
}

/// Merge one victim file at `src_level` into `src_level + 1`, producing the
/// next manifest generation persisted as a pending file.
pub(crate) fn merge_level(
    config: &PencillerConfig,
    src_level: usize,
    mut manifest: Manifest,
    rng: &mut StdRng,
) -> Result<Manifest> {
    if src_level + 1 >= MAX_LEVELS {
        return Err(Error::InvalidData(format!(
            "level {src_level} has no level below it"
        )));
    }
    let new_sqn = manifest.manifest_sqn() + 1;
    let victim = manifest
        .mergefile_selector(src_level, rng)
        .ok_or_else(|| Error::InvalidData(format!("no mergeable file at level {src_level}")))?;
    let overlaps = manifest.range_lookup(
        src_level + 1,
        &victim.start_key,
        Some(&victim.end_key),
    );

    if overlaps.is_empty() {
        // Nothing to merge with; the file itself moves down a level.
        manifest.switch(src_level, &victim.start_key, new_sqn)?;
        tracing::info!(
            file = %victim.filename,
            from = src_level,
            to = src_level + 1,
            "switched file down a level"
        );
    } else {
        let merged = merge_records(&victim, &overlaps);
        let merged_len = merged.len();

        manifest.remove(src_level, &victim.start_key, 1, new_sqn)?;
        manifest.remove(
            src_level + 1,
            &overlaps[0].start_key,
            overlaps.len(),
            new_sqn,
        )?;

        let files_dir = config.files_dir();
        let mut outputs = 0;
        for (n, chunk) in merged.chunks(config.max_sst_slots).enumerate() {
            let filename = sst::merge_filename(new_sqn, src_level + 1, n);
            let max_sqn = chunk.iter().map(|(_, v)| v.sqn()).max().unwrap_or(0);
            let (file, start_key, end_key) =
                SstFile::create(&files_dir, &filename, chunk.to_vec(), max_sqn)?;
            manifest.insert(
                src_level + 1,
                ManifestEntry::new(file, filename, start_key, end_key),
                new_sqn,
            )?;
            outputs += 1;
        }
        tracing::info!(
            from = src_level,
            to = src_level + 1,
            sources = overlaps.len() + 1,
            outputs,
            records = merged_len,
            "merged files down a level"
        );
    }

    manifest.save_pending(&config.manifest_dir())?;
    Ok(manifest)
}

/// Merge the victim with the overlapping deeper files, keeping the highest
/// SQN per key.
fn merge_records(victim: &ManifestEntry, overlaps: &[ManifestEntry]) -> Vec<(Key, Value)> {
    let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
    let sources = overlaps.iter().chain(std::iter::once(victim));
    for entry in sources {
        for (key, value) in entry.owner.records() {
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
