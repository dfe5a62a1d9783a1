//! Index blobs, compaction and compaction logs.
//!
//! Index blobs (`n…`) are immutable. Compaction merges several of them into
//! one new blob and records the replacement in a compaction log (`m…`).
//! Readers ignore inputs of any completed log, so a half-finished compaction
//! is harmless. A log is completed when each of its outputs exists or has
//! itself been merged by another completed log. The superseded inputs are
//! deleted later, once the log has been visible for the settle time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_types::blob::{BlobMetadata, COMPACTION_LOG_PREFIX, INDEX_BLOB_PREFIX};
use keel_types::error::{KeelError, Result};

use super::IndexBuilder;
use crate::repo::encrypted_blob::EncryptionManager;
use crate::repo::session::SessionId;

/// A blob shorter than `max_pack_size / VERY_SMALL_FRACTION` counts as very
/// small for quick compaction.
const VERY_SMALL_FRACTION: u64 = 20;

const LOAD_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionLog {
    pub inputs: Vec<BlobMetadata>,
    pub outputs: Vec<BlobMetadata>,
}

#[derive(Debug, Clone, Default)]
pub struct CompactOptions {
    /// Do nothing while fewer than this many candidate blobs exist.
    pub max_small_blobs: usize,
    /// Also consider blobs larger than the maximum pack size.
    pub all_indexes: bool,
    /// Drop deletion entries older than this.
    pub drop_deleted_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactStats {
    pub index_blobs_read: usize,
    pub index_blobs_written: usize,
    pub contents_dropped: usize,
}

pub struct IndexBlobManager {
    mgr: Arc<EncryptionManager>,
}

impl IndexBlobManager {
    pub fn new(mgr: Arc<EncryptionManager>) -> Self {
        Self { mgr }
    }

    pub fn write_index_blob(
        &self,
        builder: &IndexBuilder,
        session: Option<&SessionId>,
    ) -> Result<BlobMetadata> {
        let payload = builder.encode()?;
        let meta = self
            .mgr
            .encrypt_and_write_blob(&payload, INDEX_BLOB_PREFIX, session)?;
        debug!(blob = %meta.blob_id, entries = builder.len(), "wrote index blob");
        Ok(meta)
    }

    pub fn read_index_blob(&self, id: &str) -> Result<IndexBuilder> {
        let payload = self.mgr.get_encrypted_blob(id)?;
        IndexBuilder::decode(&payload)
    }

    fn read_logs(&self) -> Result<Vec<(BlobMetadata, CompactionLog)>> {
        let mut logs = Vec::new();
        for meta in self.mgr.storage().list(COMPACTION_LOG_PREFIX)? {
            match self.mgr.get_encrypted_blob(meta.blob_id.as_str()) {
                Ok(payload) => logs.push((meta, serde_json::from_slice(&payload)?)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(logs)
    }

    /// All compaction logs with their store metadata.
    pub fn compaction_logs(&self) -> Result<Vec<(BlobMetadata, CompactionLog)>> {
        self.read_logs()
    }

    /// Index blobs not superseded by a completed compaction.
    pub fn list_active_index_blobs(&self) -> Result<Vec<BlobMetadata>> {
        let blobs = self.mgr.storage().list(INDEX_BLOB_PREFIX)?;
        let logs = self.read_logs()?;
        let superseded = superseded_inputs(&blobs, &logs);
        Ok(blobs
            .into_iter()
            .filter(|b| !superseded.contains(b.blob_id.as_str()))
            .collect())
    }

    /// Merge all active index blobs. A blob removed between listing and
    /// reading means a concurrent compaction finished; the listing is retried.
    pub fn load_index(&self) -> Result<IndexBuilder> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_load_index() {
                Err(e) if e.is_not_found() && attempt < LOAD_ATTEMPTS => {
                    debug!(attempt, "index blob vanished during load, retrying: {e}");
                }
                other => return other,
            }
        }
    }

    fn try_load_index(&self) -> Result<IndexBuilder> {
        let mut merged = IndexBuilder::new();
        for meta in self.list_active_index_blobs()? {
            merged.merge(self.read_index_blob(meta.blob_id.as_str())?);
        }
        Ok(merged)
    }

    /// Merge a selection of active index blobs into one and log the
    /// replacement. A single candidate with nothing to drop is left alone.
    pub fn compact(
        &self,
        opts: &CompactOptions,
        max_pack_size: u64,
        session: Option<&SessionId>,
    ) -> Result<CompactStats> {
        let active = self.list_active_index_blobs()?;
        let to_compact = blobs_to_compact(&active, max_pack_size, opts);
        let mut stats = CompactStats::default();
        if to_compact.len() <= 1 && opts.drop_deleted_before.is_none() {
            debug!(candidates = to_compact.len(), "index compaction not needed");
            return Ok(stats);
        }

        let mut merged = IndexBuilder::new();
        for meta in &to_compact {
            merged.merge(self.read_index_blob(meta.blob_id.as_str())?);
        }
        stats.index_blobs_read = to_compact.len();
        if let Some(cutoff) = opts.drop_deleted_before {
            stats.contents_dropped = merged.drop_deleted_before(cutoff.timestamp());
        }
        if to_compact.len() <= 1 && stats.contents_dropped == 0 {
            debug!("single index blob with nothing to drop, skipping rewrite");
            return Ok(stats);
        }

        let mut outputs = Vec::new();
        if !merged.is_empty() {
            outputs.push(self.write_index_blob(&merged, session)?);
        }
        stats.index_blobs_written = outputs.len();

        let log = CompactionLog {
            inputs: to_compact,
            outputs,
        };
        let meta = self.mgr.encrypt_and_write_blob(
            &serde_json::to_vec(&log)?,
            COMPACTION_LOG_PREFIX,
            session,
        )?;
        info!(
            log = %meta.blob_id,
            inputs = log.inputs.len(),
            outputs = log.outputs.len(),
            dropped = stats.contents_dropped,
            "compacted index blobs"
        );
        Ok(stats)
    }

    /// Delete index blobs superseded by completed compactions whose log is
    /// older than `settle_time` (any age when `immediate`), then the logs
    /// themselves. Returns the number of index blobs deleted.
    ///
    /// Logs are handled oldest first. A log is kept, together with its
    /// inputs, while any input is an output of an older log that is still
    /// kept, so no earlier compaction loses the blob it depends on. Failed
    /// deletes are logged and counted; the pass continues and fails at the
    /// end with `PartialFailure`, leaving the affected logs for the next run.
    pub fn cleanup_superseded(
        &self,
        now: DateTime<Utc>,
        settle_time: Duration,
        immediate: bool,
    ) -> Result<usize> {
        let storage = self.mgr.storage();
        let blobs = storage.list(INDEX_BLOB_PREFIX)?;
        let existing: HashSet<&str> = blobs.iter().map(|b| b.blob_id.as_str()).collect();
        let settle = chrono::Duration::from_std(settle_time).unwrap_or(chrono::Duration::MAX);

        let mut logs = self.read_logs()?;
        logs.sort_by(|(a, _), (b, _)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.blob_id.as_str().cmp(b.blob_id.as_str()))
        });
        let completed = completed_logs(&existing, &logs);

        // Outputs of completed logs that stay in place after this pass.
        let mut pinned: HashSet<&str> = HashSet::new();
        let mut deleted = 0;
        let mut attempted = 0;
        let mut failed = 0;
        for ((log_meta, log), &done) in logs.iter().zip(&completed) {
            if !done {
                continue;
            }
            let log_id = log_meta.blob_id.as_str();
            let outputs: HashSet<&str> = log.outputs.iter().map(|o| o.blob_id.as_str()).collect();
            if !immediate && now - log_meta.timestamp < settle {
                debug!(log = log_id, "compaction log not settled yet");
                pinned.extend(&outputs);
                continue;
            }
            if log.inputs.iter().any(|i| pinned.contains(i.blob_id.as_str())) {
                debug!(log = log_id, "inputs still named by an older compaction log");
                pinned.extend(&outputs);
                continue;
            }

            let mut clean = true;
            let mut removed = Vec::new();
            for input in &log.inputs {
                let id = input.blob_id.as_str();
                if outputs.contains(id) || !existing.contains(id) {
                    continue;
                }
                attempted += 1;
                match storage.delete(id) {
                    Ok(()) => {
                        deleted += 1;
                        removed.push(id);
                    }
                    Err(e) => {
                        warn!(log = log_id, blob = id, "failed to delete superseded index blob: {e}");
                        failed += 1;
                        clean = false;
                    }
                }
            }
            self.mgr.invalidate(&removed);
            if !clean {
                pinned.extend(&outputs);
                continue;
            }

            attempted += 1;
            match storage.delete(log_id) {
                Ok(()) => {
                    self.mgr.invalidate(&[log_id]);
                    debug!(log = log_id, "removed superseded index blobs");
                }
                Err(e) => {
                    warn!(log = log_id, "failed to delete compaction log: {e}");
                    failed += 1;
                    pinned.extend(&outputs);
                }
            }
        }

        if failed > 0 {
            return Err(KeelError::PartialFailure {
                failed,
                total: attempted,
            });
        }
        Ok(deleted)
    }
}

/// For each log, whether it is completed: every output exists or is an
/// input of another completed log, whose own outputs then carry its entries.
fn completed_logs(existing: &HashSet<&str>, logs: &[(BlobMetadata, CompactionLog)]) -> Vec<bool> {
    let mut done: Vec<bool> = logs
        .iter()
        .map(|(_, log)| log.outputs.iter().all(|o| existing.contains(o.blob_id.as_str())))
        .collect();
    loop {
        let merged: HashSet<&str> = logs
            .iter()
            .zip(&done)
            .filter(|(_, d)| **d)
            .flat_map(|((_, log), _)| log.inputs.iter().map(|i| i.blob_id.as_str()))
            .collect();
        let mut changed = false;
        for ((_, log), d) in logs.iter().zip(done.iter_mut()) {
            if *d {
                continue;
            }
            if log.outputs.iter().all(|o| {
                let id = o.blob_id.as_str();
                existing.contains(id) || merged.contains(id)
            }) {
                *d = true;
                changed = true;
            }
        }
        if !changed {
            return done;
        }
    }
}

fn superseded_inputs<'a>(
    blobs: &[BlobMetadata],
    logs: &'a [(BlobMetadata, CompactionLog)],
) -> HashSet<&'a str> {
    let existing: HashSet<&str> = blobs.iter().map(|b| b.blob_id.as_str()).collect();
    let completed = completed_logs(&existing, logs);
    let mut superseded = HashSet::new();
    for ((_, log), done) in logs.iter().zip(completed) {
        if !done {
            continue;
        }
        let outputs: HashSet<&str> = log.outputs.iter().map(|o| o.blob_id.as_str()).collect();
        for input in &log.inputs {
            if !outputs.contains(input.blob_id.as_str()) {
                superseded.insert(input.blob_id.as_str());
            }
        }
    }
    superseded
}

/// Choose which index blobs to merge.
///
/// Blobs larger than `max_pack_size` are skipped unless `all_indexes`. If
/// fewer than `max_small_blobs` candidates remain, nothing is compacted. When
/// very small blobs dominate and few medium blobs exist, only the very small
/// ones are merged; otherwise all candidates are.
pub fn blobs_to_compact(
    blobs: &[BlobMetadata],
    max_pack_size: u64,
    opts: &CompactOptions,
) -> Vec<BlobMetadata> {
    let mut candidates = Vec::new();
    let mut very_small = Vec::new();
    let mut medium_count = 0usize;

    for b in blobs {
        if b.length > max_pack_size && !opts.all_indexes {
            continue;
        }
        candidates.push(b.clone());
        if b.length < max_pack_size / VERY_SMALL_FRACTION {
            very_small.push(b.clone());
        } else {
            medium_count += 1;
        }
    }

    if candidates.len() < opts.max_small_blobs {
        return Vec::new();
    }
    if very_small.len() > candidates.len() / 2 && medium_count + 1 < opts.max_small_blobs {
        return very_small;
    }
    candidates
}
