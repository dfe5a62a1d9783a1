//! One maintenance run: ownership and safety gates, then the task list of the
//! requested cycle, then the schedule update.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use keel_types::blob::PACK_BLOB_PREFIXES;
use keel_types::error::{KeelError, Result};

use super::params::{self, RunInfo};
use super::safety::SafetyParameters;
use crate::index::{CompactOptions, CompactStats};
use crate::platform;
use crate::repo::session::{self, age_cutoff};
use crate::repo::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Quick,
    Full,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Full => "full",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics returned by a maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    pub index_blobs_read: usize,
    pub index_blobs_written: usize,
    pub index_blobs_deleted: usize,
    pub contents_dropped: usize,
    pub pack_blobs_deleted: usize,
    pub bytes_reclaimed: u64,
    pub blobs_retention_extended: usize,
    pub sessions_cleaned: usize,
}

impl MaintenanceStats {
    fn add_compaction(&mut self, stats: &CompactStats) {
        self.index_blobs_read += stats.index_blobs_read;
        self.index_blobs_written += stats.index_blobs_written;
        self.contents_dropped += stats.contents_dropped;
    }
}

pub struct RunOptions<'a> {
    pub mode: Mode,
    /// Run even if the caller is not the recorded owner.
    pub force: bool,
    pub safety: SafetyParameters,
    /// `user@host` of the caller; defaults to the current user.
    pub caller: Option<String>,
    /// Drop deletion entries older than this; defaults to
    /// `now - drop_deleted_min_age`. A later cutoff is only honoured with
    /// relaxed, acknowledged safety parameters.
    pub drop_deleted_before: Option<DateTime<Utc>>,
    pub cancel: Option<&'a AtomicBool>,
}

impl<'a> RunOptions<'a> {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            force: false,
            safety: SafetyParameters::full(),
            caller: None,
            drop_deleted_before: None,
            cancel: None,
        }
    }
}

fn check_cancelled(cancel: Option<&AtomicBool>) -> Result<()> {
    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
        return Err(KeelError::Cancelled);
    }
    Ok(())
}

/// Per-item failures collected across the tasks of one run.
#[derive(Debug, Default)]
struct ItemFailures {
    failed: usize,
    total: usize,
}

impl ItemFailures {
    /// Record a task's partial failure and carry on with the next task.
    /// Any other error still ends the run.
    fn absorb<T: Default>(&mut self, task: &str, result: Result<T>) -> Result<T> {
        match result {
            Err(KeelError::PartialFailure { failed, total }) => {
                warn!(task, failed, total, "maintenance task finished with failures");
                self.failed += failed;
                self.total += total;
                Ok(T::default())
            }
            other => other,
        }
    }

    fn finish(self) -> Result<()> {
        if self.failed > 0 {
            return Err(KeelError::PartialFailure {
                failed: self.failed,
                total: self.total,
            });
        }
        Ok(())
    }
}

/// The drop cutoff for a full run. Under normal safety an explicit cutoff
/// can only move earlier than `now - drop_deleted_min_age`.
fn drop_cutoff(opts: &RunOptions<'_>, now: DateTime<Utc>) -> DateTime<Utc> {
    let safety = &opts.safety;
    let floor = age_cutoff(now, safety.drop_deleted_min_age);
    match opts.drop_deleted_before {
        None => floor,
        Some(explicit) if safety.is_relaxed() && safety.unsafe_acknowledged => explicit,
        Some(explicit) if explicit > floor => {
            warn!(
                requested = %explicit,
                %floor,
                "drop cutoff limited by drop_deleted_min_age"
            );
            floor
        }
        Some(explicit) => explicit,
    }
}

/// Run one maintenance cycle and record it in the schedule.
///
/// Safety parameters and ownership are checked before anything is modified.
pub fn run(repo: &Repository, opts: &RunOptions<'_>) -> Result<MaintenanceStats> {
    opts.safety.validate()?;
    let mgr = repo.encryption_manager();
    let state = params::load_state(mgr)?;
    let caller = opts.caller.clone().unwrap_or_else(platform::user_at_host);
    if state.params.owner != caller {
        if !opts.force {
            return Err(KeelError::NotMaintenanceOwner {
                owner: state.params.owner,
                caller,
            });
        }
        warn!(owner = %state.params.owner, %caller, "running maintenance as non-owner (forced)");
    }

    let start = repo.now();
    info!(mode = %opts.mode, "starting maintenance");
    let mut stats = MaintenanceStats::default();
    let result = match opts.mode {
        Mode::Quick => run_quick(repo, opts, &mut stats),
        Mode::Full => run_full(repo, opts, &mut stats),
    };
    let end = repo.now();

    // Reload: the run itself does not touch the state, but a concurrent
    // `maintenance set` may have.
    let mut state = params::load_state(mgr)?;
    state.schedule.record_run(
        opts.mode.as_str(),
        RunInfo {
            start,
            end,
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        },
    );
    if result.is_ok() {
        let quick = chrono::Duration::from_std(state.params.quick_cycle.interval())
            .map_err(|e| KeelError::InvalidConfig(format!("quick interval: {e}")))?;
        state.schedule.next_quick_run = Some(end + quick);
        if opts.mode == Mode::Full {
            let full = chrono::Duration::from_std(state.params.full_cycle.interval())
                .map_err(|e| KeelError::InvalidConfig(format!("full interval: {e}")))?;
            state.schedule.next_full_run = Some(end + full);
        }
    }
    params::save_state(mgr, &state)?;

    match result {
        Ok(()) => {
            info!(mode = %opts.mode, ?stats, "maintenance finished");
            Ok(stats)
        }
        Err(e) => {
            warn!(mode = %opts.mode, "maintenance failed: {e}");
            Err(e)
        }
    }
}

fn run_quick(repo: &Repository, opts: &RunOptions<'_>, stats: &mut MaintenanceStats) -> Result<()> {
    check_cancelled(opts.cancel)?;
    let compact = CompactOptions {
        max_small_blobs: repo.parameters().max_small_index_blobs,
        all_indexes: false,
        drop_deleted_before: None,
    };
    let result = repo
        .indexes()
        .compact(&compact, repo.parameters().max_pack_size, None)?;
    stats.add_compaction(&result);
    Ok(())
}

/// Every task runs even when an earlier one had per-item failures; those
/// are reported together at the end.
fn run_full(repo: &Repository, opts: &RunOptions<'_>, stats: &mut MaintenanceStats) -> Result<()> {
    let safety = &opts.safety;
    let now = repo.now();
    let mut failures = ItemFailures::default();

    check_cancelled(opts.cancel)?;
    let compacted = drop_deleted_contents(repo, drop_cutoff(opts, now))?;
    stats.add_compaction(&compacted);

    check_cancelled(opts.cancel)?;
    let (count, bytes) =
        failures.absorb("delete-packs", delete_unreferenced_packs(repo, safety, now))?;
    stats.pack_blobs_deleted = count;
    stats.bytes_reclaimed = bytes;

    check_cancelled(opts.cancel)?;
    stats.blobs_retention_extended =
        failures.absorb("extend-retention", extend_blob_retention(repo))?;

    check_cancelled(opts.cancel)?;
    stats.sessions_cleaned = failures.absorb(
        "cleanup-sessions",
        session::delete_stale_sessions(repo.encryption_manager(), now, safety.session_expiration_age),
    )?;

    check_cancelled(opts.cancel)?;
    stats.index_blobs_deleted = failures.absorb(
        "cleanup-indexes",
        repo.indexes().cleanup_superseded(
            now,
            safety.eventual_consistency_settle_time,
            safety.disable_eventual_consistency_safety,
        ),
    )?;
    failures.finish()
}

/// Compact all index blobs, dropping deletion entries older than `cutoff`.
/// Entries deleted at or after the cutoff are kept.
pub fn drop_deleted_contents(repo: &Repository, cutoff: DateTime<Utc>) -> Result<CompactStats> {
    let compact = CompactOptions {
        max_small_blobs: 1,
        all_indexes: true,
        drop_deleted_before: Some(cutoff),
    };
    repo.indexes()
        .compact(&compact, repo.parameters().max_pack_size, None)
}

/// Delete pack blobs no index entry refers to. Packs of sessions that are
/// still active and packs younger than `blob_delete_min_age` are kept, since
/// their index blob may not be written yet. Packs under retention are
/// skipped; other failed deletes are counted and reported at the end.
fn delete_unreferenced_packs(
    repo: &Repository,
    safety: &SafetyParameters,
    now: DateTime<Utc>,
) -> Result<(usize, u64)> {
    let index = repo.indexes().load_index()?;
    let referenced: HashSet<&str> = index.iter().map(|i| i.pack_blob_id.as_str()).collect();
    let active = session::list_active_sessions(
        repo.encryption_manager(),
        now,
        safety.session_expiration_age,
    )?;
    let min_age_cutoff = age_cutoff(now, safety.blob_delete_min_age);

    let storage = repo.storage();
    let mut deleted = 0;
    let mut bytes = 0;
    let mut attempted = 0;
    let mut failed = 0;
    for prefix in PACK_BLOB_PREFIXES {
        for meta in storage.list(prefix)? {
            let id = meta.blob_id.as_str();
            if referenced.contains(id) {
                continue;
            }
            let owner = session::session_id_from_blob_id(id);
            if !owner.is_empty() && active.keys().any(|s| s.as_str() == owner) {
                debug!(blob = id, session = owner, "keeping pack of active session");
                continue;
            }
            if meta.timestamp > min_age_cutoff {
                debug!(blob = id, "keeping recent unreferenced pack");
                continue;
            }
            attempted += 1;
            match storage.delete(id) {
                Ok(()) => {
                    deleted += 1;
                    bytes += meta.length;
                }
                Err(KeelError::Unsupported(msg)) => {
                    warn!(blob = id, "cannot delete pack under retention: {msg}");
                }
                Err(e) => {
                    warn!(blob = id, "failed to delete unreferenced pack: {e}");
                    failed += 1;
                }
            }
        }
    }
    if deleted > 0 {
        info!(deleted, bytes, "deleted unreferenced pack blobs");
    }
    if failed > 0 {
        return Err(KeelError::PartialFailure {
            failed,
            total: attempted,
        });
    }
    Ok((deleted, bytes))
}

/// Re-apply the configured retention to every pack blob. A pack deleted
/// since the listing is skipped; other failures are counted and reported
/// once every pack has been tried.
fn extend_blob_retention(repo: &Repository) -> Result<usize> {
    let config = repo.blob_storage_config()?;
    if !config.is_retention_enabled() {
        return Ok(0);
    }
    let opts = config.put_options();
    let storage = repo.storage();
    let mut extended = 0;
    let mut attempted = 0;
    let mut failed = 0;
    for prefix in PACK_BLOB_PREFIXES {
        for meta in storage.list(prefix)? {
            let id = meta.blob_id.as_str();
            attempted += 1;
            match storage.extend_retention(id, &opts) {
                Ok(()) => extended += 1,
                Err(e) if e.is_not_found() => debug!(blob = id, "pack vanished before retention update"),
                Err(e) => {
                    warn!(blob = id, "failed to extend retention: {e}");
                    failed += 1;
                }
            }
        }
    }
    debug!(extended, "extended blob retention");
    if failed > 0 {
        return Err(KeelError::PartialFailure {
            failed,
            total: attempted,
        });
    }
    Ok(extended)
}
