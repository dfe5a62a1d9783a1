//! Write-session identifiers and session marker blobs.
//!
//! Each writer announces itself with a marker blob `s<hash>-<session>` whose
//! store timestamp doubles as a clock-skew check. Pack and index blobs created
//! by the session carry the same `-<session>` suffix, which lets maintenance
//! spare blobs belonging to sessions that may still be running.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_types::blob::{BlobMetadata, SESSION_BLOB_PREFIX};
use keel_types::error::{KeelError, Result};

use super::encrypted_blob::EncryptionManager;

/// Environment switch for the clock-skew check.
pub const CLOCK_SKEW_CHECK_ENV: &str = "KEEL_ENABLE_CLOCK_SKEW_CHECK";

/// Largest tolerated difference between local time and store timestamps.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

static SESSION_SEQUENCE: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// `s` + 16 hex digits of unix seconds + 8 hex digits of a process-wide
/// sequence + 16 random hex digits. Unique within the process even when the
/// clock does not move.
pub fn generate_session_id(now: DateTime<Utc>) -> SessionId {
    let seq = SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let random: u64 = rand::thread_rng().gen();
    SessionId(format!(
        "{SESSION_BLOB_PREFIX}{:016x}{seq:08x}{random:016x}",
        now.timestamp().max(0) as u64
    ))
}

/// Session suffix of a blob ID: the first `-`-separated part after the first
/// that starts with `s`. Empty when there is none.
pub fn session_id_from_blob_id(blob_id: &str) -> &str {
    blob_id
        .split('-')
        .skip(1)
        .find(|part| part.starts_with(SESSION_BLOB_PREFIX))
        .unwrap_or("")
}

/// Payload of a session marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub checkpoint_time: DateTime<Utc>,
    pub user: String,
    pub host: String,
}

impl SessionInfo {
    pub fn new(id: SessionId, now: DateTime<Utc>, user: &str, host: &str) -> Self {
        Self {
            id,
            start_time: now,
            checkpoint_time: now,
            user: user.to_string(),
            host: host.to_string(),
        }
    }
}

/// Fail if `local` and `repository` differ by more than [`MAX_CLOCK_SKEW`].
/// A difference of exactly the bound is accepted.
pub fn check_clock_skew_bounds(local: DateTime<Utc>, repository: DateTime<Utc>) -> Result<()> {
    let skew = (local - repository).abs();
    let max = chrono::Duration::from_std(MAX_CLOCK_SKEW)
        .map_err(|e| KeelError::Other(format!("clock skew bound: {e}")))?;
    if skew > max {
        return Err(KeelError::ClockSkew {
            local,
            repository,
            max_secs: max.num_seconds(),
        });
    }
    Ok(())
}

/// Whether the skew check is on: `$KEEL_ENABLE_CLOCK_SKEW_CHECK` when set to
/// a boolean, else the configured default.
pub fn clock_skew_check_enabled(config_default: bool) -> bool {
    match std::env::var(CLOCK_SKEW_CHECK_ENV) {
        Ok(raw) => parse_bool(&raw).unwrap_or(config_default),
        Err(_) => config_default,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Write (or refresh) the marker for `info`. With `check_skew`, `now` is
/// compared against the timestamp the store reports for the new blob.
pub fn write_session_marker(
    mgr: &EncryptionManager,
    info: &SessionInfo,
    check_skew: bool,
    now: DateTime<Utc>,
) -> Result<BlobMetadata> {
    let payload = serde_json::to_vec(info)?;
    let meta = mgr.encrypt_and_write_blob(&payload, SESSION_BLOB_PREFIX, Some(&info.id))?;
    debug!(session = %info.id, blob = %meta.blob_id, "wrote session marker");
    if check_skew {
        check_clock_skew_bounds(now, meta.timestamp)?;
    }
    Ok(meta)
}

/// All sessions with at least one marker, keyed by ID, using the most recent
/// checkpoint seen for each.
pub fn list_sessions(mgr: &EncryptionManager) -> Result<HashMap<SessionId, (SessionInfo, Vec<BlobMetadata>)>> {
    let mut sessions: HashMap<SessionId, (SessionInfo, Vec<BlobMetadata>)> = HashMap::new();
    for bm in mgr.storage().list(SESSION_BLOB_PREFIX)? {
        let payload = match mgr.get_encrypted_blob(bm.blob_id.as_str()) {
            Ok(p) => p,
            // Removed by a concurrent cleanup between list and read.
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        let info: SessionInfo = serde_json::from_slice(&payload)?;
        match sessions.get_mut(&info.id) {
            Some((existing, blobs)) => {
                if info.checkpoint_time > existing.checkpoint_time {
                    *existing = info;
                }
                blobs.push(bm);
            }
            None => {
                sessions.insert(info.id.clone(), (info, vec![bm]));
            }
        }
    }
    Ok(sessions)
}

/// `now - age`, saturating at the earliest representable time.
pub fn age_cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Sessions whose latest checkpoint is newer than `now - max_age`.
pub fn list_active_sessions(
    mgr: &EncryptionManager,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<HashMap<SessionId, SessionInfo>> {
    let cutoff = age_cutoff(now, max_age);
    Ok(list_sessions(mgr)?
        .into_iter()
        .filter(|(_, (info, _))| info.checkpoint_time > cutoff)
        .map(|(id, (info, _))| (id, info))
        .collect())
}

/// Delete markers of sessions whose latest checkpoint is older than
/// `now - max_age`. Returns the number of sessions removed.
///
/// A marker that cannot be deleted is logged and skipped; the remaining
/// sessions are still cleaned and the call then fails with `PartialFailure`.
pub fn delete_stale_sessions(
    mgr: &EncryptionManager,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<usize> {
    let cutoff = age_cutoff(now, max_age);
    let mut removed = 0;
    let mut attempted = 0;
    let mut failed = 0;
    for (id, (info, blobs)) in list_sessions(mgr)? {
        if info.checkpoint_time > cutoff {
            continue;
        }
        let mut complete = true;
        for bm in &blobs {
            attempted += 1;
            if let Err(e) = mgr.storage().delete(bm.blob_id.as_str()) {
                warn!(session = %id, blob = %bm.blob_id, "failed to delete session marker: {e}");
                failed += 1;
                complete = false;
            }
        }
        mgr.invalidate(&blobs.iter().map(|b| b.blob_id.as_str()).collect::<Vec<_>>());
        if complete {
            info!(session = %id, last_checkpoint = %info.checkpoint_time, "removed stale session");
            removed += 1;
        }
    }
    if failed > 0 {
        return Err(KeelError::PartialFailure {
            failed,
            total: attempted,
        });
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use keel_storage::memory::Clock;
    use keel_storage::MemoryBackend;

    use crate::testutil::{test_crypter, FaultyBackend};

    fn manager_with_store_clock(clock: Clock) -> EncryptionManager {
        EncryptionManager::new(Arc::new(MemoryBackend::with_clock(clock)), test_crypter(), 16)
    }

    #[test]
    fn session_ids_are_unique_for_same_instant() {
        let now = Utc::now();
        let ids: HashSet<SessionId> = (0..1000).map(|_| generate_session_id(now)).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert!(id.as_str().starts_with('s'));
            assert_eq!(id.as_str().len(), 1 + 16 + 8 + 16);
        }
    }

    #[test]
    fn session_from_blob_id() {
        let cases = [
            ("pdeadbeef", ""),
            ("pdeadbeef-", ""),
            ("pdeadbeef-whatever", ""),
            ("pdeadbeef-s01", "s01"),
            ("sdeadbeef-s01", "s01"),
            ("ndeadbeef-x-s02", "s02"),
        ];
        for (blob_id, want) in cases {
            assert_eq!(session_id_from_blob_id(blob_id), want, "{blob_id}");
        }
    }

    #[test]
    fn skew_bound_is_inclusive() {
        let repo = Utc::now();
        let bound = chrono::Duration::from_std(MAX_CLOCK_SKEW).unwrap();
        assert!(check_clock_skew_bounds(repo + bound, repo).is_ok());
        assert!(check_clock_skew_bounds(repo - bound, repo).is_ok());

        let over = bound + chrono::Duration::nanoseconds(1);
        let err = check_clock_skew_bounds(repo + over, repo).unwrap_err();
        assert!(err.to_string().contains("clock skew detected"));
        assert!(check_clock_skew_bounds(repo - over, repo).is_err());
    }

    #[test]
    fn marker_write_with_skewed_store() {
        let local = Utc::now();
        let store_time = local + chrono::Duration::minutes(10);
        let mgr = manager_with_store_clock(Arc::new(move || store_time));
        let info = SessionInfo::new(generate_session_id(local), local, "u", "h");

        // Disabled check: skew is tolerated.
        let meta = write_session_marker(&mgr, &info, false, local).unwrap();
        assert!(meta.blob_id.as_str().ends_with(info.id.as_str()));

        let err = write_session_marker(&mgr, &info, true, local).unwrap_err();
        assert!(matches!(err, KeelError::ClockSkew { .. }));
    }

    #[test]
    fn marker_write_at_exact_bound_succeeds() {
        let local = Utc::now();
        let store_time = local - chrono::Duration::from_std(MAX_CLOCK_SKEW).unwrap();
        let mgr = manager_with_store_clock(Arc::new(move || store_time));
        let info = SessionInfo::new(generate_session_id(local), local, "u", "h");
        write_session_marker(&mgr, &info, true, local).unwrap();
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn active_and_stale_sessions() {
        let now = Utc::now();
        let mgr = manager_with_store_clock(Arc::new(move || now));
        let max_age = Duration::from_secs(3600);

        let old = SessionInfo::new(generate_session_id(now), now - chrono::Duration::hours(5), "u", "h");
        let mut fresh = SessionInfo::new(generate_session_id(now), now - chrono::Duration::hours(3), "u", "h");
        write_session_marker(&mgr, &old, false, now).unwrap();
        write_session_marker(&mgr, &fresh, false, now).unwrap();
        // Checkpoint refresh: the newest marker decides.
        fresh.checkpoint_time = now - chrono::Duration::minutes(1);
        write_session_marker(&mgr, &fresh, false, now).unwrap();

        let active = list_active_sessions(&mgr, now, max_age).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active.contains_key(&fresh.id));

        assert_eq!(delete_stale_sessions(&mgr, now, max_age).unwrap(), 1);
        assert_eq!(mgr.storage().list("s").unwrap().len(), 2);
        assert_eq!(delete_stale_sessions(&mgr, now, max_age).unwrap(), 0);
    }

    #[test]
    fn undeletable_marker_does_not_stop_cleanup() {
        let now = Utc::now();
        let store = Arc::new(FaultyBackend::new(MemoryBackend::with_clock(Arc::new(move || now))));
        let mgr = EncryptionManager::new(store.clone(), test_crypter(), 16);
        let old = now - chrono::Duration::hours(5);
        let stuck = SessionInfo::new(generate_session_id(now), old, "u", "h");
        let others: Vec<SessionInfo> = (0..3)
            .map(|_| SessionInfo::new(generate_session_id(now), old, "u", "h"))
            .collect();
        write_session_marker(&mgr, &stuck, false, now).unwrap();
        for info in &others {
            write_session_marker(&mgr, info, false, now).unwrap();
        }
        store.fail_deletes_with(stuck.id.as_str(), || KeelError::backend("delete", "injected"));

        let err = delete_stale_sessions(&mgr, now, Duration::from_secs(3600)).unwrap_err();
        assert!(
            matches!(err, KeelError::PartialFailure { failed: 1, total: 4 }),
            "{err}"
        );
        let left = mgr.storage().list("s").unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].blob_id.as_str().ends_with(stuck.id.as_str()));

        store.clear_failures();
        assert_eq!(delete_stale_sessions(&mgr, now, Duration::from_secs(3600)).unwrap(), 1);
        assert!(mgr.storage().list("s").unwrap().is_empty());
    }
}
