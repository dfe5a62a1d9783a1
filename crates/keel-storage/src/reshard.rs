//! Offline re-layout of a sharded filesystem repository.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use keel_types::blob::BlobId;
use keel_types::error::{KeelError, Result};

use crate::sharded::{temp_file_in, ShardModification, ShardParameters};
use crate::sharded_fs::walk_blob_files;

const EXDEV: i32 = 18;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReshardReport {
    pub blobs_seen: usize,
    pub blobs_moved: usize,
    pub blobs_unchanged: usize,
    pub failed: usize,
    pub dirs_removed: usize,
    pub dry_run: bool,
}

/// Apply `request` to the shard parameters of the repository at `root` and
/// move every blob file to its new location.
///
/// The request is validated before anything is touched. Per-blob failures are
/// logged and counted; the walk continues and the call fails at the end with
/// `PartialFailure`. The `.shards` file is only rewritten once every blob is in
/// place, so an interrupted or partially failed run can simply be repeated.
///
/// Must not run while any other process uses the repository.
pub fn modify_shards(
    root: &Path,
    request: &ShardModification,
    dry_run: bool,
    cancel: Option<&AtomicBool>,
) -> Result<ReshardReport> {
    if !root.is_dir() {
        return Err(KeelError::RepoNotFound(root.display().to_string()));
    }
    let current = ShardParameters::load(root)?;
    let next = request.apply(&current)?;

    let mut blobs: Vec<(PathBuf, BlobId)> = Vec::new();
    walk_blob_files(root, &mut |path, id| {
        blobs.push((path.to_path_buf(), id));
        Ok(())
    })?;

    let mut report = ReshardReport {
        dry_run,
        ..Default::default()
    };
    for (src, id) in blobs {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            info!(moved = report.blobs_moved, "re-shard cancelled");
            return Err(KeelError::Cancelled);
        }
        report.blobs_seen += 1;
        let dst = root.join(next.relative_path_for(id.as_str()));
        if dst == src {
            report.blobs_unchanged += 1;
            continue;
        }
        if dry_run {
            info!(
                blob = %id,
                from = %rel(root, &src),
                to = %rel(root, &dst),
                "would move"
            );
            report.blobs_moved += 1;
            continue;
        }
        match move_file(&src, &dst) {
            Ok(()) => {
                debug!(blob = %id, to = %rel(root, &dst), "moved");
                report.blobs_moved += 1;
            }
            Err(e) => {
                warn!(blob = %id, from = %rel(root, &src), "failed to move blob: {e}");
                report.failed += 1;
            }
        }
    }

    if dry_run {
        info!(
            would_move = report.blobs_moved,
            unchanged = report.blobs_unchanged,
            "dry run, shard parameters not changed"
        );
        return Ok(report);
    }

    report.dirs_removed = remove_empty_dirs(root, root)?;
    if report.failed > 0 {
        return Err(KeelError::PartialFailure {
            failed: report.failed,
            total: report.blobs_seen,
        });
    }

    next.save(root)?;
    info!(
        moved = report.blobs_moved,
        unchanged = report.blobs_unchanged,
        dirs_removed = report.dirs_removed,
        "shard parameters updated"
    );
    Ok(report)
}

fn rel(root: &Path, p: &Path) -> String {
    p.strip_prefix(root).unwrap_or(p).display().to_string()
}

/// Rename `src` to `dst`, copying across devices. The source is only removed
/// after the destination is durable.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            let data = fs::read(src)?;
            let dir = dst.parent().unwrap_or(Path::new("."));
            let mut tmp = temp_file_in(dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(dst).map_err(|e| e.error)?;
            fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove empty directories below `dir` (never `root` itself).
fn remove_empty_dirs(root: &Path, dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            removed += remove_empty_dirs(root, &entry.path())?;
        }
    }
    if dir != root && fs::read_dir(dir)?.next().is_none() {
        fs::remove_dir(dir)?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharded_fs::ShardedFsBackend;
    use crate::StorageBackend;

    const Q_BLOB: &str = "q1a2b3c4d5e6f7a8b9c0d1e2";

    fn populated() -> (tempfile::TempDir, Vec<(String, Vec<u8>)>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardedFsBackend::create(dir.path(), ShardParameters::default()).unwrap();
        let blobs: Vec<(String, Vec<u8>)> = vec![
            ("keel.repository".into(), b"format".to_vec()),
            (Q_BLOB.into(), b"metadata pack".to_vec()),
            ("n0f0e0d0c0b0a09080706050-s01".into(), b"index".to_vec()),
            ("p99887766554433221100aabb".into(), b"data pack".to_vec()),
        ];
        for (id, data) in &blobs {
            store.put(id, data).unwrap();
        }
        (dir, blobs)
    }

    fn modify(root: &Path, req: ShardModification) -> Result<ReshardReport> {
        modify_shards(root, &req, false, None)
    }

    fn assert_all_readable(root: &Path, blobs: &[(String, Vec<u8>)]) {
        let store = ShardedFsBackend::open(root).unwrap();
        for (id, data) in blobs {
            assert_eq!(&store.get(id).unwrap().unwrap(), data, "{id}");
        }
        assert_eq!(store.list("").unwrap().len(), blobs.len());
    }

    #[test]
    fn default_shards_change_moves_blobs() {
        let (dir, blobs) = populated();
        let root = dir.path();
        assert!(root.join("q/1a2/b3c4d5e6f7a8b9c0d1e2.f").is_file());

        let report = modify(
            root,
            ShardModification {
                default_shards: Some("5,5".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(report.failed, 0);
        assert!(root.join("q1a2b/3c4d5/e6f7a8b9c0d1e2.f").is_file());
        assert!(!root.join("q/1a2").exists());
        assert!(root.join("keel.repository.f").is_file());
        assert_all_readable(root, &blobs);
    }

    #[test]
    fn there_and_back_again() {
        let (dir, blobs) = populated();
        let root = dir.path();
        let before = ShardParameters::load(root).unwrap();
        modify(
            root,
            ShardModification {
                default_shards: Some("2,2,2".into()),
                unsharded_length: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        modify(
            root,
            ShardModification {
                default_shards: Some("1,3".into()),
                unsharded_length: Some(20),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ShardParameters::load(root).unwrap(), before);
        assert!(root.join("q/1a2/b3c4d5e6f7a8b9c0d1e2.f").is_file());
        assert_all_readable(root, &blobs);
    }

    #[test]
    fn unsharded_length_change_leaves_long_ids_alone() {
        let (dir, blobs) = populated();
        let root = dir.path();
        let report = modify(
            root,
            ShardModification {
                unsharded_length: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        // Only the short fixed-ID blob changes location.
        assert_eq!(report.blobs_moved, 1);
        assert!(root.join("k/eel/.repository.f").is_file());
        assert!(root.join("q/1a2/b3c4d5e6f7a8b9c0d1e2.f").is_file());
        assert_all_readable(root, &blobs);
    }

    #[test]
    fn override_then_flat_then_remove() {
        let (dir, blobs) = populated();
        let root = dir.path();
        modify(
            root,
            ShardModification {
                unsharded_length: Some(0),
                overrides: vec!["kee=2,,,2".into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(root.join("ke/el/.repository.f").is_file());

        modify(
            root,
            ShardModification {
                overrides: vec!["kee=flat".into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(root.join("keel.repository.f").is_file());

        modify(
            root,
            ShardModification {
                remove_overrides: vec!["nosuchprefix".into(), "kee".into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(root.join("k/eel/.repository.f").is_file());
        assert_all_readable(root, &blobs);
    }

    #[test]
    fn dry_run_moves_nothing() {
        let (dir, _blobs) = populated();
        let root = dir.path();
        let before = ShardParameters::load(root).unwrap();
        let report = modify_shards(
            root,
            &ShardModification {
                default_shards: Some("flat".into()),
                ..Default::default()
            },
            true,
            None,
        )
        .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.blobs_moved, 3);
        assert!(root.join("q/1a2/b3c4d5e6f7a8b9c0d1e2.f").is_file());
        assert_eq!(ShardParameters::load(root).unwrap(), before);
    }

    #[test]
    fn invalid_request_touches_nothing() {
        let (dir, blobs) = populated();
        let root = dir.path();
        for req in [
            ShardModification {
                default_shards: Some("invalid".into()),
                ..Default::default()
            },
            ShardModification {
                overrides: vec!["x".into()],
                ..Default::default()
            },
            ShardModification {
                overrides: vec!["x=aaa".into()],
                ..Default::default()
            },
            ShardModification {
                overrides: vec!["2,-1".into()],
                ..Default::default()
            },
        ] {
            assert!(modify(root, req).is_err());
        }
        assert!(root.join("q/1a2/b3c4d5e6f7a8b9c0d1e2.f").is_file());
        assert_all_readable(root, &blobs);
    }

    #[test]
    fn cancelled_run_can_be_resumed() {
        let (dir, blobs) = populated();
        let root = dir.path();
        let req = ShardModification {
            default_shards: Some("3".into()),
            ..Default::default()
        };
        let cancel = AtomicBool::new(true);
        let err = modify_shards(root, &req, false, Some(&cancel)).unwrap_err();
        assert!(matches!(err, KeelError::Cancelled));

        modify_shards(root, &req, false, None).unwrap();
        assert!(root.join("q1a/2b3c4d5e6f7a8b9c0d1e2.f").is_file());
        assert_all_readable(root, &blobs);
    }

    #[test]
    fn missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = modify(&dir.path().join("absent"), ShardModification::default()).unwrap_err();
        assert!(matches!(err, KeelError::RepoNotFound(_)));
    }
}
