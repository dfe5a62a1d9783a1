use std::sync::Arc;

use keel_core::maintenance::{self, Mode, RunOptions, SafetyParameters};
use keel_core::repo::content::ContentKind;
use keel_core::repo::{OpenOptions, Repository, RepositoryOptions};
use keel_crypto::key::KdfCost;
use keel_storage::reshard::modify_shards;
use keel_storage::sharded::{ShardModification, ShardParameters};
use keel_storage::{ShardedFsBackend, StorageBackend};
use keel_types::blob::FORMAT_BLOB_ID;

const PASSPHRASE: &str = "lifecycle-test";

fn open(root: &std::path::Path) -> Repository {
    let backend: Arc<dyn StorageBackend> = Arc::new(ShardedFsBackend::open(root).unwrap());
    Repository::open(backend, PASSPHRASE, OpenOptions::default()).unwrap()
}

#[test]
fn create_write_maintain_reshard_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");

    let backend: Arc<dyn StorageBackend> =
        Arc::new(ShardedFsBackend::create(&root, ShardParameters::default()).unwrap());
    let repo = Repository::create(
        backend,
        PASSPHRASE,
        RepositoryOptions {
            kdf_cost: KdfCost::LIGHT,
            encryption: "CHACHA20-POLY1305".into(),
            ..Default::default()
        },
    )
    .unwrap();
    // Short IDs stay flat under the default parameters.
    assert!(root.join("keel.repository.f").exists());

    let mut session = repo.new_write_session().unwrap();
    let ids: Vec<_> = (0..20)
        .map(|i| {
            session
                .write_content(format!("file chunk {i}").as_bytes(), ContentKind::Data)
                .unwrap()
        })
        .collect();
    session.close().unwrap();
    drop(repo);

    let repo = open(&root);
    let mut opts = RunOptions::new(Mode::Full);
    opts.safety = SafetyParameters::none();
    maintenance::run(&repo, &opts).unwrap();
    drop(repo);

    let request = ShardModification {
        default_shards: Some("2,2".into()),
        unsharded_length: Some(0),
        ..Default::default()
    };
    let report = modify_shards(&root, &request, false, None).unwrap();
    assert!(report.blobs_moved > 0);
    assert_eq!(report.failed, 0);
    assert!(root.join("ke/el/.repository.f").exists());

    let repo = open(&root);
    assert!(repo.storage().exists(FORMAT_BLOB_ID).unwrap());
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(repo.read_content(id).unwrap(), format!("file chunk {i}").as_bytes());
    }
}

#[test]
fn open_missing_repository_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ShardedFsBackend::open(&dir.path().join("absent")).is_err());

    let backend: Arc<dyn StorageBackend> =
        Arc::new(ShardedFsBackend::create(dir.path(), ShardParameters::default()).unwrap());
    let err = Repository::open(backend, PASSPHRASE, OpenOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, keel_types::error::KeelError::RepoNotFound(_)));
}
