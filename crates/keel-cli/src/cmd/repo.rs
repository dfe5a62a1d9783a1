use std::path::Path;
use std::sync::Arc;

use keel_core::config::KeelConfig;
use keel_core::repo::{Repository, RepositoryOptions};
use keel_crypto::key::KdfCost;
use keel_storage::sharded::{ShardParameters, SHARDS_FILE_NAME};
use keel_storage::{ShardedFsBackend, StorageBackend};

use super::{passphrase, CmdResult};

fn parse_kdf(raw: &str) -> CmdResult<KdfCost> {
    match raw {
        "standard" => Ok(KdfCost::STANDARD),
        "light" => Ok(KdfCost::LIGHT),
        other => Err(format!("unknown kdf cost '{other}' (expected standard or light)").into()),
    }
}

pub(crate) fn run_create(
    config: Option<&KeelConfig>,
    path: &str,
    password: Option<&str>,
    encryption: &str,
    kdf: &str,
) -> CmdResult {
    let kdf_cost = parse_kdf(kdf)?;
    let pass = passphrase(config, password)?;

    let root = Path::new(path);
    if root.join(SHARDS_FILE_NAME).exists() {
        return Err(format!("'{}' already holds a repository", root.display()).into());
    }
    let storage: Arc<dyn StorageBackend> =
        Arc::new(ShardedFsBackend::create(root, ShardParameters::default())?);

    let mut options = RepositoryOptions {
        encryption: encryption.to_string(),
        kdf_cost,
        ..Default::default()
    };
    if let Some(cfg) = config {
        options.open.cache_size = cfg.repository.cache_size;
    }
    let repo = Repository::create(storage, &pass, options)?;
    let format = repo.format();
    println!("Repository created at: {}", root.display());
    println!("Unique ID:  {}", format.unique_id);
    println!("Encryption: {}", format.encryption);
    println!("Hash:       {}", format.hash);
    Ok(())
}
