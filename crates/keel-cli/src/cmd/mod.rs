pub(crate) mod blob;
pub(crate) mod maintenance;
pub(crate) mod repo;
pub(crate) mod shards;

use std::path::PathBuf;
use std::sync::Arc;

use zeroize::Zeroizing;

use keel_core::config::KeelConfig;
use keel_core::repo::session::clock_skew_check_enabled;
use keel_core::repo::{OpenOptions, Repository};
use keel_storage::{backend_from_config, StorageBackend, StorageConfig};

pub(crate) type CmdResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub(crate) const PASSWORD_ENV: &str = "KEEL_PASSWORD";

/// Repository location: the explicit `--path`, else the config file.
pub(crate) fn repo_path(config: Option<&KeelConfig>, explicit: Option<&str>) -> CmdResult<PathBuf> {
    if let Some(p) = explicit {
        return Ok(PathBuf::from(p));
    }
    config
        .map(|c| c.repository.path.clone())
        .ok_or_else(|| "no repository given: pass --path or set repository.path in keel.yaml".into())
}

/// Passphrase from `--password`, `$KEEL_PASSWORD`, or the config file.
pub(crate) fn passphrase(
    config: Option<&KeelConfig>,
    explicit: Option<&str>,
) -> CmdResult<Zeroizing<String>> {
    if let Some(p) = explicit {
        return Ok(Zeroizing::new(p.to_string()));
    }
    if let Some(p) = std::env::var(PASSWORD_ENV).ok().filter(|p| !p.is_empty()) {
        return Ok(Zeroizing::new(p));
    }
    config
        .and_then(|c| c.encryption.passphrase.clone())
        .map(Zeroizing::new)
        .ok_or_else(|| format!("no passphrase: pass --password or set {PASSWORD_ENV}").into())
}

pub(crate) fn open_storage(
    config: Option<&KeelConfig>,
    path: PathBuf,
) -> CmdResult<Arc<dyn StorageBackend>> {
    let retry = config
        .map(|c| c.repository.retry.clone())
        .unwrap_or_default();
    let backend = backend_from_config(&StorageConfig::Filesystem { path, retry })?;
    Ok(Arc::from(backend))
}

pub(crate) fn open_repository(
    config: Option<&KeelConfig>,
    path: Option<&str>,
    password: Option<&str>,
) -> CmdResult<Repository> {
    let storage = open_storage(config, repo_path(config, path)?)?;
    let pass = passphrase(config, password)?;
    let options = OpenOptions {
        cache_size: config
            .map(|c| c.repository.cache_size)
            .unwrap_or(keel_core::repo::DEFAULT_CACHE_SIZE),
        clock_skew_check: clock_skew_check_enabled(config.is_some_and(|c| c.clock_skew_check)),
        clock: None,
    };
    tracing::debug!(
        storage = %storage.describe(),
        clock_skew_check = options.clock_skew_check,
        "opening repository"
    );
    Ok(Repository::open(storage, &pass, options)?)
}
