//! YAML configuration for the `keel` command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_storage::RetryConfig;
use keel_types::error::{KeelError, Result};

pub const CONFIG_ENV: &str = "KEEL_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "keel.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeelConfig {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Compare local time with store timestamps when writing session markers.
    #[serde(default)]
    pub clock_skew_check: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    /// Number of decrypted blobs kept in memory.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Owner recorded by `maintenance set --owner=me`; defaults to user@host.
    pub owner: Option<String>,
    /// Delay before retrying after a failed scheduled run, e.g. "1m".
    #[serde(default = "default_penalty")]
    pub penalty: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            owner: None,
            penalty: default_penalty(),
        }
    }
}

impl MaintenanceConfig {
    pub fn penalty_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.penalty)
    }
}

fn default_cache_size() -> usize {
    256
}

fn default_penalty() -> String {
    "1m".to_string()
}

impl KeelConfig {
    /// Minimal config pointing at `path` with defaults everywhere else.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            repository: RepositoryConfig {
                path: path.into(),
                cache_size: default_cache_size(),
                retry: RetryConfig::default(),
            },
            encryption: EncryptionConfig::default(),
            maintenance: MaintenanceConfig::default(),
            clock_skew_check: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.repository.path.as_os_str().is_empty() {
            return Err(KeelError::InvalidConfig("repository.path must not be empty".into()));
        }
        if self.repository.retry.retry_delay_ms > self.repository.retry.retry_max_delay_ms {
            return Err(KeelError::InvalidConfig(
                "repository.retry.retry_delay_ms exceeds retry_max_delay_ms".into(),
            ));
        }
        if let Some(owner) = &self.maintenance.owner {
            if !owner.contains('@') {
                return Err(KeelError::InvalidConfig(format!(
                    "maintenance.owner '{owner}' must be of the form user@host"
                )));
            }
        }
        self.maintenance.penalty_duration()?;
        Ok(())
    }
}

/// Parse durations like `90s`, `30m`, `4h`, `2d`. A bare number is seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => {
            return Err(KeelError::InvalidConfig("duration must not be empty".into()));
        }
    };

    let value: u64 = num_part
        .parse()
        .map_err(|_| KeelError::InvalidConfig(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        None | Some('s') | Some('S') => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some(other) => {
            return Err(KeelError::InvalidConfig(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d)"
            )));
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Config file to use: the explicit path, then `$KEEL_CONFIG`, then
/// `./keel.yaml` if it exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(p));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.is_file().then_some(local)
}

pub fn load_config(path: &Path) -> Result<KeelConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        KeelError::InvalidConfig(format!("cannot read config '{}': {e}", path.display()))
    })?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<KeelConfig> {
    let cfg: KeelConfig = serde_yaml::from_str(raw)
        .map_err(|e| KeelError::InvalidConfig(format!("config: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_human_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_human_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_human_duration("4h").unwrap(), Duration::from_secs(4 * 3600));
        assert_eq!(parse_human_duration(" 2d ").unwrap(), Duration::from_secs(2 * 86400));
        assert!(parse_human_duration("").is_err());
        assert!(parse_human_duration("3w").is_err());
        assert!(parse_human_duration("h").is_err());
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let cfg = parse_config("repository:\n  path: /srv/keel\n").unwrap();
        assert_eq!(cfg.repository.path, PathBuf::from("/srv/keel"));
        assert_eq!(cfg.repository.cache_size, 256);
        assert_eq!(cfg.repository.retry, RetryConfig::default());
        assert_eq!(cfg.maintenance.penalty_duration().unwrap(), Duration::from_secs(60));
        assert!(!cfg.clock_skew_check);
        assert!(cfg.encryption.passphrase.is_none());
    }

    #[test]
    fn full_yaml() {
        let cfg = parse_config(
            r#"
repository:
  path: /data/repo
  cache_size: 16
  retry:
    max_retries: 5
encryption:
  passphrase: hunter2
maintenance:
  owner: backup@nas
  penalty: 5m
clock_skew_check: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.repository.cache_size, 16);
        assert_eq!(cfg.repository.retry.max_retries, 5);
        assert_eq!(cfg.encryption.passphrase.as_deref(), Some("hunter2"));
        assert_eq!(cfg.maintenance.owner.as_deref(), Some("backup@nas"));
        assert!(cfg.clock_skew_check);
    }

    #[test]
    fn invalid_values_rejected_at_load() {
        assert!(parse_config("repository:\n  path: ''\n").is_err());
        assert!(parse_config("repository:\n  path: /x\nmaintenance:\n  owner: nobody\n").is_err());
        assert!(parse_config("repository:\n  path: /x\nmaintenance:\n  penalty: soon\n").is_err());
        assert!(parse_config("repository: [").is_err());
    }

    #[test]
    fn explicit_path_wins() {
        let p = resolve_config_path(Some(Path::new("/etc/keel.yaml"))).unwrap();
        assert_eq!(p, PathBuf::from("/etc/keel.yaml"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.yaml");
        std::fs::write(&path, "repository:\n  path: /r\n").unwrap();
        assert_eq!(load_config(&path).unwrap().repository.path, PathBuf::from("/r"));
        assert!(load_config(&dir.path().join("missing.yaml")).is_err());
    }
}
