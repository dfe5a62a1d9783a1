//! Mapping between logical blob IDs and sharded filesystem paths.
//!
//! A blob ID is split into directory segments according to a shard scheme,
//! e.g. `[1, 3]` stores `qdeadbeef` as `q/dea/dbeef.f`. The scheme is chosen
//! per ID (literal-prefix overrides, then the default) and persisted in a
//! `.shards` file at the repository root.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use keel_types::blob::BlobId;
use keel_types::error::{KeelError, Result};

/// Suffix of every complete blob file. Anything else under the root is
/// ignored (temporary files, the parameters file).
pub const COMPLETE_BLOB_SUFFIX: &str = ".f";
/// Prefix and suffix of in-flight temporary files.
pub const TEMP_FILE_PREFIX: &str = ".keel-";
pub const TEMP_FILE_SUFFIX: &str = ".tmp";
pub const SHARDS_FILE_NAME: &str = ".shards";

pub const DEFAULT_SHARDS: [usize; 2] = [1, 3];
pub const DEFAULT_UNSHARDED_LENGTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOverride {
    pub prefix: String,
    pub shards: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardParameters {
    #[serde(default = "default_shards")]
    pub default_shards: Vec<usize>,
    /// IDs no longer than this are always stored flat.
    #[serde(default = "default_unsharded_length")]
    pub unsharded_length: usize,
    #[serde(default)]
    pub overrides: Vec<ShardOverride>,
}

fn default_shards() -> Vec<usize> {
    DEFAULT_SHARDS.to_vec()
}

fn default_unsharded_length() -> usize {
    DEFAULT_UNSHARDED_LENGTH
}

impl Default for ShardParameters {
    fn default() -> Self {
        Self {
            default_shards: default_shards(),
            unsharded_length: default_unsharded_length(),
            overrides: Vec::new(),
        }
    }
}

/// Location of a blob relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPath {
    pub dirs: Vec<String>,
    pub file_name: String,
}

impl ShardPath {
    pub fn to_relative(&self) -> PathBuf {
        let mut p = PathBuf::new();
        for d in &self.dirs {
            p.push(d);
        }
        p.push(&self.file_name);
        p
    }
}

impl ShardParameters {
    /// Scheme for `id`: the longest override prefix that matches, else the default.
    pub fn scheme_for(&self, id: &str) -> &[usize] {
        self.overrides
            .iter()
            .filter(|o| id.starts_with(o.prefix.as_str()))
            .max_by_key(|o| o.prefix.len())
            .map(|o| o.shards.as_slice())
            .unwrap_or(&self.default_shards)
    }

    pub fn path_for(&self, id: &str) -> ShardPath {
        let mut dirs = Vec::new();
        let mut rest = id;
        if id.len() > self.unsharded_length && id.is_ascii() {
            for &n in self.scheme_for(id) {
                if n == 0 {
                    continue;
                }
                // The file name must keep at least one character.
                if rest.len() <= n {
                    break;
                }
                let (segment, tail) = rest.split_at(n);
                dirs.push(segment.to_string());
                rest = tail;
            }
        }
        ShardPath {
            dirs,
            file_name: format!("{rest}{COMPLETE_BLOB_SUFFIX}"),
        }
    }

    pub fn relative_path_for(&self, id: &str) -> PathBuf {
        self.path_for(id).to_relative()
    }

    /// Load `.shards` from `root`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        match fs::read(root.join(SHARDS_FILE_NAME)) {
            Ok(bytes) => {
                let params: ShardParameters = serde_json::from_slice(&bytes)?;
                params.validate()?;
                Ok(params)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace `.shards` under `root`.
    pub fn save(&self, root: &Path) -> Result<()> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = temp_file_in(root)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(root.join(SHARDS_FILE_NAME))
            .map_err(|e| e.error)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for o in &self.overrides {
            if o.prefix.is_empty() {
                return Err(KeelError::InvalidConfig("shard override with empty prefix".into()));
            }
            if !seen.insert(o.prefix.as_str()) {
                return Err(KeelError::InvalidConfig(format!(
                    "duplicate shard override for prefix '{}'",
                    o.prefix
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn temp_file_in(dir: &Path) -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .suffix(TEMP_FILE_SUFFIX)
        .tempfile_in(dir)
}

/// Reconstruct a blob ID from a path relative to the root. Returns `None` for
/// anything that is not a complete blob file.
pub fn blob_id_from_relative(rel: &Path) -> Option<BlobId> {
    let mut id = String::new();
    let mut components = rel.components().peekable();
    while let Some(c) = components.next() {
        let std::path::Component::Normal(part) = c else {
            return None;
        };
        let part = part.to_str()?;
        if components.peek().is_some() {
            id.push_str(part);
        } else {
            id.push_str(part.strip_suffix(COMPLETE_BLOB_SUFFIX)?);
        }
    }
    let id = BlobId::new(id);
    id.validate().ok()?;
    Some(id)
}

/// Parse a shard scheme: `flat`, or comma-separated non-negative lengths.
/// Empty entries count as zero and are skipped when splitting.
pub fn parse_shard_spec(raw: &str) -> Result<Vec<usize>> {
    let raw = raw.trim();
    if raw == "flat" {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|tok| {
            let tok = tok.trim();
            if tok.is_empty() {
                return Ok(0);
            }
            tok.parse::<usize>().map_err(|_| {
                KeelError::InvalidConfig(format!(
                    "invalid shard length '{tok}' in '{raw}' (expected non-negative integers or 'flat')"
                ))
            })
        })
        .collect()
}

/// Parse `<prefix>=<spec>`.
pub fn parse_override(raw: &str) -> Result<ShardOverride> {
    let Some((prefix, spec)) = raw.split_once('=') else {
        return Err(KeelError::InvalidConfig(format!(
            "invalid shard override '{raw}' (expected <prefix>=<shards>)"
        )));
    };
    if prefix.is_empty() {
        return Err(KeelError::InvalidConfig(format!(
            "invalid shard override '{raw}': empty prefix"
        )));
    }
    Ok(ShardOverride {
        prefix: prefix.to_string(),
        shards: parse_shard_spec(spec)?,
    })
}

/// Operator-requested change to the shard parameters, as given on the
/// command line.
#[derive(Debug, Clone, Default)]
pub struct ShardModification {
    pub default_shards: Option<String>,
    pub unsharded_length: Option<i64>,
    pub overrides: Vec<String>,
    pub remove_overrides: Vec<String>,
}

impl ShardModification {
    /// Validate every part of the request and return the resulting parameters.
    /// Nothing is applied unless the whole request parses.
    pub fn apply(&self, current: &ShardParameters) -> Result<ShardParameters> {
        let mut next = current.clone();

        if let Some(raw) = &self.default_shards {
            next.default_shards = parse_shard_spec(raw)?;
        }
        if let Some(len) = self.unsharded_length {
            next.unsharded_length = usize::try_from(len).map_err(|_| {
                KeelError::InvalidConfig(format!("unsharded length must not be negative: {len}"))
            })?;
        }

        let parsed: Vec<ShardOverride> = self
            .overrides
            .iter()
            .map(|raw| parse_override(raw))
            .collect::<Result<_>>()?;

        for prefix in &self.remove_overrides {
            next.overrides.retain(|o| &o.prefix != prefix);
        }
        for o in parsed {
            match next.overrides.iter_mut().find(|e| e.prefix == o.prefix) {
                Some(existing) => existing.shards = o.shards,
                None => next.overrides.push(o),
            }
        }

        next.validate()?;
        Ok(next)
    }
}
