use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// Prefix of pack blobs holding file data contents.
pub const PACK_DATA_PREFIX: &str = "p";
/// Prefix of pack blobs holding metadata contents.
pub const PACK_METADATA_PREFIX: &str = "q";
/// Prefix of index blobs.
pub const INDEX_BLOB_PREFIX: &str = "n";
/// Prefix of index compaction log blobs.
pub const COMPACTION_LOG_PREFIX: &str = "m";
/// Prefix of write-session marker blobs.
pub const SESSION_BLOB_PREFIX: &str = "s";

/// Format blob, written once at repository creation and on parameter changes.
pub const FORMAT_BLOB_ID: &str = "keel.repository";
/// Blob storage configuration (retention).
pub const BLOB_CONFIG_BLOB_ID: &str = "keel.blobcfg";
/// Maintenance parameters and schedule.
pub const MAINTENANCE_BLOB_ID: &str = "keel.maintenance";

pub const PACK_BLOB_PREFIXES: [&str; 2] = [PACK_DATA_PREFIX, PACK_METADATA_PREFIX];

/// Opaque printable blob identifier.
///
/// The store assumes no structure; by convention the first character selects
/// the blob class (see the `*_PREFIX` constants) and an optional
/// `-<session>` suffix ties the blob to the write session that created it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        BlobId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Reject IDs that cannot be stored safely under any backend.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(KeelError::InvalidBlobId(String::new()));
        }
        let printable = self
            .0
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'\\');
        if !printable {
            return Err(KeelError::InvalidBlobId(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobId {
    fn from(value: &str) -> Self {
        BlobId(value.to_string())
    }
}

impl From<String> for BlobId {
    fn from(value: String) -> Self {
        BlobId(value)
    }
}

impl AsRef<str> for BlobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<&str> for BlobId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Blob metadata as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub blob_id: BlobId,
    pub length: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    Governance,
    Compliance,
}

impl RetentionMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "governance" => Ok(RetentionMode::Governance),
            "compliance" => Ok(RetentionMode::Compliance),
            other => Err(KeelError::InvalidConfig(format!(
                "unknown retention mode '{other}'"
            ))),
        }
    }
}

/// Options for `put_with_options`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub retention_mode: Option<RetentionMode>,
    pub retention_period: Duration,
    /// Fail instead of overwriting if the blob already exists.
    pub do_not_recreate: bool,
}

impl PutOptions {
    pub fn has_retention(&self) -> bool {
        self.retention_mode.is_some() && !self.retention_period.is_zero()
    }

    pub fn validate(&self) -> Result<()> {
        match (self.retention_mode, self.retention_period.is_zero()) {
            (Some(_), true) => Err(KeelError::InvalidConfig(
                "retention mode requires a non-zero retention period".into(),
            )),
            (None, false) => Err(KeelError::InvalidConfig(
                "retention period requires a retention mode".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_separators_and_empty() {
        assert!(BlobId::new("").validate().is_err());
        assert!(BlobId::new("a/b").validate().is_err());
        assert!(BlobId::new("a b").validate().is_err());
        assert!(BlobId::new("pdeadbeef-s01").validate().is_ok());
        assert!(BlobId::new(FORMAT_BLOB_ID).validate().is_ok());
    }

    #[test]
    fn retention_options_must_be_paired() {
        let mut opts = PutOptions {
            retention_mode: Some(RetentionMode::Governance),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        opts.retention_period = Duration::from_secs(3600);
        assert!(opts.validate().is_ok());
        assert!(opts.has_retention());

        let orphan_period = PutOptions {
            retention_period: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(orphan_period.validate().is_err());
    }

    #[test]
    fn retention_mode_parse() {
        assert_eq!(
            RetentionMode::parse("COMPLIANCE").unwrap(),
            RetentionMode::Compliance
        );
        assert!(RetentionMode::parse("forever").is_err());
    }
}
