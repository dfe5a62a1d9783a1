use std::time::Duration;

use keel_types::error::{KeelError, Result};

/// Safety margins applied by full maintenance.
///
/// The margins protect writers that are still running, and readers of stores
/// whose listings lag behind writes. Anything weaker than [`full`](Self::full)
/// must be acknowledged explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyParameters {
    pub disable_eventual_consistency_safety: bool,
    /// How long a compaction log must exist before its inputs are deleted.
    pub eventual_consistency_settle_time: Duration,
    /// Deletion entries younger than this are kept in the index.
    pub drop_deleted_min_age: Duration,
    /// Unreferenced pack blobs younger than this are kept.
    pub blob_delete_min_age: Duration,
    /// Sessions without a checkpoint for this long are considered dead.
    pub session_expiration_age: Duration,
    pub unsafe_acknowledged: bool,
}

impl Default for SafetyParameters {
    fn default() -> Self {
        Self::full()
    }
}

impl SafetyParameters {
    pub fn full() -> Self {
        Self {
            disable_eventual_consistency_safety: false,
            eventual_consistency_settle_time: Duration::from_secs(3600),
            drop_deleted_min_age: Duration::from_secs(3600),
            blob_delete_min_age: Duration::from_secs(24 * 3600),
            session_expiration_age: Duration::from_secs(96 * 3600),
            unsafe_acknowledged: false,
        }
    }

    /// No margins at all. Only safe when nothing else touches the repository.
    pub fn none() -> Self {
        Self {
            disable_eventual_consistency_safety: true,
            eventual_consistency_settle_time: Duration::ZERO,
            drop_deleted_min_age: Duration::ZERO,
            blob_delete_min_age: Duration::ZERO,
            session_expiration_age: Duration::ZERO,
            unsafe_acknowledged: true,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "full" => Ok(Self::full()),
            "none" => Ok(Self::none()),
            other => Err(KeelError::InvalidConfig(format!(
                "unknown safety level '{other}' (expected 'full' or 'none')"
            ))),
        }
    }

    /// Whether any margin is weaker than [`full`](Self::full).
    pub fn is_relaxed(&self) -> bool {
        let full = Self::full();
        self.disable_eventual_consistency_safety
            || self.eventual_consistency_settle_time < full.eventual_consistency_settle_time
            || self.drop_deleted_min_age < full.drop_deleted_min_age
            || self.blob_delete_min_age < full.blob_delete_min_age
            || self.session_expiration_age < full.session_expiration_age
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_relaxed() && !self.unsafe_acknowledged {
            return Err(KeelError::UnsafeParameters(
                "relaxed safety margins require explicit acknowledgement".into(),
            ));
        }
        Ok(())
    }
}
