pub mod blob_manager;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_types::blob::BlobId;
use keel_types::content_id::ContentId;
use keel_types::error::Result;

use crate::compress::{self, Compression};

pub use blob_manager::{CompactOptions, CompactStats, CompactionLog, IndexBlobManager};

/// Location and state of one content, as recorded in an index blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub content_id: ContentId,
    pub pack_blob_id: BlobId,
    pub pack_offset: u64,
    pub packed_length: u64,
    /// Unix seconds when this entry was written.
    pub timestamp: i64,
    pub deleted: bool,
}

impl ContentInfo {
    /// Whether `self` wins over `other` for the same content: the newer entry
    /// wins, and on equal timestamps a deletion wins.
    pub fn supersedes(&self, other: &ContentInfo) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.deleted && !other.deleted,
        }
    }
}

/// Accumulates index entries, keeping the winning entry per content.
#[derive(Debug, Clone, Default)]
pub struct IndexBuilder {
    entries: BTreeMap<ContentId, ContentInfo>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info: ContentInfo) {
        match self.entries.get(&info.content_id) {
            Some(existing) if !info.supersedes(existing) => {}
            _ => {
                self.entries.insert(info.content_id.clone(), info);
            }
        }
    }

    pub fn merge(&mut self, other: IndexBuilder) {
        for info in other.entries.into_values() {
            self.add(info);
        }
    }

    pub fn get(&self, id: &ContentId) -> Option<&ContentInfo> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentInfo> {
        self.entries.values()
    }

    /// Remove deletion entries older than `cutoff` (unix seconds). Entries
    /// deleted at or after the cutoff are kept. Returns the number removed.
    pub fn drop_deleted_before(&mut self, cutoff: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, info| !(info.deleted && info.timestamp < cutoff));
        before - self.entries.len()
    }

    /// Serialized form stored inside an index blob.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let list: Vec<&ContentInfo> = self.entries.values().collect();
        let packed = rmp_serde::to_vec(&list)?;
        compress::compress(Compression::default(), &packed)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let packed = compress::decompress(data)?;
        let list: Vec<ContentInfo> = rmp_serde::from_slice(&packed)?;
        let mut builder = IndexBuilder::new();
        for info in list {
            builder.add(info);
        }
        Ok(builder)
    }
}

impl FromIterator<ContentInfo> for IndexBuilder {
    fn from_iter<T: IntoIterator<Item = ContentInfo>>(iter: T) -> Self {
        let mut builder = IndexBuilder::new();
        for info in iter {
            builder.add(info);
        }
        builder
    }
}
