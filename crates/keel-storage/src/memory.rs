use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use keel_types::blob::{BlobId, BlobMetadata, PutOptions, RetentionMode};
use keel_types::error::{KeelError, Result};

use crate::StorageBackend;

/// Source of "now" for stored timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

struct StoredBlob {
    data: Vec<u8>,
    timestamp: DateTime<Utc>,
    retention: Option<(RetentionMode, DateTime<Utc>)>,
}

/// In-memory blob store with store-side timestamps and object retention.
pub struct MemoryBackend {
    blobs: Mutex<BTreeMap<String, StoredBlob>>,
    clock: Clock,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Stamp writes with `clock` instead of the wall clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredBlob>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Override the store timestamp of an existing blob.
    pub fn set_timestamp(&self, id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut blobs = self.lock();
        let blob = blobs
            .get_mut(id)
            .ok_or_else(|| KeelError::NotFound(id.to_string()))?;
        blob.timestamp = timestamp;
        Ok(())
    }

    /// Retention deadline of a blob, if one is set.
    pub fn retained_until(&self, id: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .get(id)
            .and_then(|b| b.retention.map(|(_, until)| until))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn retention_deadline(&self, opts: &PutOptions) -> Result<Option<(RetentionMode, DateTime<Utc>)>> {
        let Some(mode) = opts.retention_mode else {
            return Ok(None);
        };
        let period = chrono::Duration::from_std(opts.retention_period)
            .map_err(|e| KeelError::InvalidConfig(format!("retention period: {e}")))?;
        Ok(Some((mode, (self.clock)() + period)))
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(id).map(|b| b.data.clone()))
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let blobs = self.lock();
        let Some(blob) = blobs.get(id) else {
            return Ok(None);
        };
        let start = (offset as usize).min(blob.data.len());
        let end = start.saturating_add(length as usize).min(blob.data.len());
        Ok(Some(blob.data[start..end].to_vec()))
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        self.put_with_options(id, data, &PutOptions::default())
    }

    fn put_with_options(&self, id: &str, data: &[u8], opts: &PutOptions) -> Result<()> {
        BlobId::new(id).validate()?;
        opts.validate()?;
        let retention = self.retention_deadline(opts)?;
        let now = (self.clock)();

        let mut blobs = self.lock();
        if let Some(existing) = blobs.get(id) {
            if opts.do_not_recreate {
                return Err(KeelError::AlreadyExists(id.to_string()));
            }
            if matches!(existing.retention, Some((_, until)) if until > now) {
                return Err(KeelError::Unsupported(format!(
                    "overwriting '{id}' while under retention"
                )));
            }
        }
        blobs.insert(
            id.to_string(),
            StoredBlob {
                data: data.to_vec(),
                timestamp: now,
                retention,
            },
        );
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let now = (self.clock)();
        let mut blobs = self.lock();
        if let Some(blob) = blobs.get(id) {
            if matches!(blob.retention, Some((_, until)) if until > now) {
                return Err(KeelError::Unsupported(format!(
                    "deleting '{id}' while under retention"
                )));
            }
        }
        blobs.remove(id);
        Ok(())
    }

    fn list_blobs(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        // Snapshot first so the callback may call back into the store.
        let snapshot: Vec<BlobMetadata> = self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, b)| BlobMetadata {
                blob_id: BlobId::new(k.clone()),
                length: b.data.len() as u64,
                timestamp: b.timestamp,
            })
            .collect();
        for bm in snapshot {
            callback(bm)?;
        }
        Ok(())
    }

    fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>> {
        Ok(self.lock().get(id).map(|b| BlobMetadata {
            blob_id: BlobId::new(id),
            length: b.data.len() as u64,
            timestamp: b.timestamp,
        }))
    }

    fn extend_retention(&self, id: &str, opts: &PutOptions) -> Result<()> {
        opts.validate()?;
        let Some((mode, until)) = self.retention_deadline(opts)? else {
            return Err(KeelError::InvalidConfig(
                "extending retention requires a retention mode".into(),
            ));
        };
        let mut blobs = self.lock();
        let blob = blobs
            .get_mut(id)
            .ok_or_else(|| KeelError::NotFound(id.to_string()))?;
        match blob.retention {
            Some((_, current)) if current >= until => {}
            _ => blob.retention = Some((mode, until)),
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixed_clock(ts: DateTime<Utc>) -> Clock {
        Arc::new(move || ts)
    }

    #[test]
    fn put_get_delete() {
        let store = MemoryBackend::new();
        store.put("pabc", b"hello").unwrap();
        assert_eq!(store.get("pabc").unwrap().unwrap(), b"hello");
        assert_eq!(store.get_range("pabc", 1, 3).unwrap().unwrap(), b"ell");
        assert_eq!(store.get_range("pabc", 3, 100).unwrap().unwrap(), b"lo");
        store.delete("pabc").unwrap();
        assert!(store.get("pabc").unwrap().is_none());
        store.delete("pabc").unwrap();
    }

    #[test]
    fn listing_respects_prefix_and_reports_store_time() {
        let ts = Utc::now() - chrono::Duration::hours(3);
        let store = MemoryBackend::with_clock(fixed_clock(ts));
        store.put("n1", b"a").unwrap();
        store.put("n2", b"bb").unwrap();
        store.put("p1", b"ccc").unwrap();

        let listed = store.list("n").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].blob_id, "n2");
        assert_eq!(listed[1].length, 2);
        assert_eq!(listed[1].timestamp, ts);
    }

    #[test]
    fn callback_error_stops_listing() {
        let store = MemoryBackend::new();
        for i in 0..5 {
            store.put(&format!("q{i}"), b"x").unwrap();
        }
        let mut seen = 0;
        let err = store
            .list_blobs("q", &mut |_| {
                seen += 1;
                if seen == 2 {
                    Err(KeelError::Cancelled)
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, KeelError::Cancelled));
        assert_eq!(seen, 2);
    }

    #[test]
    fn do_not_recreate_refuses_existing() {
        let store = MemoryBackend::new();
        let opts = PutOptions {
            do_not_recreate: true,
            ..Default::default()
        };
        store.put_with_options("keel.repository", b"v1", &opts).unwrap();
        let err = store
            .put_with_options("keel.repository", b"v2", &opts)
            .unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists(_)));
        assert_eq!(store.get("keel.repository").unwrap().unwrap(), b"v1");
    }

    #[test]
    fn retention_blocks_delete_and_extends() {
        let store = MemoryBackend::new();
        let opts = PutOptions {
            retention_mode: Some(RetentionMode::Compliance),
            retention_period: Duration::from_secs(3600),
            do_not_recreate: false,
        };
        store.put_with_options("p1", b"data", &opts).unwrap();
        assert!(store.delete("p1").is_err());

        let first = store.retained_until("p1").unwrap();
        let longer = PutOptions {
            retention_period: Duration::from_secs(7200),
            ..opts
        };
        store.extend_retention("p1", &longer).unwrap();
        assert!(store.retained_until("p1").unwrap() > first);
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let store = MemoryBackend::new();
        assert!(store.put("a/b", b"x").is_err());
        assert!(store.put("", b"x").is_err());
    }
}
