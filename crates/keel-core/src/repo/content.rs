//! Contents packed into pack blobs and the write sessions that produce them.

use std::collections::HashSet;

use rand::RngCore;
use tracing::{debug, info};

use keel_types::blob::{BlobId, PACK_DATA_PREFIX, PACK_METADATA_PREFIX, SESSION_BLOB_PREFIX};
use keel_types::content_id::ContentId;
use keel_types::error::{KeelError, Result};

use super::session::{self, generate_session_id, SessionId, SessionInfo};
use super::Repository;
use crate::index::{ContentInfo, IndexBuilder};
use crate::platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// File data, stored in `p` packs.
    Data,
    /// Repository metadata, stored in `q` packs.
    Metadata,
}

impl ContentKind {
    pub fn pack_prefix(self) -> &'static str {
        match self {
            ContentKind::Data => PACK_DATA_PREFIX,
            ContentKind::Metadata => PACK_METADATA_PREFIX,
        }
    }
}

struct PackBuffer {
    blob_id: BlobId,
    data: Vec<u8>,
    /// (content, offset, length) of every content in `data`.
    entries: Vec<(ContentId, u64, u64)>,
}

impl PackBuffer {
    fn new(kind: ContentKind, session: &SessionId) -> Self {
        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);
        Self {
            blob_id: BlobId::new(format!(
                "{}{}-{}",
                kind.pack_prefix(),
                hex::encode(random),
                session
            )),
            data: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// A single writer's view of the repository.
///
/// Contents are buffered into pack blobs; [`flush`](Self::flush) uploads the
/// packs, then an index blob describing them, then refreshes the session
/// marker. Nothing written becomes visible to other readers before `flush`.
pub struct WriteSession<'r> {
    repo: &'r Repository,
    info: SessionInfo,
    data_pack: PackBuffer,
    metadata_pack: PackBuffer,
    /// Entries not yet written to an index blob.
    pending: IndexBuilder,
    /// Index as loaded at session start plus everything this session flushed.
    committed: IndexBuilder,
    packs_written: HashSet<BlobId>,
}

impl<'r> WriteSession<'r> {
    pub(super) fn start(repo: &'r Repository) -> Result<Self> {
        let now = repo.now();
        let id = generate_session_id(now);
        let info = SessionInfo::new(id, now, &platform::username(), &platform::hostname());
        session::write_session_marker(repo.encryption_manager(), &info, repo.clock_skew_check(), now)?;
        debug!(session = %info.id, "started write session");
        let committed = repo.indexes().load_index()?;
        Ok(Self {
            repo,
            data_pack: PackBuffer::new(ContentKind::Data, &info.id),
            metadata_pack: PackBuffer::new(ContentKind::Metadata, &info.id),
            info,
            pending: IndexBuilder::new(),
            committed,
            packs_written: HashSet::new(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.info.id
    }

    fn live_entry(&self, id: &ContentId) -> Option<&ContentInfo> {
        self.pending
            .get(id)
            .or_else(|| self.committed.get(id))
            .filter(|info| !info.deleted)
    }

    fn buffer(&mut self, kind: ContentKind) -> &mut PackBuffer {
        match kind {
            ContentKind::Data => &mut self.data_pack,
            ContentKind::Metadata => &mut self.metadata_pack,
        }
    }

    fn is_buffered(&self, id: &ContentId) -> bool {
        self.data_pack
            .entries
            .iter()
            .chain(self.metadata_pack.entries.iter())
            .any(|(c, _, _)| c == id)
    }

    /// Store `data` and return its content ID. Contents already present are
    /// not stored again.
    pub fn write_content(&mut self, data: &[u8], kind: ContentKind) -> Result<ContentId> {
        let crypter = self.repo.encryption_manager().crypter();
        let hash = crypter.hash_func().hash(data);
        let content_id = ContentId::from_hash(&hash);
        if self.live_entry(&content_id).is_some() || self.is_buffered(&content_id) {
            debug!(content = %content_id, "content already present");
            return Ok(content_id);
        }

        let ciphertext = crypter.encryptor().encrypt(data, &hash)?;
        let max_pack_size = self.repo.parameters().max_pack_size;
        let buffer = self.buffer(kind);
        let offset = buffer.data.len() as u64;
        buffer.data.extend_from_slice(&ciphertext);
        buffer
            .entries
            .push((content_id.clone(), offset, ciphertext.len() as u64));
        if buffer.data.len() as u64 >= max_pack_size {
            self.flush_pack(kind)?;
        }
        Ok(content_id)
    }

    /// Mark a content deleted. The entry keeps its pack location so that
    /// readers merging older index blobs still see the deletion win.
    pub fn delete_content(&mut self, id: &ContentId) -> Result<()> {
        if self.is_buffered(id) {
            // Written in this session but not uploaded; flush so the
            // tombstone has a pack location to point at.
            self.flush_packs()?;
        }
        let current = self
            .pending
            .get(id)
            .or_else(|| self.committed.get(id))
            .cloned()
            .ok_or_else(|| KeelError::NotFound(format!("content {id}")))?;
        if current.deleted {
            return Ok(());
        }
        let now = self.repo.now().timestamp();
        self.pending.add(ContentInfo {
            timestamp: now.max(current.timestamp),
            deleted: true,
            ..current
        });
        Ok(())
    }

    fn flush_pack(&mut self, kind: ContentKind) -> Result<()> {
        let session_id = self.info.id.clone();
        let buffer = std::mem::replace(self.buffer(kind), PackBuffer::new(kind, &session_id));
        if buffer.entries.is_empty() {
            return Ok(());
        }
        let opts = self.repo.blob_storage_config()?.put_options();
        self.repo
            .storage()
            .put_with_options(buffer.blob_id.as_str(), &buffer.data, &opts)?;
        debug!(pack = %buffer.blob_id, contents = buffer.entries.len(), "wrote pack blob");

        let now = self.repo.now().timestamp();
        for (content_id, offset, length) in buffer.entries {
            self.pending.add(ContentInfo {
                content_id,
                pack_blob_id: buffer.blob_id.clone(),
                pack_offset: offset,
                packed_length: length,
                timestamp: now,
                deleted: false,
            });
        }
        self.packs_written.insert(buffer.blob_id);
        Ok(())
    }

    fn flush_packs(&mut self) -> Result<()> {
        self.flush_pack(ContentKind::Data)?;
        self.flush_pack(ContentKind::Metadata)
    }

    /// Upload buffered packs and pending index entries, then refresh the
    /// session marker.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_packs()?;
        if !self.pending.is_empty() {
            self.repo
                .indexes()
                .write_index_blob(&self.pending, Some(&self.info.id))?;
            let flushed = std::mem::take(&mut self.pending);
            self.committed.merge(flushed);
        }
        let now = self.repo.now();
        self.info.checkpoint_time = now;
        session::write_session_marker(
            self.repo.encryption_manager(),
            &self.info,
            self.repo.clock_skew_check(),
            now,
        )?;
        Ok(())
    }

    /// Flush and remove this session's markers.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        let storage = self.repo.storage();
        let mut removed = Vec::new();
        for meta in storage.list(SESSION_BLOB_PREFIX)? {
            if session::session_id_from_blob_id(meta.blob_id.as_str()) == self.info.id.as_str() {
                storage.delete(meta.blob_id.as_str())?;
                removed.push(meta.blob_id);
            }
        }
        self.repo
            .encryption_manager()
            .invalidate(&removed.iter().map(BlobId::as_str).collect::<Vec<_>>());
        info!(
            session = %self.info.id,
            packs = self.packs_written.len(),
            "closed write session"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_repo;
    use keel_storage::StorageBackend;

    #[test]
    fn write_flush_read() {
        let (_store, repo) = test_repo();
        let mut session = repo.new_write_session().unwrap();
        let a = session.write_content(b"alpha", ContentKind::Data).unwrap();
        let b = session.write_content(b"beta", ContentKind::Metadata).unwrap();
        // Invisible before flush.
        assert!(repo.read_content(&a).unwrap_err().is_not_found());
        session.flush().unwrap();

        assert_eq!(repo.read_content(&a).unwrap(), b"alpha");
        assert_eq!(repo.read_content(&b).unwrap(), b"beta");
        let info = repo.content_info(&a).unwrap();
        assert!(info.pack_blob_id.as_str().starts_with('p'));
        assert!(info.pack_blob_id.as_str().ends_with(session.id().as_str()));
        assert!(repo.content_info(&b).unwrap().pack_blob_id.has_prefix("q"));
        session.close().unwrap();
    }

    #[test]
    fn duplicate_content_is_stored_once() {
        let (store, repo) = test_repo();
        let packs_before = store.list("p").unwrap().len();
        let mut session = repo.new_write_session().unwrap();
        let a = session.write_content(b"same", ContentKind::Data).unwrap();
        let b = session.write_content(b"same", ContentKind::Data).unwrap();
        assert_eq!(a, b);
        session.close().unwrap();

        let mut again = repo.new_write_session().unwrap();
        again.write_content(b"same", ContentKind::Data).unwrap();
        again.close().unwrap();
        assert_eq!(store.list("p").unwrap().len(), packs_before + 1);
    }

    #[test]
    fn delete_hides_content() {
        let (_store, repo) = test_repo();
        let mut session = repo.new_write_session().unwrap();
        let a = session.write_content(b"doomed", ContentKind::Data).unwrap();
        session.delete_content(&a).unwrap();
        session.flush().unwrap();
        assert!(repo.read_content(&a).unwrap_err().is_not_found());
        assert!(repo.content_info(&a).unwrap().deleted);

        let missing = ContentId::from_hash(&[0u8; 32]);
        assert!(session.delete_content(&missing).unwrap_err().is_not_found());
        session.close().unwrap();
    }

    #[test]
    fn close_removes_session_markers() {
        let (store, repo) = test_repo();
        let session = repo.new_write_session().unwrap();
        let id = session.id().clone();
        assert!(store
            .list("s")
            .unwrap()
            .iter()
            .any(|m| m.blob_id.as_str().ends_with(id.as_str())));
        session.close().unwrap();
        assert!(!store
            .list("s")
            .unwrap()
            .iter()
            .any(|m| m.blob_id.as_str().ends_with(id.as_str())));
    }

    #[test]
    fn tampered_pack_is_corruption() {
        let (store, repo) = test_repo();
        let mut session = repo.new_write_session().unwrap();
        let a = session.write_content(b"precious", ContentKind::Data).unwrap();
        session.close().unwrap();

        let info = repo.content_info(&a).unwrap();
        let mut pack = store.get(info.pack_blob_id.as_str()).unwrap().unwrap();
        pack[info.pack_offset as usize] ^= 0xff;
        store.put(info.pack_blob_id.as_str(), &pack).unwrap();
        assert!(repo.read_content(&a).unwrap_err().is_corruption());
    }
}
