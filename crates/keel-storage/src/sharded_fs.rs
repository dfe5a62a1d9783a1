use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use keel_types::blob::{BlobId, BlobMetadata};
use keel_types::error::{KeelError, Result};

use crate::sharded::{blob_id_from_relative, temp_file_in, ShardParameters};
use crate::StorageBackend;

/// Filesystem blob store using the sharded layout described by the root's
/// `.shards` file.
pub struct ShardedFsBackend {
    root: PathBuf,
    params: ShardParameters,
}

impl ShardedFsBackend {
    /// Initialise a new store at `root` (created if needed) with `params`.
    pub fn create(root: &Path, params: ShardParameters) -> Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        params.save(&root)?;
        Ok(Self { root, params })
    }

    /// Open an existing store.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(KeelError::RepoNotFound(root.display().to_string()));
        }
        let root = fs::canonicalize(root)?;
        let params = ShardParameters::load(&root)?;
        Ok(Self { root, params })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn params(&self) -> &ShardParameters {
        &self.params
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        BlobId::new(id).validate()?;
        Ok(self.root.join(self.params.relative_path_for(id)))
    }

    /// Readers never observe a partial file: write to a temp file in the
    /// target directory, then rename into place.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = temp_file_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn metadata_for(id: BlobId, meta: &fs::Metadata) -> Result<BlobMetadata> {
    Ok(BlobMetadata {
        blob_id: id,
        length: meta.len(),
        timestamp: DateTime::<Utc>::from(meta.modified()?),
    })
}

/// Visit every complete blob file under `root` with its absolute path and
/// reconstructed ID. Temp files and `.shards` are skipped.
pub fn walk_blob_files(
    root: &Path,
    visit: &mut dyn FnMut(&Path, BlobId) -> Result<()>,
) -> Result<()> {
    walk_dir(root, root, visit)
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    visit: &mut dyn FnMut(&Path, BlobId) -> Result<()>,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // Removed concurrently, e.g. emptied by a re-shard.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut entries: Vec<_> = entries.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(root, &path, visit)?;
        } else if file_type.is_file() {
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            match blob_id_from_relative(rel) {
                Some(id) => visit(&path, id)?,
                None => debug!(path = %rel.display(), "skipping non-blob file"),
            }
        }
    }
    Ok(())
}

impl StorageBackend for ShardedFsBackend {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(id)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(id)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(length).read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(id)?;
        match self.atomic_write(&path, data) {
            Err(KeelError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.atomic_write(&path, data)
            }
            other => other,
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.resolve(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, id: &str) -> Result<bool> {
        let path = self.resolve(id)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_blobs(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        walk_blob_files(&self.root, &mut |path, id| {
            if !id.has_prefix(prefix) {
                return Ok(());
            }
            match fs::metadata(path) {
                Ok(meta) => callback(metadata_for(id, &meta)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>> {
        let path = self.resolve(id)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(metadata_for(BlobId::new(id), &meta)?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }
}
