use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use keel_crypto::aes_gcm::Aes256GcmEncryptor;
use keel_crypto::hashing::KeyedBlake2b;
use keel_crypto::key::KdfCost;
use keel_crypto::{Crypter, StaticCrypter};
use keel_storage::memory::Clock;
use keel_storage::{MemoryBackend, StorageBackend};
use keel_types::blob::{BlobMetadata, PutOptions};
use keel_types::error::{KeelError, Result};

use crate::repo::{OpenOptions, Repository, RepositoryOptions};

pub const TEST_PASSPHRASE: &str = "correct horse battery staple";

pub fn test_crypter() -> Arc<dyn Crypter> {
    Arc::new(StaticCrypter {
        hash: Box::new(KeyedBlake2b::new(&[0x5A; 32])),
        encryption: Box::new(Aes256GcmEncryptor::new(&[0xC3; 32])),
    })
}

pub fn test_open_options() -> OpenOptions {
    OpenOptions {
        cache_size: 16,
        clock_skew_check: false,
        clock: None,
    }
}

fn test_repo_options(clock: Option<Clock>) -> RepositoryOptions {
    RepositoryOptions {
        kdf_cost: KdfCost::LIGHT,
        open: OpenOptions {
            clock,
            ..test_open_options()
        },
        ..Default::default()
    }
}

/// Fresh repository over an in-memory store with a cheap KDF.
pub fn test_repo() -> (Arc<MemoryBackend>, Repository) {
    let store = Arc::new(MemoryBackend::new());
    let repo = Repository::create(store.clone(), TEST_PASSPHRASE, test_repo_options(None))
        .unwrap_or_else(|e| panic!("create test repo: {e}"));
    (store, repo)
}

/// Like [`test_repo`], with the store and the repository sharing `clock`.
pub fn test_repo_with_clock(clock: &TestClock) -> (Arc<MemoryBackend>, Repository) {
    let store = Arc::new(MemoryBackend::with_clock(clock.clock()));
    let repo = test_repo_over(store.clone(), clock);
    (store, repo)
}

/// Fresh repository over `store`, reading time from `clock`.
pub fn test_repo_over(store: Arc<dyn StorageBackend>, clock: &TestClock) -> Repository {
    Repository::create(store, TEST_PASSPHRASE, test_repo_options(Some(clock.clock())))
        .unwrap_or_else(|e| panic!("create test repo: {e}"))
}

/// Manually advanced clock.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn clock(&self) -> Clock {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock().unwrap())
    }
}

type ErrorFactory = Box<dyn Fn() -> KeelError + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultOp {
    Put,
    Delete,
    ExtendRetention,
}

struct Fault {
    op: FaultOp,
    /// Matches every blob ID containing this string; empty matches all.
    pattern: String,
    make: ErrorFactory,
}

/// Memory backend with injectable failures per operation and blob ID.
pub struct FaultyBackend {
    inner: MemoryBackend,
    faults: Mutex<Vec<Fault>>,
}

impl FaultyBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, op: FaultOp, pattern: &str, make: ErrorFactory) {
        self.faults.lock().unwrap().push(Fault {
            op,
            pattern: pattern.to_string(),
            make,
        });
    }

    pub fn fail_puts_with(&self, make: impl Fn() -> KeelError + Send + Sync + 'static) {
        self.add(FaultOp::Put, "", Box::new(make));
    }

    /// Fail deletes of blobs whose ID contains `pattern`.
    pub fn fail_deletes_with(
        &self,
        pattern: &str,
        make: impl Fn() -> KeelError + Send + Sync + 'static,
    ) {
        self.add(FaultOp::Delete, pattern, Box::new(make));
    }

    pub fn fail_retention_with(
        &self,
        pattern: &str,
        make: impl Fn() -> KeelError + Send + Sync + 'static,
    ) {
        self.add(FaultOp::ExtendRetention, pattern, Box::new(make));
    }

    pub fn clear_failures(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn injected(&self, op: FaultOp, id: &str) -> Option<KeelError> {
        self.faults
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.op == op && id.contains(f.pattern.as_str()))
            .map(|f| (f.make)())
    }
}

impl StorageBackend for FaultyBackend {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(id)
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(id, offset, length)
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        match self.injected(FaultOp::Put, id) {
            Some(e) => Err(e),
            None => self.inner.put(id, data),
        }
    }

    fn put_with_options(&self, id: &str, data: &[u8], opts: &PutOptions) -> Result<()> {
        match self.injected(FaultOp::Put, id) {
            Some(e) => Err(e),
            None => self.inner.put_with_options(id, data, opts),
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        match self.injected(FaultOp::Delete, id) {
            Some(e) => Err(e),
            None => self.inner.delete(id),
        }
    }

    fn list_blobs(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        self.inner.list_blobs(prefix, callback)
    }

    fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>> {
        self.inner.get_metadata(id)
    }

    fn extend_retention(&self, id: &str, opts: &PutOptions) -> Result<()> {
        match self.injected(FaultOp::ExtendRetention, id) {
            Some(e) => Err(e),
            None => self.inner.extend_retention(id, opts),
        }
    }

    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
    }
}
