use std::sync::Arc;

use keel_types::error::KeelError;

use crate::repo::session::MAX_CLOCK_SKEW;
use crate::repo::{OpenOptions, Repository};
use crate::testutil::{test_repo_with_clock, TestClock, TEST_PASSPHRASE};

fn open_with_local_offset(
    store: Arc<keel_storage::MemoryBackend>,
    local: &TestClock,
) -> Repository {
    Repository::open(
        store,
        TEST_PASSPHRASE,
        OpenOptions {
            cache_size: 0,
            clock_skew_check: true,
            clock: Some(local.clock()),
        },
    )
    .unwrap_or_else(|e| panic!("open: {e}"))
}

#[test]
fn skewed_writer_is_refused() {
    let store_clock = TestClock::new();
    let (store, _repo) = test_repo_with_clock(&store_clock);

    let local = TestClock::at(store_clock.now() + chrono::Duration::minutes(10));
    let repo = open_with_local_offset(store, &local);
    let err = repo.new_write_session().err().unwrap();
    assert!(matches!(err, KeelError::ClockSkew { .. }), "{err}");
}

#[test]
fn skew_at_bound_is_accepted() {
    let store_clock = TestClock::new();
    let (store, _repo) = test_repo_with_clock(&store_clock);

    let bound = chrono::Duration::from_std(MAX_CLOCK_SKEW).unwrap();
    let local = TestClock::at(store_clock.now() - bound);
    let repo = open_with_local_offset(store, &local);
    let session = repo.new_write_session().unwrap();
    session.close().unwrap();
}

#[test]
fn skew_ignored_when_check_disabled() {
    let store_clock = TestClock::new();
    let (store, _repo) = test_repo_with_clock(&store_clock);

    let local = TestClock::at(store_clock.now() + chrono::Duration::hours(3));
    let repo = Repository::open(
        store,
        TEST_PASSPHRASE,
        OpenOptions {
            cache_size: 0,
            clock_skew_check: false,
            clock: Some(local.clock()),
        },
    )
    .unwrap();
    repo.new_write_session().unwrap().close().unwrap();
}
