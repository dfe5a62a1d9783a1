//! Background maintenance loop.
//!
//! The scheduler owns its own mutex; callers never hold it across a run. A
//! failed run pushes the next attempt out by a penalty, and triggers arriving
//! inside the penalty window are ignored.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use keel_storage::memory::Clock;
use keel_types::blob::MAINTENANCE_BLOB_ID;
use keel_types::error::{KeelError, Result};

use super::params;
use super::run::{self, RunOptions};
use super::safety::SafetyParameters;
use crate::repo::Repository;

/// Upper bound on one idle wait, so schedule changes made elsewhere are
/// picked up.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Something the scheduler can maintain.
pub trait MaintenanceTarget: Send + Sync {
    /// When maintenance is next due; `None` when it is disabled.
    fn next_due(&self) -> Result<Option<DateTime<Utc>>>;

    fn run_maintenance(&self) -> Result<()>;
}

#[derive(Default)]
struct SchedulerState {
    next_no_earlier_than: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    triggered: bool,
    stopped: bool,
    runs: usize,
    last_error: Option<String>,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MaintenanceScheduler {
    shared: Arc<Shared>,
    clock: Clock,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    /// Spawn the maintenance thread. `penalty` is the delay imposed after a
    /// failed run.
    pub fn start(target: Arc<dyn MaintenanceTarget>, penalty: Duration, clock: Clock) -> Result<Self> {
        let penalty = chrono::Duration::from_std(penalty)
            .map_err(|e| KeelError::InvalidConfig(format!("maintenance penalty: {e}")))?;
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
        });
        let handle = std::thread::Builder::new()
            .name("keel-maintenance".into())
            .spawn({
                let shared = Arc::clone(&shared);
                let clock = Arc::clone(&clock);
                move || run_loop(&shared, target.as_ref(), penalty, &clock)
            })?;
        Ok(Self {
            shared,
            clock,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Request a run now. Returns false if the request was ignored because a
    /// failure penalty is in effect or the scheduler is stopped.
    pub fn trigger(&self) -> bool {
        let now = (self.clock)();
        let mut state = self.shared.lock();
        if state.stopped {
            return false;
        }
        if let Some(not_before) = state.next_no_earlier_than {
            if now < not_before {
                debug!(%not_before, "maintenance trigger ignored during failure penalty");
                return false;
            }
        }
        state.triggered = true;
        self.shared.wake.notify_all();
        true
    }

    /// Next planned run, as last computed by the maintenance thread.
    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().next_run
    }

    /// Completed runs, successful or not.
    pub fn run_count(&self) -> usize {
        self.shared.lock().runs
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Block until at least `runs` runs completed or `timeout` elapsed.
    pub fn wait_for_runs(&self, runs: usize, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .wake
            .wait_timeout_while(state, timeout, |s| s.runs < runs && !s.stopped)
            .unwrap_or_else(|e| e.into_inner());
        state.runs >= runs
    }

    /// Stop the loop and wait for an in-progress run to finish.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            state.stopped = true;
            self.shared.wake.notify_all();
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: &Shared, target: &dyn MaintenanceTarget, penalty: chrono::Duration, clock: &Clock) {
    loop {
        let due = match target.next_due() {
            Ok(due) => due,
            Err(e) => {
                warn!("cannot determine next maintenance time: {e}");
                Some(clock() + penalty)
            }
        };

        let mut state = shared.lock();
        if state.stopped {
            return;
        }
        let now = clock();
        let next = due.map(|d| match state.next_no_earlier_than {
            Some(not_before) if not_before > d => not_before,
            _ => d,
        });
        state.next_run = next;

        let run_now = state.triggered || next.is_some_and(|t| t <= now);
        if !run_now {
            let wait = next
                .and_then(|t| (t - now).to_std().ok())
                .map_or(IDLE_WAIT, |d| d.min(IDLE_WAIT));
            let _unused = shared
                .wake
                .wait_timeout(state, wait)
                .unwrap_or_else(|e| e.into_inner());
            continue;
        }
        state.triggered = false;
        drop(state);

        debug!("running scheduled maintenance");
        let result = target.run_maintenance();

        let mut state = shared.lock();
        match result {
            Ok(()) => {
                state.next_no_earlier_than = None;
                state.last_error = None;
            }
            Err(e) => {
                let not_before = clock() + penalty;
                warn!(%not_before, "scheduled maintenance failed: {e}");
                state.next_no_earlier_than = Some(not_before);
                state.last_error = Some(e.to_string());
            }
        }
        state.runs += 1;
        shared.wake.notify_all();
    }
}

/// Maintains an opened repository according to its stored schedule.
pub struct RepositoryMaintenance {
    repo: Arc<Repository>,
    safety: SafetyParameters,
}

impl RepositoryMaintenance {
    pub fn new(repo: Arc<Repository>, safety: SafetyParameters) -> Self {
        Self { repo, safety }
    }
}

impl RepositoryMaintenance {
    /// The schedule is rewritten by other processes too, so it is never
    /// served from the cache.
    fn load_state(&self) -> Result<params::MaintenanceState> {
        let mgr = self.repo.encryption_manager();
        mgr.invalidate(&[MAINTENANCE_BLOB_ID]);
        params::load_state(mgr)
    }
}

impl MaintenanceTarget for RepositoryMaintenance {
    fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.load_state()?.next_due(self.repo.now()))
    }

    fn run_maintenance(&self) -> Result<()> {
        let state = self.load_state()?;
        let Some(mode) = state.due(self.repo.now()) else {
            debug!("no maintenance cycle due");
            return Ok(());
        };
        let mut opts = RunOptions::new(mode);
        opts.safety = self.safety.clone();
        let stats = run::run(&self.repo, &opts)?;
        info!(%mode, ?stats, "scheduled maintenance complete");
        Ok(())
    }
}
