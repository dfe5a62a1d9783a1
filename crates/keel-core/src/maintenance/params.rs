//! Maintenance parameters and run history, persisted at `keel.maintenance`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_types::blob::MAINTENANCE_BLOB_ID;
use keel_types::error::{KeelError, Result};

use super::run::Mode;
use crate::repo::encrypted_blob::EncryptionManager;

/// Runs kept per task in the schedule history.
pub const MAX_RETAINED_RUNS: usize = 5;

pub const DEFAULT_QUICK_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_FULL_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleParams {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl CycleParams {
    pub fn enabled_every(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval_secs: interval.as_secs(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceParams {
    /// `user@host` allowed to run maintenance without `--force`.
    pub owner: String,
    pub quick_cycle: CycleParams,
    pub full_cycle: CycleParams,
}

impl MaintenanceParams {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            quick_cycle: CycleParams::enabled_every(DEFAULT_QUICK_INTERVAL),
            full_cycle: CycleParams::enabled_every(DEFAULT_FULL_INTERVAL),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.owner.contains('@') {
            return Err(KeelError::InvalidConfig(format!(
                "maintenance owner '{}' must be of the form user@host",
                self.owner
            )));
        }
        for (name, cycle) in [("quick", &self.quick_cycle), ("full", &self.full_cycle)] {
            if cycle.enabled && cycle.interval_secs == 0 {
                return Err(KeelError::InvalidConfig(format!(
                    "{name} maintenance interval must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn cycle(&self, mode: Mode) -> &CycleParams {
        match mode {
            Mode::Quick => &self.quick_cycle,
            Mode::Full => &self.full_cycle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub next_quick_run: Option<DateTime<Utc>>,
    pub next_full_run: Option<DateTime<Utc>>,
    /// Most recent runs per task, newest first.
    pub runs: BTreeMap<String, Vec<RunInfo>>,
}

impl Schedule {
    pub fn record_run(&mut self, task: &str, info: RunInfo) {
        let runs = self.runs.entry(task.to_string()).or_default();
        runs.insert(0, info);
        runs.truncate(MAX_RETAINED_RUNS);
    }

    pub fn last_run(&self, task: &str) -> Option<&RunInfo> {
        self.runs.get(task).and_then(|r| r.first())
    }

    pub fn next_run(&self, mode: Mode) -> Option<DateTime<Utc>> {
        match mode {
            Mode::Quick => self.next_quick_run,
            Mode::Full => self.next_full_run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceState {
    pub params: MaintenanceParams,
    #[serde(default)]
    pub schedule: Schedule,
}

impl MaintenanceState {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            params: MaintenanceParams::new(owner),
            schedule: Schedule::default(),
        }
    }

    /// Which cycle is due at `now`, full taking precedence. A cycle that has
    /// never run is due immediately.
    pub fn due(&self, now: DateTime<Utc>) -> Option<Mode> {
        [Mode::Full, Mode::Quick].into_iter().find(|&mode| {
            self.params.cycle(mode).enabled
                && self.schedule.next_run(mode).map_or(true, |next| next <= now)
        })
    }

    /// Earliest time an enabled cycle becomes due, `None` when both are off.
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [Mode::Full, Mode::Quick]
            .into_iter()
            .filter(|&mode| self.params.cycle(mode).enabled)
            .map(|mode| self.schedule.next_run(mode).unwrap_or(now))
            .min()
    }
}

pub fn load_state(mgr: &EncryptionManager) -> Result<MaintenanceState> {
    let raw = mgr.read_fixed_blob(MAINTENANCE_BLOB_ID)?;
    Ok(rmp_serde::from_slice(&raw)?)
}

pub fn save_state(mgr: &EncryptionManager, state: &MaintenanceState) -> Result<()> {
    state.params.validate()?;
    mgr.write_fixed_blob(MAINTENANCE_BLOB_ID, &rmp_serde::to_vec_named(state)?)
}

/// Apply `update` to the stored parameters and persist them if valid.
pub fn update_params(
    mgr: &EncryptionManager,
    update: impl FnOnce(&mut MaintenanceParams),
) -> Result<MaintenanceParams> {
    let mut state = load_state(mgr)?;
    update(&mut state.params);
    save_state(mgr, &state)?;
    Ok(state.params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_at(secs: i64) -> RunInfo {
        let t = DateTime::from_timestamp(secs, 0).unwrap();
        RunInfo {
            start: t,
            end: t,
            success: true,
            error: None,
        }
    }

    #[test]
    fn history_keeps_newest_runs() {
        let mut schedule = Schedule::default();
        for i in 0..8 {
            schedule.record_run("full", run_at(i));
        }
        let runs = &schedule.runs["full"];
        assert_eq!(runs.len(), MAX_RETAINED_RUNS);
        assert_eq!(runs[0].start.timestamp(), 7);
        assert_eq!(schedule.last_run("full").unwrap().start.timestamp(), 7);
        assert!(schedule.last_run("quick").is_none());
    }

    #[test]
    fn due_prefers_full_and_respects_enabled() {
        let now = Utc::now();
        let mut state = MaintenanceState::new("u@h");
        assert_eq!(state.due(now), Some(Mode::Full));

        state.schedule.next_full_run = Some(now + chrono::Duration::hours(1));
        assert_eq!(state.due(now), Some(Mode::Quick));
        assert_eq!(state.next_due(now), Some(now));

        state.schedule.next_quick_run = Some(now + chrono::Duration::minutes(5));
        assert_eq!(state.due(now), None);
        assert_eq!(state.next_due(now), state.schedule.next_quick_run);

        state.params.quick_cycle.enabled = false;
        state.params.full_cycle.enabled = false;
        assert_eq!(state.next_due(now), None);
    }

    #[test]
    fn params_validation() {
        assert!(MaintenanceParams::new("nobody").validate().is_err());
        let mut p = MaintenanceParams::new("u@h");
        p.validate().unwrap();
        p.quick_cycle.interval_secs = 0;
        assert!(p.validate().is_err());
        p.quick_cycle.enabled = false;
        p.validate().unwrap();
    }
}
