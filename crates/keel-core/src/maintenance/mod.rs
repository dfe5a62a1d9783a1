//! Index compaction and garbage collection, gated by ownership and safety
//! parameters, run on demand or by [`scheduler::MaintenanceScheduler`].

pub mod params;
pub mod run;
pub mod safety;
pub mod scheduler;

pub use params::{CycleParams, MaintenanceParams, MaintenanceState, RunInfo, Schedule};
pub use run::{run, MaintenanceStats, Mode, RunOptions};
pub use safety::SafetyParameters;
pub use scheduler::{MaintenanceScheduler, MaintenanceTarget, RepositoryMaintenance};
