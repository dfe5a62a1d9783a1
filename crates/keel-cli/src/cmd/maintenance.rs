use std::time::Duration;

use chrono::{DateTime, Utc};

use keel_core::config::{parse_human_duration, KeelConfig};
use keel_core::maintenance::params::{load_state, update_params};
use keel_core::maintenance::{self, CycleParams, Mode, RunOptions, SafetyParameters};
use keel_core::platform::user_at_host;

use super::{open_repository, CmdResult};

pub(crate) struct RepoArgs<'a> {
    pub path: Option<&'a str>,
    pub password: Option<&'a str>,
}

pub(crate) struct SetArgs {
    pub owner: Option<String>,
    pub enable_quick: Option<bool>,
    pub enable_full: Option<bool>,
    pub quick_interval: Option<String>,
    pub full_interval: Option<String>,
}

/// Identity of this user: the configured owner, else `user@host`.
fn caller(config: Option<&KeelConfig>) -> String {
    config
        .and_then(|c| c.maintenance.owner.clone())
        .unwrap_or_else(user_at_host)
}

pub(crate) fn run_run(
    config: Option<&KeelConfig>,
    repo_args: RepoArgs<'_>,
    full: bool,
    force: bool,
    safety: &str,
) -> CmdResult {
    let safety = SafetyParameters::parse(safety)?;
    let repo = open_repository(config, repo_args.path, repo_args.password)?;

    let mut opts = RunOptions::new(if full { Mode::Full } else { Mode::Quick });
    opts.force = force;
    opts.safety = safety;
    opts.caller = Some(caller(config));
    let stats = maintenance::run(&repo, &opts)?;

    println!("Maintenance ({}) complete", opts.mode);
    println!(
        "  index blobs: {} read, {} written, {} deleted",
        stats.index_blobs_read, stats.index_blobs_written, stats.index_blobs_deleted,
    );
    if opts.mode == Mode::Full {
        println!("  contents dropped: {}", stats.contents_dropped);
        println!(
            "  pack blobs deleted: {} ({} bytes reclaimed)",
            stats.pack_blobs_deleted, stats.bytes_reclaimed,
        );
        println!("  retention extended: {}", stats.blobs_retention_extended);
        println!("  stale sessions removed: {}", stats.sessions_cleaned);
    }
    Ok(())
}

fn parse_interval(raw: Option<&str>) -> CmdResult<Option<Duration>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let interval = parse_human_duration(raw)?;
    if interval.is_zero() {
        return Err(format!("interval must be positive: '{raw}'").into());
    }
    Ok(Some(interval))
}

fn apply_cycle(cycle: &mut CycleParams, enable: Option<bool>, interval: Option<Duration>) {
    if let Some(enabled) = enable {
        cycle.enabled = enabled;
    }
    if let Some(interval) = interval {
        cycle.interval_secs = interval.as_secs();
    }
}

pub(crate) fn run_set(
    config: Option<&KeelConfig>,
    repo_args: RepoArgs<'_>,
    args: SetArgs,
) -> CmdResult {
    // Parse everything before touching the repository.
    let owner = match args.owner.as_deref() {
        None => None,
        Some("me") => Some(caller(config)),
        Some(other) if other.contains('@') => Some(other.to_string()),
        Some(other) => {
            return Err(format!("invalid owner '{other}' (expected 'me' or user@host)").into())
        }
    };
    let quick_interval = parse_interval(args.quick_interval.as_deref())?;
    let full_interval = parse_interval(args.full_interval.as_deref())?;

    let repo = open_repository(config, repo_args.path, repo_args.password)?;
    let params = update_params(repo.encryption_manager(), |p| {
        if let Some(owner) = owner {
            p.owner = owner;
        }
        apply_cycle(&mut p.quick_cycle, args.enable_quick, quick_interval);
        apply_cycle(&mut p.full_cycle, args.enable_full, full_interval);
    })?;
    println!("Owner: {}", params.owner);
    println!("Quick cycle: {}", describe_cycle(&params.quick_cycle));
    println!("Full cycle:  {}", describe_cycle(&params.full_cycle));
    Ok(())
}

pub(crate) fn run_info(config: Option<&KeelConfig>, repo_args: RepoArgs<'_>) -> CmdResult {
    let repo = open_repository(config, repo_args.path, repo_args.password)?;
    let state = load_state(repo.encryption_manager())?;
    let now = repo.now();

    println!("Owner: {}", state.params.owner);
    for mode in [Mode::Quick, Mode::Full] {
        let cycle = state.params.cycle(mode);
        println!("{mode} cycle: {}", describe_cycle(cycle));
        if cycle.enabled {
            let next = state
                .schedule
                .next_run(mode)
                .map(format_time)
                .unwrap_or_else(|| "now".into());
            println!("  next run: {next}");
        }
    }
    match state.due(now) {
        Some(mode) => println!("Due now: {mode}"),
        None => println!("Due now: nothing"),
    }

    println!("Recent runs:");
    if state.schedule.runs.is_empty() {
        println!("  (none)");
    }
    for (task, runs) in &state.schedule.runs {
        for run in runs {
            let outcome = match (run.success, &run.error) {
                (true, _) => "ok".to_string(),
                (false, Some(e)) => format!("failed: {e}"),
                (false, None) => "failed".to_string(),
            };
            println!(
                "  {task:<6} {} ({}s) {outcome}",
                format_time(run.start),
                (run.end - run.start).num_seconds(),
            );
        }
    }
    Ok(())
}

fn describe_cycle(cycle: &CycleParams) -> String {
    if cycle.enabled {
        format!("enabled, every {}", format_interval(cycle.interval()))
    } else {
        "disabled".to_string()
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Largest unit that divides the interval exactly.
fn format_interval(d: Duration) -> String {
    let secs = d.as_secs();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs >= size && secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}
