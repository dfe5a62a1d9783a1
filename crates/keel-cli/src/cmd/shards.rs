use std::path::Path;

use keel_storage::reshard::modify_shards;
use keel_storage::sharded::ShardModification;

use super::CmdResult;

pub(crate) struct ModifyArgs {
    pub path: String,
    pub default_shards: Option<String>,
    pub overrides: Vec<String>,
    pub remove_overrides: Vec<String>,
    pub unsharded_length: Option<i64>,
    pub dry_run: bool,
    pub i_am_sure: bool,
}

pub(crate) fn run_modify(args: ModifyArgs) -> CmdResult {
    if !args.i_am_sure {
        return Err(
            "re-sharding moves every blob file; stop all keel processes using this repository \
             and pass --i-am-sure-keel-is-not-running"
                .into(),
        );
    }

    let request = ShardModification {
        default_shards: args.default_shards,
        unsharded_length: args.unsharded_length,
        overrides: args.overrides,
        remove_overrides: args.remove_overrides,
    };
    let report = modify_shards(Path::new(&args.path), &request, args.dry_run, None)?;

    if report.dry_run {
        println!(
            "Dry run: {} blobs, {} would be moved, {} unchanged",
            report.blobs_seen, report.blobs_moved, report.blobs_unchanged,
        );
    } else {
        println!(
            "Re-shard complete: {} blobs, {} moved, {} unchanged, {} empty directories removed",
            report.blobs_seen, report.blobs_moved, report.blobs_unchanged, report.dirs_removed,
        );
    }
    Ok(())
}
