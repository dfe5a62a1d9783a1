use keel_core::config::KeelConfig;

use super::{open_storage, repo_path, CmdResult};

pub(crate) fn run_list(config: Option<&KeelConfig>, path: Option<&str>, prefix: &str) -> CmdResult {
    let storage = open_storage(config, repo_path(config, path)?)?;
    let mut count = 0usize;
    let mut total = 0u64;
    for bm in storage.list(prefix)? {
        println!(
            "{} {} {}",
            bm.blob_id,
            bm.length,
            bm.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
        );
        count += 1;
        total += bm.length;
    }
    tracing::info!(count, total_bytes = total, prefix, "listed blobs");
    Ok(())
}
