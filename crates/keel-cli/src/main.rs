mod cli;
mod cmd;

use std::path::Path;

use clap::Parser;

use keel_core::config::{self, KeelConfig};

use cli::{BlobCommand, Cli, Commands, MaintenanceCommand, RepoCommand, ShardsCommand};
use cmd::maintenance::{RepoArgs, SetArgs};
use cmd::shards::ModifyArgs;
use cmd::CmdResult;

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// The config file is optional; every command also accepts an explicit path.
fn load_config(explicit: Option<&str>) -> CmdResult<Option<KeelConfig>> {
    match config::resolve_config_path(explicit.map(Path::new)) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            Ok(Some(config::load_config(&path)?))
        }
        None => Ok(None),
    }
}

fn run(cli: Cli) -> CmdResult {
    let cfg = load_config(cli.config.as_deref())?;
    let cfg = cfg.as_ref();

    match cli.command {
        Commands::Repo {
            action:
                RepoCommand::Create {
                    path,
                    password,
                    encryption,
                    kdf,
                },
        } => cmd::repo::run_create(cfg, &path, password.as_deref(), &encryption, &kdf),

        Commands::Blob { action } => match action {
            BlobCommand::List { path, prefix } => {
                cmd::blob::run_list(cfg, path.as_deref(), &prefix)
            }
            BlobCommand::Shards {
                action:
                    ShardsCommand::Modify {
                        path,
                        default_shards,
                        overrides,
                        remove_overrides,
                        unsharded_length,
                        dry_run,
                        i_am_sure,
                    },
            } => cmd::shards::run_modify(ModifyArgs {
                path,
                default_shards,
                overrides,
                remove_overrides,
                unsharded_length,
                dry_run,
                i_am_sure,
            }),
        },

        Commands::Maintenance { action } => match action {
            MaintenanceCommand::Run {
                path,
                password,
                full,
                force,
                safety,
            } => cmd::maintenance::run_run(
                cfg,
                RepoArgs {
                    path: path.as_deref(),
                    password: password.as_deref(),
                },
                full,
                force,
                &safety,
            ),
            MaintenanceCommand::Set {
                path,
                password,
                owner,
                enable_quick,
                enable_full,
                quick_interval,
                full_interval,
            } => cmd::maintenance::run_set(
                cfg,
                RepoArgs {
                    path: path.as_deref(),
                    password: password.as_deref(),
                },
                SetArgs {
                    owner,
                    enable_quick,
                    enable_full,
                    quick_interval,
                    full_interval,
                },
            ),
            MaintenanceCommand::Info { path, password } => cmd::maintenance::run_info(
                cfg,
                RepoArgs {
                    path: path.as_deref(),
                    password: password.as_deref(),
                },
            ),
        },
    }
}
