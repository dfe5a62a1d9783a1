use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "keel",
    version,
    about = "Encrypted content-addressed blob repositories",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $KEEL_CONFIG                (environment variable)
  3. ./keel.yaml                 (working directory)

Environment variables:
  KEEL_CONFIG                    Path to configuration file
  KEEL_PASSWORD                  Repository passphrase
  KEEL_ENABLE_CLOCK_SKEW_CHECK   Refuse to write when the local clock is off"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides KEEL_CONFIG and ./keel.yaml)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Repository management
    Repo {
        #[command(subcommand)]
        action: RepoCommand,
    },

    /// Low-level blob access
    Blob {
        #[command(subcommand)]
        action: BlobCommand,
    },

    /// Index compaction and garbage collection
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum RepoCommand {
    /// Create a new repository in an empty directory
    Create {
        /// Repository directory
        #[arg(long)]
        path: String,

        /// Passphrase (falls back to KEEL_PASSWORD, then the config file)
        #[arg(long)]
        password: Option<String>,

        /// AEAD algorithm: auto, AES256-GCM, CHACHA20-POLY1305 or NONE
        #[arg(long, default_value = "AES256-GCM")]
        encryption: String,

        /// Key derivation cost (standard, light)
        #[arg(long, default_value = "standard", hide = true)]
        kdf: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum BlobCommand {
    /// List blobs
    List {
        /// Repository directory (overrides the config file)
        #[arg(long)]
        path: Option<String>,

        /// Only list blobs whose ID starts with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Physical blob layout
    Shards {
        #[command(subcommand)]
        action: ShardsCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum ShardsCommand {
    /// Change the shard parameters and move every blob file accordingly
    Modify {
        /// Repository directory
        #[arg(long)]
        path: String,

        /// Default shard lengths, e.g. "1,3", or "flat"
        #[arg(long)]
        default_shards: Option<String>,

        /// Per-prefix shard lengths, e.g. "kee=2,2" (repeatable)
        #[arg(long = "override")]
        overrides: Vec<String>,

        /// Remove the override for a prefix (repeatable)
        #[arg(long = "remove-override")]
        remove_overrides: Vec<String>,

        /// IDs up to this length are stored unsharded
        #[arg(long, allow_negative_numbers = true)]
        unsharded_length: Option<i64>,

        /// Report the moves without touching anything
        #[arg(long)]
        dry_run: bool,

        /// Required: confirm that no other keel process uses the repository
        #[arg(long = "i-am-sure-keel-is-not-running")]
        i_am_sure: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum MaintenanceCommand {
    /// Run a maintenance cycle now
    Run {
        /// Repository directory (overrides the config file)
        #[arg(long)]
        path: Option<String>,

        /// Passphrase (falls back to KEEL_PASSWORD, then the config file)
        #[arg(long)]
        password: Option<String>,

        /// Run the full cycle instead of the quick one
        #[arg(long)]
        full: bool,

        /// Run even when this user is not the maintenance owner
        #[arg(long)]
        force: bool,

        /// Safety level: full or none
        #[arg(long, default_value = "full")]
        safety: String,
    },

    /// Change maintenance ownership and schedule
    Set {
        /// Repository directory (overrides the config file)
        #[arg(long)]
        path: Option<String>,

        /// Passphrase (falls back to KEEL_PASSWORD, then the config file)
        #[arg(long)]
        password: Option<String>,

        /// New owner: "me" or user@host
        #[arg(long)]
        owner: Option<String>,

        /// Enable or disable the quick cycle
        #[arg(long)]
        enable_quick: Option<bool>,

        /// Enable or disable the full cycle
        #[arg(long)]
        enable_full: Option<bool>,

        /// Quick cycle interval, e.g. "1h"
        #[arg(long)]
        quick_interval: Option<String>,

        /// Full cycle interval, e.g. "1d"
        #[arg(long)]
        full_interval: Option<String>,
    },

    /// Show maintenance ownership, schedule and recent runs
    Info {
        /// Repository directory (overrides the config file)
        #[arg(long)]
        path: Option<String>,

        /// Passphrase (falls back to KEEL_PASSWORD, then the config file)
        #[arg(long)]
        password: Option<String>,
    },
}
