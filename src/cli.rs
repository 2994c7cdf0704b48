use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::types::LogLevel;
use crate::upstream::wporg::{DEFAULT_CORE_URL, DEFAULT_PLUGINS_URL, DEFAULT_THEMES_URL};

#[derive(Parser, Debug)]
#[command(
    name = "wpmirror",
    version,
    about = "Mirror WordPress core, plugin and theme releases"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true, env = "WPMIRROR_LOG_LEVEL")]
    pub log_level: LogLevel,

    /// SQLite database shared by every wpmirror process
    #[arg(
        long,
        default_value = "~/.wpmirror/wpmirror.db",
        global = true,
        env = "WPMIRROR_DATABASE"
    )]
    pub database: String,

    /// Directory archives are written under
    #[arg(long, default_value = "./public", global = true, env = "WPMIRROR_ARTIFACT_ROOT")]
    pub artifact_root: String,

    /// Number of concurrent download workers
    #[arg(long, default_value_t = 5, global = true, env = "WPMIRROR_WORKERS")]
    pub workers: u16,

    /// Seconds between sync runs
    #[arg(long, default_value_t = 3600, global = true, env = "WPMIRROR_INTERVAL")]
    pub interval: u64,

    /// Seconds a sync lock stays valid if never released
    #[arg(long, default_value_t = 3900, global = true, env = "WPMIRROR_LEASE")]
    pub lease: u64,

    /// Milliseconds between queue polls for items pushed by other processes
    #[arg(long, default_value_t = 1000, global = true, env = "WPMIRROR_QUEUE_POLL_MS")]
    pub queue_poll_ms: u64,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 300, global = true, env = "WPMIRROR_HTTP_TIMEOUT")]
    pub http_timeout: u64,

    #[arg(long, default_value = DEFAULT_CORE_URL, global = true, env = "WPMIRROR_CORE_URL")]
    pub core_url: String,

    #[arg(long, default_value = DEFAULT_PLUGINS_URL, global = true, env = "WPMIRROR_PLUGINS_URL")]
    pub plugins_url: String,

    #[arg(long, default_value = DEFAULT_THEMES_URL, global = true, env = "WPMIRROR_THEMES_URL")]
    pub themes_url: String,

    /// Send sd_notify READY/STATUS/STOPPING messages
    #[arg(long, global = true, env = "WPMIRROR_NOTIFY_SYSTEMD")]
    pub notify_systemd: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the sync coordinator and the download workers
    Run,

    /// Run only the sync coordinator
    Sync {
        /// Run a single sync pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Run only the download workers
    Worker,

    /// Show what the store knows
    Status,

    /// Insert version records from a JSON array file
    Seed {
        /// Path to a JSON array of version records
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["wpmirror", "run"]).unwrap();
        assert_eq!(cli.command, Command::Run);
        assert_eq!(cli.database, "~/.wpmirror/wpmirror.db");
        assert_eq!(cli.artifact_root, "./public");
        assert_eq!(cli.workers, 5);
        assert_eq!(cli.interval, 3600);
        assert_eq!(cli.lease, 3900);
        assert_eq!(cli.core_url, DEFAULT_CORE_URL);
        assert!(!cli.notify_systemd);
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["wpmirror", "sync", "--once", "--workers", "2"]).unwrap();
        assert_eq!(cli.command, Command::Sync { once: true });
        assert_eq!(cli.workers, 2);
    }

    #[test]
    fn test_seed_requires_file() {
        assert!(Cli::try_parse_from(["wpmirror", "seed"]).is_err());
        let cli = Cli::try_parse_from(["wpmirror", "seed", "records.json"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Seed {
                file: PathBuf::from("records.json")
            }
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["wpmirror"]).is_err());
    }
}
