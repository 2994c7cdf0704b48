use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

use crate::cli::Cli;
use crate::upstream::UpstreamUrls;

/// Shortest lease accepted. A run fetches three manifests and scans the
/// artifact tree while holding the lock, which takes longer than this.
const MIN_LEASE: Duration = Duration::from_secs(60);

/// Application configuration, resolved from the CLI and environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub artifact_root: PathBuf,
    pub upstream: UpstreamUrls,

    pub interval: Duration,
    pub lease: Duration,
    pub queue_poll: Duration,
    pub http_timeout: Duration,

    pub workers: u16,
    pub notify_systemd: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        if cli.workers == 0 {
            bail!("--workers must be at least 1");
        }
        if cli.interval == 0 {
            bail!("--interval must be at least 1 second");
        }
        if cli.queue_poll_ms == 0 {
            bail!("--queue-poll-ms must be at least 1");
        }

        let lease = Duration::from_secs(cli.lease);
        if lease < MIN_LEASE {
            bail!(
                "--lease {}s is too short; a sync run needs at least {}s",
                cli.lease,
                MIN_LEASE.as_secs()
            );
        }
        if cli.lease < cli.interval {
            tracing::warn!(
                lease_secs = cli.lease,
                interval_secs = cli.interval,
                "Lease is shorter than the sync interval; a crashed run's lock will expire early"
            );
        }

        Ok(Self {
            database: expand_tilde(&cli.database),
            artifact_root: expand_tilde(&cli.artifact_root),
            upstream: UpstreamUrls {
                core: cli.core_url.clone(),
                plugins: cli.plugins_url.clone(),
                themes: cli.themes_url.clone(),
            },
            interval: Duration::from_secs(cli.interval),
            lease,
            queue_poll: Duration::from_millis(cli.queue_poll_ms),
            http_timeout: Duration::from_secs(cli.http_timeout),
            workers: cli.workers,
            notify_systemd: cli.notify_systemd,
        })
    }
}
