//! Process configuration
//!
//! Everything is settable from the command line or `AGENTCOM_*` environment
//! variables. Runtime-mutable settings (rate-limit overrides and friends)
//! live in the durable settings store instead; this struct is the boot-time
//! surface only.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Boot-time configuration for the hub process.
#[derive(Parser, Debug, Clone)]
#[command(name = "agentcom", version, about = "Agent message hub and task dispatcher")]
pub struct HubConfig {
    /// TCP port the HTTP/WebSocket listener binds.
    #[arg(long, env = "AGENTCOM_PORT", default_value_t = 4000)]
    pub port: u16,

    /// Directory holding one sub-directory per persistent table.
    #[arg(long, env = "AGENTCOM_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory receiving rotating table backups.
    #[arg(long, env = "AGENTCOM_BACKUP_DIR", default_value = "backups")]
    pub backup_dir: PathBuf,

    /// Mailbox entries older than this are evicted.
    #[arg(long, env = "AGENTCOM_MAILBOX_TTL_SECS", default_value_t = 7 * 24 * 3600)]
    pub mailbox_ttl_secs: u64,

    /// Assigned tasks with no progress for this long are reclaimed.
    #[arg(long, env = "AGENTCOM_ORPHAN_TIMEOUT_SECS", default_value_t = 300)]
    pub orphan_timeout_secs: u64,

    /// Cadence of the reaper sweep.
    #[arg(long, env = "AGENTCOM_REAPER_INTERVAL_SECS", default_value_t = 30)]
    pub reaper_interval_secs: u64,

    /// Sessions idle (no ping) longer than this are killed by the reaper.
    #[arg(long, env = "AGENTCOM_SESSION_IDLE_SECS", default_value_t = 120)]
    pub session_idle_secs: u64,

    /// Cadence of the rotating table backup.
    #[arg(long, env = "AGENTCOM_BACKUP_INTERVAL_SECS", default_value_t = 900)]
    pub backup_interval_secs: u64,

    /// How many backups per table are retained.
    #[arg(long, env = "AGENTCOM_BACKUP_KEEP", default_value_t = 5)]
    pub backup_keep: usize,

    /// Model name used for complex-tier routing.
    #[arg(long, env = "AGENTCOM_PREMIUM_MODEL", default_value = "premium-external")]
    pub premium_model: String,

    /// Endpoints silent for this long are marked unreachable.
    #[arg(long, env = "AGENTCOM_ENDPOINT_STALE_SECS", default_value_t = 120)]
    pub endpoint_stale_secs: u64,

    /// JSON override for the default rate limits, e.g.
    /// `{"light":{"capacity":60,"refill_per_sec":1.0},"normal":{...},"heavy":{...}}`.
    /// Takes precedence over limits persisted in the settings store.
    #[arg(long, env = "AGENTCOM_RATE_LIMITS", value_name = "JSON")]
    pub rate_limits: Option<String>,
}

impl HubConfig {
    #[must_use]
    pub fn mailbox_ttl(&self) -> Duration {
        Duration::from_secs(self.mailbox_ttl_secs)
    }

    #[must_use]
    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }

    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    #[must_use]
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    #[must_use]
    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            data_dir: PathBuf::from("data"),
            backup_dir: PathBuf::from("backups"),
            mailbox_ttl_secs: 7 * 24 * 3600,
            orphan_timeout_secs: 300,
            reaper_interval_secs: 30,
            session_idle_secs: 120,
            backup_interval_secs: 900,
            backup_keep: 5,
            premium_model: "premium-external".to_string(),
            endpoint_stale_secs: 120,
            rate_limits: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.mailbox_ttl(), Duration::from_secs(604_800));
        assert_eq!(cfg.backup_keep, 5);
    }

    #[test]
    fn parses_cli_overrides() {
        let cfg = HubConfig::try_parse_from([
            "agentcom",
            "--port",
            "9100",
            "--data-dir",
            "/tmp/hub",
            "--orphan-timeout-secs",
            "60",
        ])
        .unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/hub"));
        assert_eq!(cfg.orphan_timeout(), Duration::from_secs(60));
    }
}
