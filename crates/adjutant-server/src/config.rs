//! Command line and environment configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use adjutant_session::BridgeConfig;
use adjutant_store::RetentionPolicy;
use clap::Parser;

const MAX_PRUNE_INTERVAL_HOURS: u64 = 24 * 365;
const MAX_RECONCILE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Parser)]
#[command(name = "adjutant")]
#[command(version)]
#[command(about = "Real-time coordination server for a fleet of coding agents", long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "ADJUTANT_BIND", default_value = "127.0.0.1:4210")]
    pub bind: SocketAddr,

    /// Directory for the session registry and the default database
    #[arg(long, env = "ADJUTANT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Project the boot-time session is created for (default: current directory)
    #[arg(long, env = "ADJUTANT_PROJECT_ROOT")]
    pub project_root: Option<PathBuf>,

    /// SQLite URL (default: `sqlite://<data-dir>/adjutant.db`)
    #[arg(long, env = "ADJUTANT_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Bearer token required on /api, /ws and /mcp; unset disables auth
    #[arg(long, env = "ADJUTANT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// tmux executable (default: found on PATH)
    #[arg(long, env = "ADJUTANT_TMUX")]
    pub tmux: Option<PathBuf>,

    /// tmux server socket name (`tmux -L`)
    #[arg(long, env = "ADJUTANT_TMUX_SOCKET")]
    pub tmux_socket: Option<String>,

    /// Command run in new agent panes, shell-quoted (default: login shell)
    #[arg(long, env = "ADJUTANT_AGENT_COMMAND")]
    pub agent_command: Option<String>,

    /// Days events are kept
    #[arg(long, env = "ADJUTANT_RETENTION_DAYS", default_value_t = 7)]
    pub retention_days: u32,

    /// Hours between event prune passes
    #[arg(
        long,
        env = "ADJUTANT_PRUNE_INTERVAL_HOURS",
        default_value_t = 6,
        value_parser = clap::value_parser!(u64).range(1..=MAX_PRUNE_INTERVAL_HOURS)
    )]
    pub prune_interval_hours: u64,

    /// Seconds between session reconcile passes
    #[arg(
        long,
        env = "ADJUTANT_RECONCILE_SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..=MAX_RECONCILE_SECS)
    )]
    pub reconcile_secs: u64,

    /// Seconds a dead session may come back before it is pruned
    #[arg(long, env = "ADJUTANT_GRACE_SECS", default_value_t = 60)]
    pub grace_secs: u64,
}

impl Config {
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("adjutant")
        })
    }

    #[must_use]
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[must_use]
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!("sqlite://{}", self.data_dir().join("adjutant.db").display())
        })
    }

    /// # Errors
    /// Returns error if the agent command cannot be split into words.
    pub fn bridge(&self) -> anyhow::Result<BridgeConfig> {
        let agent_command = match self.agent_command.as_deref() {
            None => None,
            Some(raw) => Some(
                shlex::split(raw)
                    .filter(|words| !words.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("cannot parse agent command: {raw}"))?,
            ),
        };
        Ok(BridgeConfig {
            agent_command,
            grace_period: Duration::from_secs(self.grace_secs),
            ..BridgeConfig::default()
        })
    }

    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: self.retention_days,
            interval: Duration::from_secs(self.prune_interval_hours.saturating_mul(60 * 60)),
        }
    }

    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_from_data_dir() {
        let config = Config::parse_from(["adjutant", "--data-dir", "/var/lib/adj"]);
        assert_eq!(config.database_url(), "sqlite:///var/lib/adj/adjutant.db");
        assert_eq!(config.retention(), RetentionPolicy::default());
        assert!(config.bridge().unwrap().agent_command.is_none());
    }

    #[test]
    fn agent_command_is_shell_split() {
        let config = Config::parse_from(["adjutant", "--agent-command", "claude --model 'big one'"]);
        assert_eq!(
            config.bridge().unwrap().agent_command.unwrap(),
            ["claude", "--model", "big one"]
        );

        let broken = Config::parse_from(["adjutant", "--agent-command", "claude 'unterminated"]);
        assert!(broken.bridge().is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(Config::try_parse_from(["adjutant", "--prune-interval-hours", "0"]).is_err());
        assert!(Config::try_parse_from(["adjutant", "--reconcile-secs", "0"]).is_err());
        assert!(
            Config::try_parse_from(["adjutant", "--prune-interval-hours", "18446744073709551615"])
                .is_err()
        );

        let config =
            Config::try_parse_from(["adjutant", "--prune-interval-hours", "1", "--reconcile-secs", "1"])
                .unwrap();
        assert_eq!(config.retention().interval, Duration::from_secs(3600));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(1));
    }
}
