//! Operator configuration
//!
//! Every flag can also be set through a `GITOPS_*` environment variable.
//! Per-application settings live in the Application spec instead.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// GitOps Sync Operator
#[derive(Clone, Debug, Parser)]
#[command(name = "gitops-sync-operator", version, about)]
pub struct OperatorConfig {
    /// Port for metrics, health checks and the HTTP API
    #[arg(long, env = "GITOPS_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Directory holding the bare repository mirrors
    #[arg(long, env = "GITOPS_GIT_CACHE_DIR", default_value = "/var/cache/gitops-sync")]
    pub git_cache_dir: PathBuf,

    /// Seconds between timer-driven cycles of every application
    #[arg(long, env = "GITOPS_RESYNC_INTERVAL", default_value_t = 180)]
    pub resync_interval: u64,

    /// Upper bound in seconds for a single apply or delete call
    #[arg(long, env = "GITOPS_APPLY_TIMEOUT", default_value_t = 30)]
    pub apply_timeout: u64,

    /// Field manager used for server-side apply
    #[arg(long, env = "GITOPS_FIELD_MANAGER", default_value = "gitops-sync-operator")]
    pub field_manager: String,

    /// Take ownership of fields managed by other appliers
    #[arg(long, env = "GITOPS_FORCE_CONFLICTS")]
    pub force_conflicts: bool,

    /// POST status changes to this URL
    #[arg(long, env = "GITOPS_NOTIFY_WEBHOOK_URL")]
    pub notify_webhook_url: Option<String>,

    /// Largest manifest file read from the source, in bytes
    #[arg(long, env = "GITOPS_MAX_MANIFEST_BYTES", default_value_t = 1024 * 1024)]
    pub max_manifest_bytes: usize,

    /// Log output format
    #[arg(long, env = "GITOPS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Reject values clap cannot check on its own
    pub fn validate(&self) -> Result<()> {
        if self.resync_interval == 0 {
            return Err(Error::config("--resync-interval must be greater than 0"));
        }
        if self.apply_timeout == 0 {
            return Err(Error::config("--apply-timeout must be greater than 0"));
        }
        if self.field_manager.trim().is_empty() {
            return Err(Error::config("--field-manager must not be empty"));
        }
        if self.max_manifest_bytes == 0 {
            return Err(Error::config("--max-manifest-bytes must be greater than 0"));
        }
        if let Some(url) = &self.notify_webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::config(format!(
                    "Invalid --notify-webhook-url '{}': must be an http or https URL",
                    url
                )));
            }
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::parse_from(["gitops-sync-operator"]);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.resync_interval(), Duration::from_secs(180));
        assert_eq!(config.apply_timeout(), Duration::from_secs(30));
        assert_eq!(config.field_manager, "gitops-sync-operator");
        assert_eq!(config.max_manifest_bytes, 1024 * 1024);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(!config.force_conflicts);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = OperatorConfig::parse_from([
            "gitops-sync-operator",
            "--http-port",
            "9090",
            "--log-format",
            "text",
            "--force-conflicts",
        ]);
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.force_conflicts);
    }

    #[test]
    fn test_validate_rejects_bad_webhook_url() {
        let config = OperatorConfig::parse_from([
            "gitops-sync-operator",
            "--notify-webhook-url",
            "ftp://example.com/hook",
        ]);
        assert!(config.validate().is_err());
    }
}
