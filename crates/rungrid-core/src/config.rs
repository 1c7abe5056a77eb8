//! rungrid.toml configuration parser.
//!
//! Every section is optional; missing values fall back to the defaults the
//! control loops were tuned with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RungridConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub provider: ProviderConfig,
    pub autoscale: AutoscaleConfig,
    pub sync: SyncConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Environment variable holding the webhook HMAC secret.
    pub webhook_secret_env: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            webhook_secret_env: Some("RUNGRID_WEBHOOK_SECRET".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/rungrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Environment variable holding the default API token.
    pub token_env: String,
    pub api_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            token_env: "GITHUB_TOKEN".to_string(),
            api_url: "https://api.github.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub interval: String,
    pub batch_interval: String,
    pub default_scale_down_delay: String,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            batch_interval: "3s".to_string(),
            default_scale_down_delay: "10m".to_string(),
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> Duration {
        duration_or(&self.interval, 30)
    }

    pub fn batch_interval(&self) -> Duration {
        duration_or(&self.batch_interval, 3)
    }

    pub fn default_scale_down_delay(&self) -> Duration {
        duration_or(&self.default_scale_down_delay, 600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval: String,
    /// Cooldown before replacing ephemeral runners that disappeared after
    /// the last sync.
    pub recreation_delay: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            recreation_delay: "10m".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        duration_or(&self.interval, 10)
    }

    pub fn recreation_delay(&self) -> Duration {
        duration_or(&self.recreation_delay, 600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub interval: String,
    pub registration_timeout: String,
    pub retry_delay: String,
    pub rate_limit_delay: String,
    pub busy_wait_timeout: String,
    pub busy_wait_interval: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            registration_timeout: "10m".to_string(),
            retry_delay: "30s".to_string(),
            rate_limit_delay: "10m".to_string(),
            busy_wait_timeout: "60m".to_string(),
            busy_wait_interval: "60s".to_string(),
        }
    }
}

impl LifecycleConfig {
    pub fn interval(&self) -> Duration {
        duration_or(&self.interval, 10)
    }

    pub fn registration_timeout(&self) -> Duration {
        duration_or(&self.registration_timeout, 600)
    }

    pub fn retry_delay(&self) -> Duration {
        duration_or(&self.retry_delay, 30)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        duration_or(&self.rate_limit_delay, 600)
    }

    pub fn busy_wait_timeout(&self) -> Duration {
        duration_or(&self.busy_wait_timeout, 3600)
    }

    pub fn busy_wait_interval(&self) -> Duration {
        duration_or(&self.busy_wait_interval, 60)
    }
}

fn duration_or(s: &str, default_secs: u64) -> Duration {
    parse_duration(s).unwrap_or(Duration::from_secs(default_secs))
}

impl RungridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RungridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
