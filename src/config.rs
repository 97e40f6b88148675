use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::probe::{DEFAULT_ATTEMPTS, DEFAULT_INTERVAL, ReadinessPolicy};
use crate::tunnel::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    /// Extra `-o` options, e.g. `ExitOnForwardFailure=yes`
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: "root".to_string(),
            host: "127.0.0.1".to_string(),
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    pub namespace: String,
    pub resource_type: String,
    pub resource_name: String,
    pub remote_port: u16,
}

impl Default for KubeConfig {
    fn default() -> Self {
        KubeConfig {
            namespace: "default".to_string(),
            resource_type: "pods".to_string(),
            resource_name: String::new(),
            remote_port: 5432,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        ReadinessConfig {
            attempts: DEFAULT_ATTEMPTS,
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
        }
    }
}

impl ReadinessConfig {
    pub fn policy(&self) -> Result<ReadinessPolicy> {
        if self.attempts == 0 {
            anyhow::bail!("readiness attempts must be at least 1");
        }
        Ok(ReadinessPolicy {
            max_attempts: self.attempts,
            interval: Duration::from_millis(self.interval_ms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tunnel_type: BackendKind,
    pub local_host: String,
    pub local_port: u16,
    /// Client program run through the tunnel
    pub client: String,
    pub readiness: ReadinessConfig,
    pub ssh: SshConfig,
    pub k8s: KubeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tunnel_type: BackendKind::Ssh,
            local_host: "127.0.0.1".to_string(),
            local_port: 5432,
            client: "psql".to_string(),
            readiness: ReadinessConfig::default(),
            ssh: SshConfig::default(),
            k8s: KubeConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path)
            .context("Failed to read config file")?;
        let config: Config = serde_json::from_str(&contents)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let contents = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(config_path, contents)
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("pgtun");

        Ok(config_dir.join("config.json"))
    }
}
