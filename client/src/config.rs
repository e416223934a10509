//! Configuration file parser for kubetap
//!
//! Supports kubetap.yml with the relay location, access credentials and
//! tunnel settings. Environment variables override the file; command-line
//! flags override both and are applied by the caller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::{Credentials, StaticCredentials, DEFAULT_TOKEN_TYPE};
use crate::tunnel::TunnelOptions;

pub const ENV_RELAY: &str = "KUBETAP_RELAY";
pub const ENV_ACCESS_TOKEN: &str = "KUBETAP_ACCESS_TOKEN";
pub const ENV_TOKEN_TYPE: &str = "KUBETAP_TOKEN_TYPE";

/// Root configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubetapConfig {
    /// Relay base URL
    #[serde(default)]
    pub relay: Option<String>,

    /// Authorization scheme sent with the token
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Access token
    #[serde(default)]
    pub access_token: Option<String>,

    /// Address port-forward listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// How long to wait for sessions to close after an interrupt
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for KubetapConfig {
    fn default() -> Self {
        Self {
            relay: None,
            token_type: default_token_type(),
            access_token: None,
            bind_address: default_bind_address(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl KubetapConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: KubetapConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Configuration for one invocation: `path` when given, otherwise the
    /// first config file found, otherwise defaults; then the environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path.map(PathBuf::from).or_else(Self::find_config) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables looked up with `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(relay) = lookup(ENV_RELAY) {
            self.relay = Some(relay);
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
        if let Some(token_type) = lookup(ENV_TOKEN_TYPE) {
            self.token_type = token_type;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(relay) = &self.relay {
            if relay.trim().is_empty() {
                anyhow::bail!("Relay URL cannot be empty");
            }
        }
        if self.token_type.trim().is_empty() {
            anyhow::bail!("Token type cannot be empty");
        }
        self.bind_address
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid bind address '{}'", self.bind_address))?;
        Ok(())
    }

    pub fn relay_url(&self) -> Result<&str> {
        self.relay.as_deref().with_context(|| {
            format!("No relay configured; pass --relay or set {}", ENV_RELAY)
        })
    }

    pub fn credentials(&self) -> Result<StaticCredentials> {
        let token = self
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .with_context(|| {
                format!("No access token configured; pass --token or set {}", ENV_ACCESS_TOKEN)
            })?;
        Ok(StaticCredentials::new(Credentials::new(
            self.token_type.clone(),
            token,
        )))
    }

    pub fn tunnel_options(&self) -> Result<TunnelOptions> {
        let bind_address = self
            .bind_address
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid bind address '{}'", self.bind_address))?;
        Ok(TunnelOptions {
            bind_address,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        })
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["kubetap.yml", "kubetap.yaml", ".kubetap.yml", ".kubetap.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
