//! Configuration for the getwork work source.
//!
//! Supports JSON config files; CLI flags in the binary override file values.
//! Settings are immutable while the source is started - changes to the host,
//! port or connection counts take effect through a restart.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetworkConfig {
    /// Source name, used for worker thread names and log context.
    #[serde(default = "default_name")]
    pub name: String,

    /// Pool or node host.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request path on the server.
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Overrides the default framework/module User-Agent when set.
    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default = "default_getwork_timeout")]
    pub getwork_timeout_secs: u64,

    #[serde(default = "default_sendshare_timeout")]
    pub sendshare_timeout_secs: u64,

    #[serde(default = "default_long_poll_connect_timeout")]
    pub long_poll_connect_timeout_secs: u64,

    #[serde(default = "default_long_poll_response_timeout")]
    pub long_poll_response_timeout_secs: u64,

    /// Job fetching connections (worker threads).
    #[serde(default = "default_connections")]
    pub getwork_connections: usize,

    /// Share upload connections (worker threads).
    #[serde(default = "default_connections")]
    pub upload_connections: usize,

    /// Long poll connections per discovered URL. 0 disables long polling.
    #[serde(default = "default_connections")]
    pub long_poll_connections: usize,

    /// Safety margin subtracted from every job expiry.
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_secs: u64,
}

impl Default for GetworkConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: String::new(),
            port: default_port(),
            path: default_path(),
            username: String::new(),
            password: String::new(),
            user_agent: None,
            getwork_timeout_secs: default_getwork_timeout(),
            sendshare_timeout_secs: default_sendshare_timeout(),
            long_poll_connect_timeout_secs: default_long_poll_connect_timeout(),
            long_poll_response_timeout_secs: default_long_poll_response_timeout(),
            getwork_connections: default_connections(),
            upload_connections: default_connections(),
            long_poll_connections: default_connections(),
            expiry_margin_secs: default_expiry_margin(),
        }
    }
}

impl GetworkConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;
        let config: GetworkConfig = serde_json::from_str(&content)
            .context("Failed to parse config JSON")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("Host is required");
        }
        if self.port == 0 {
            anyhow::bail!("Port must be nonzero");
        }
        if !self.path.starts_with('/') {
            anyhow::bail!("Path must start with '/'");
        }
        Ok(())
    }

    /// Precomputed HTTP Basic value, or `None` when both credentials are empty.
    pub fn authorization(&self) -> Option<String> {
        if self.username.is_empty() && self.password.is_empty() {
            return None;
        }
        let credentials = format!("{}:{}", self.username, self.password);
        Some(format!("Basic {}", general_purpose::STANDARD.encode(credentials.as_bytes())))
    }

    /// Configured User-Agent, or the framework/module default.
    pub fn user_agent(&self) -> String {
        match &self.user_agent {
            Some(agent) if !agent.is_empty() => agent.clone(),
            _ => format!(
                "ironmine/{ver} (getwork work source v{ver})",
                ver = env!("CARGO_PKG_VERSION")
            ),
        }
    }

    pub fn work_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn getwork_timeout(&self) -> Duration {
        Duration::from_secs(self.getwork_timeout_secs)
    }

    pub fn sendshare_timeout(&self) -> Duration {
        Duration::from_secs(self.sendshare_timeout_secs)
    }

    pub fn long_poll_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_connect_timeout_secs)
    }

    pub fn long_poll_response_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_response_timeout_secs)
    }

    pub fn expiry_margin(&self) -> Duration {
        Duration::from_secs(self.expiry_margin_secs)
    }

    /// True when switching from `active` to `self` requires stopping and
    /// restarting the worker pools.
    pub fn needs_restart(&self, active: &GetworkConfig) -> bool {
        self.host != active.host
            || self.port != active.port
            || self.getwork_connections != active.getwork_connections
            || self.upload_connections != active.upload_connections
            || self.long_poll_connections != active.long_poll_connections
    }
}

fn default_name() -> String {
    "getwork".to_string()
}

fn default_port() -> u16 {
    8332
}

fn default_path() -> String {
    "/".to_string()
}

fn default_getwork_timeout() -> u64 {
    3
}

fn default_sendshare_timeout() -> u64 {
    5
}

fn default_long_poll_connect_timeout() -> u64 {
    10
}

fn default_long_poll_response_timeout() -> u64 {
    1800
}

fn default_connections() -> usize {
    1
}

fn default_expiry_margin() -> u64 {
    5
}
