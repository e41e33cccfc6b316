// Bridge configuration
use crate::auth::UpstreamCredentials;
use crate::error::{ProxyError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_FILE_ENV: &str = "NTLM_BRIDGE_CONFIG";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Downstream listener
    pub listen_addr: String,

    // Upstream proxy
    pub upstream_host: String,
    pub upstream_port: u16,

    // NTLM credentials
    pub upstream_username: String,
    pub upstream_password: String,
    pub upstream_domain: Option<String>,
    pub workstation: Option<String>,

    // Timeouts
    pub idle_timeout_seconds: u64,
    pub connect_timeout_ms: u64,
    pub total_timeout_ms: u64,

    // Policy
    pub allow_plain_http: bool,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: ":3128".to_string(),
            upstream_host: String::new(),
            upstream_port: 0,
            upstream_username: String::new(),
            upstream_password: String::new(),
            upstream_domain: None,
            workstation: None,
            idle_timeout_seconds: 90,
            connect_timeout_ms: 10_000,
            total_timeout_ms: 120_000,
            allow_plain_http: true,
            log_level: "info".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("upstream_host", &self.upstream_host)
            .field("upstream_port", &self.upstream_port)
            .field("upstream_username", &self.upstream_username)
            .field("upstream_password", &"<redacted>")
            .field("upstream_domain", &self.upstream_domain)
            .field("workstation", &self.workstation)
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("total_timeout_ms", &self.total_timeout_ms)
            .field("allow_plain_http", &self.allow_plain_http)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then the process environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        let config = Self::from_lookup(file.as_deref(), |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from an optional file and an environment lookup.
    /// Does not validate.
    pub fn from_lookup<F>(file: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("invalid {}: {}", path.display(), e)))?;

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("UPSTREAM_PROXY_HOST") {
            self.upstream_host = v;
        }
        if let Some(v) = get("UPSTREAM_PROXY_PORT") {
            self.upstream_port = parse_number("UPSTREAM_PROXY_PORT", &v)?;
        }
        if let Some(v) = get("UPSTREAM_PROXY_USER") {
            self.upstream_username = v;
        }
        if let Some(v) = get("UPSTREAM_PROXY_PASS") {
            self.upstream_password = v;
        }
        if let Some(v) = get("UPSTREAM_PROXY_DOMAIN") {
            self.upstream_domain = Some(v);
        }
        if let Some(v) = get("UPSTREAM_PROXY_WORKSTATION") {
            self.workstation = Some(v);
        }
        if let Some(v) = get("IDLE_TIMEOUT_SECONDS") {
            self.idle_timeout_seconds = parse_number("IDLE_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_number("CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("TOTAL_TIMEOUT_MS") {
            self.total_timeout_ms = parse_number("TOTAL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("ALLOW_PLAIN_HTTP") {
            self.allow_plain_http = parse_flag("ALLOW_PLAIN_HTTP", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream_host.trim().is_empty() {
            return Err(ProxyError::Config("UPSTREAM_PROXY_HOST is required".into()));
        }
        if self.upstream_port == 0 {
            return Err(ProxyError::Config("UPSTREAM_PROXY_PORT is required".into()));
        }
        if self.upstream_username.is_empty() {
            return Err(ProxyError::Config("UPSTREAM_PROXY_USER is required".into()));
        }
        if self.upstream_password.is_empty() {
            return Err(ProxyError::Config("UPSTREAM_PROXY_PASS is required".into()));
        }
        self.listen_socket_addr()?;
        Ok(())
    }

    /// `:3128` listens on all interfaces.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.listen_addr.trim();
        let full = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };
        full.parse()
            .map_err(|_| ProxyError::Config(format!("invalid listen address: {}", self.listen_addr)))
    }

    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    pub fn credentials(&self) -> UpstreamCredentials {
        UpstreamCredentials::new(
            &self.upstream_username,
            &self.upstream_password,
            self.upstream_domain.as_deref(),
            self.workstation.as_deref(),
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Config(format!("{} must be a number, got {:?}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ProxyError::Config(format!(
            "{} must be true or false, got {:?}",
            key, value
        ))),
    }
}
