//! Server configuration: TOML file + CLI overrides.

use relay_core::{TunnelError, TunnelResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub dns: DnsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Point-of-presence code for geo-aware egress selection.
    #[serde(default)]
    pub pop: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            pop: String::new(),
            max_sessions: default_max_sessions(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// `[upstream]` section: the remote source of identities and egress settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    /// Config source URL. Empty = run on the hardcoded fallback only.
    #[serde(default)]
    pub url: String,
    /// Optional bearer token for the config source.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
    #[serde(default = "default_refresh_debounce")]
    pub refresh_debounce_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            refresh_ttl_secs: default_refresh_ttl(),
            refresh_debounce_secs: default_refresh_debounce(),
        }
    }
}

/// `[dns]` section: the DNS-over-HTTPS sub-relay.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    #[serde(default = "default_doh_url")]
    pub doh_url: String,
    #[serde(default = "default_doh_timeout")]
    pub query_timeout_secs: u64,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            doh_url: default_doh_url(),
            query_timeout_secs: default_doh_timeout(),
        }
    }
}

fn default_port() -> u16 {
    8787
}
fn default_max_sessions() -> usize {
    1024
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_refresh_ttl() -> u64 {
    60
}
fn default_refresh_debounce() -> u64 {
    5
}
fn default_doh_url() -> String {
    "https://1.1.1.1/dns-query".to_string()
}
fn default_doh_timeout() -> u64 {
    10
}

/// Resolved server configuration (file values with CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub pop: String,
    pub max_sessions: usize,
    pub connect_timeout: Duration,
    pub upstream_url: Option<String>,
    pub upstream_token: Option<String>,
    pub refresh_ttl: Duration,
    pub refresh_debounce: Duration,
    pub doh_url: String,
    pub doh_timeout: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_pop: Option<&str>,
        cli_upstream: Option<&str>,
    ) -> TunnelResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TunnelError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        // Merge CLI overrides
        let port = cli_port.unwrap_or(file_config.server.port);
        let pop = cli_pop
            .map(str::to_string)
            .unwrap_or(file_config.server.pop);
        let upstream_url = cli_upstream
            .map(str::to_string)
            .unwrap_or(file_config.upstream.url);

        Ok(Self {
            port,
            pop,
            max_sessions: file_config.server.max_sessions,
            connect_timeout: Duration::from_secs(file_config.server.connect_timeout_secs),
            upstream_url: none_if_empty(upstream_url),
            upstream_token: none_if_empty(file_config.upstream.token),
            refresh_ttl: Duration::from_secs(file_config.upstream.refresh_ttl_secs),
            refresh_debounce: Duration::from_secs(file_config.upstream.refresh_debounce_secs),
            doh_url: file_config.dns.doh_url,
            doh_timeout: Duration::from_secs(file_config.dns.query_timeout_secs),
        })
    }
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let cfg = ServerConfig::load(None, None, None, None).unwrap();
        assert_eq!(cfg.port, 8787);
        assert!(cfg.pop.is_empty());
        assert!(cfg.upstream_url.is_none());
        assert_eq!(cfg.refresh_ttl, Duration::from_secs(60));
        assert_eq!(cfg.refresh_debounce, Duration::from_secs(5));
        assert_eq!(cfg.doh_url, "https://1.1.1.1/dns-query");
    }

    #[test]
    fn cli_overrides_win() {
        let cfg = ServerConfig::load(
            None,
            Some(9000),
            Some("SIN"),
            Some("https://config.example/api/users"),
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.pop, "SIN");
        assert_eq!(
            cfg.upstream_url.as_deref(),
            Some("https://config.example/api/users")
        );
    }

    #[test]
    fn parses_partial_toml() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 9999
            pop = "FRA"

            [upstream]
            url = "https://config.example/api/users"
            token = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(file.server.port, 9999);
        assert_eq!(file.server.pop, "FRA");
        assert_eq!(file.server.max_sessions, 1024);
        assert_eq!(file.upstream.token, "secret");
        assert_eq!(file.dns.doh_url, "https://1.1.1.1/dns-query");
    }
}
