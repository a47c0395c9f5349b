//! Server configuration file.
//!
//! A single TOML file configures the daemon; every extension gets its own
//! table with a typed schema.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use magpie_xmpp::muc::MucConfig;
use magpie_xmpp::privacy::PrivacyConfig;
use magpie_xmpp::proxy65::Proxy65Config;
use magpie_xmpp::share::ShareConfig;
use magpie_xmpp::turn::TurnConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The served XMPP domain.
    pub domain: String,
    /// Log file path; stdout when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Log filter, e.g. "info" or "magpie_xmpp=debug".
    #[serde(default)]
    pub log_level: Option<String>,
    /// TLS certificate path, handed to the stream transport.
    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,
    /// TLS key path, handed to the stream transport.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    /// Client-to-server listener.
    #[serde(default = "ListenerConfig::c2s_default")]
    pub c2s: ListenerConfig,
    /// Server-to-server listener.
    #[serde(default = "ListenerConfig::s2s_default")]
    pub s2s: ListenerConfig,
    /// statsd metrics emission.
    #[serde(default)]
    pub statsd: Option<StatsdConfig>,
    /// HTTP admin surface.
    #[serde(default)]
    pub http: HttpConfig,
    /// Password backend.
    #[serde(default)]
    pub passwords: PasswordsConfig,
    /// Multi-user chat.
    #[serde(default)]
    pub muc: MucConfig,
    /// Share coordination.
    #[serde(default)]
    pub share: ShareConfig,
    /// SOCKS5 bytestream proxy.
    #[serde(default)]
    pub proxy65: Proxy65Config,
    /// TURN relay.
    #[serde(default)]
    pub turn: TurnConfig,
    /// Privacy filter.
    #[serde(default)]
    pub privacy: PrivacyConfig,
}

/// A TCP listener toggle.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Whether the listener is active.
    pub enabled: bool,
    /// Listen port.
    pub port: u16,
}

impl ListenerConfig {
    fn c2s_default() -> Self {
        Self {
            enabled: true,
            port: 5222,
        }
    }

    fn s2s_default() -> Self {
        Self {
            enabled: false,
            port: 5269,
        }
    }
}

/// statsd emitter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsdConfig {
    /// statsd host.
    pub host: String,
    /// statsd port.
    #[serde(default = "default_statsd_port")]
    pub port: u16,
    /// Metric name prefix.
    #[serde(default = "default_statsd_prefix")]
    pub prefix: String,
}

fn default_statsd_port() -> u16 {
    8125
}

fn default_statsd_prefix() -> String {
    "xmpp-server.".to_string()
}

/// HTTP admin surface settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind host.
    #[serde(default = "default_http_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Path (without leading slash) serving the POST auth check.
    #[serde(default)]
    pub auth_path: Option<String>,
    /// Expose diagnostics endpoints.
    #[serde(default)]
    pub admin_mode: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            auth_path: None,
            admin_mode: false,
        }
    }
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    5280
}

/// Password backend settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PasswordsConfig {
    /// `user:password` lines, one per user.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("could not parse {}", path.display()))?;
        if config.domain.is_empty() {
            anyhow::bail!("domain must not be empty");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str("domain = \"example.com\"").unwrap();
        assert_eq!(config.domain, "example.com");
        assert!(config.c2s.enabled);
        assert_eq!(config.c2s.port, 5222);
        assert!(!config.s2s.enabled);
        assert_eq!(config.http.port, 5280);
        assert!(config.statsd.is_none());
        assert!(!config.privacy.enabled);
    }

    #[test]
    fn extension_tables_parse() {
        let config: Config = toml::from_str(
            r#"
            domain = "example.com"
            log_level = "debug"

            [muc]
            admins = ["boss@example.com"]

            [share]
            force_proxy = true
            allowed_domains = ["example.com", "other.org"]

            [proxy65]
            port = 7778

            [turn]
            realm = "turn.example.com"

            [privacy]
            enabled = true

            [statsd]
            host = "127.0.0.1"
            "#,
        )
        .unwrap();
        assert_eq!(config.muc.admins, vec!["boss@example.com".to_string()]);
        assert!(config.share.force_proxy);
        assert_eq!(config.proxy65.port, 7778);
        assert_eq!(config.turn.realm.as_deref(), Some("turn.example.com"));
        assert!(config.privacy.enabled);
        let statsd = config.statsd.unwrap();
        assert_eq!(statsd.port, 8125);
        assert_eq!(statsd.prefix, "xmpp-server.");
    }
}
