//! Configuration data structures for Sphinx.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. Durations are
//! written as humantime strings (`"250ms"`, `"24h"`) and the optional deadline as an
//! RFC 3339 timestamp. A zero duration or zero count means "not set"; the validator
//! rejects a config that leaves a required value unset.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default TLS certificate reload interval.
pub const DEFAULT_TLS_RELOAD_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn default_tls_reload_interval() -> Duration {
    DEFAULT_TLS_RELOAD_INTERVAL
}

fn default_redirect_port() -> u16 {
    80
}

/// Root settings consumed by the serving supervisor and the pipeline factory.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host and canonical site host. Empty binds every interface and disables the
    /// host redirect middleware.
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Run a plaintext listener that redirects every request to https.
    pub https_redirect: bool,
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    pub admission: AdmissionConfig,
    #[serde(with = "humantime_duration")]
    pub shutdown_timeout: Duration,
    /// Hard end of the event. Serving stops at this instant without any signal.
    pub deadline: Option<DateTime<Utc>>,
    pub data_dir: String,
    pub admin_key: String,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// `host:port` string for the primary listener.
    pub fn listen_addr(&self) -> String {
        Self::format_addr(&self.host, self.port)
    }

    /// `host:port` string for the plaintext redirect listener.
    pub fn redirect_addr(&self) -> String {
        Self::format_addr(&self.host, self.redirect_port)
    }

    fn format_addr(host: &str, port: u16) -> String {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            tls: None,
            https_redirect: false,
            redirect_port: default_redirect_port(),
            admission: AdmissionConfig::default(),
            shutdown_timeout: Duration::ZERO,
            deadline: None,
            data_dir: String::new(),
            admin_key: String::new(),
        }
    }
}

/// TLS certificate/key pair plus how often to re-read it from disk.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_file: String,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub key_file: String,
    #[serde(with = "humantime_duration")]
    pub reload_interval: Duration,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: String::new(),
            key_file: String::new(),
            reload_interval: default_tls_reload_interval(),
        }
    }
}

/// Per-client admission control settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Number of independent traffic shards.
    pub shards: usize,
    /// Minimum spacing between dispatch starts within one shard.
    #[serde(with = "humantime_duration")]
    pub period: Duration,
    /// Requests allowed to be waiting or in flight per shard.
    pub max_concurrent: usize,
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn tls(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.config.tls = Some(TlsConfig {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ..TlsConfig::default()
        });
        self
    }

    pub fn tls_reload_interval(mut self, interval: Duration) -> Self {
        if let Some(tls) = self.config.tls.as_mut() {
            tls.reload_interval = interval;
        }
        self
    }

    pub fn https_redirect(mut self, port: u16) -> Self {
        self.config.https_redirect = true;
        self.config.redirect_port = port;
        self
    }

    pub fn admission(mut self, shards: usize, period: Duration, max_concurrent: usize) -> Self {
        self.config.admission = AdmissionConfig {
            shards,
            period,
            max_concurrent,
        };
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.config.deadline = Some(deadline);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn admin_key(mut self, key: impl Into<String>) -> Self {
        self.config.admin_key = key.into();
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Serde adapter for humantime duration strings. Plain integers are read as seconds.
pub mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            // Environment overrides arrive as strings, so bare numbers are accepted here too.
            Raw::Text(text) => match text.trim().parse::<u64>() {
                Ok(secs) => Ok(Duration::from_secs(secs)),
                Err(_) => humantime::parse_duration(text.trim())
                    .map_err(|e| D::Error::custom(format!("invalid duration '{text}': {e}"))),
            },
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}
