//! Load node config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration. File: ~/.config/abyss/config.toml or /etc/abyss/config.toml.
/// Env overrides: ABYSS_LISTEN_ADDR, ABYSS_KEY_PATH, ABYSS_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// TCP listen address (default 127.0.0.1:0, an ephemeral port).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Addresses put in the local URL instead of the bound one.
    #[serde(default)]
    pub advertise_addrs: Vec<SocketAddr>,
    /// PKCS#8 PEM Ed25519 key. Generated and written on first start if missing.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// World paths the daemon hosts at startup.
    #[serde(default)]
    pub worlds: Vec<String>,
    /// Daemon accepts every join request.
    #[serde(default)]
    pub auto_accept: bool,
    /// tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_keepalive_interval_ms() -> u64 {
    10_000
}
fn default_idle_timeout_ms() -> u64 {
    30_000
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addrs: Vec::new(),
            key_path: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            worlds: Vec::new(),
            auto_accept: false,
            log_filter: default_log_filter(),
        }
    }
}

impl NodeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }

    /// Apply overrides; `var` looks up one environment variable.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("ABYSS_LISTEN_ADDR") {
            match s.parse() {
                Ok(addr) => self.listen_addr = addr,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid ABYSS_LISTEN_ADDR"),
            }
        }
        if let Some(s) = var("ABYSS_KEY_PATH") {
            self.key_path = Some(PathBuf::from(s));
        }
        if let Some(s) = var("ABYSS_LOG") {
            self.log_filter = s;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: defaults, then the first config file present, then env vars.
pub fn load() -> Result<NodeConfig, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => load_file(&p)?,
        None => NodeConfig::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

/// Load an explicit config file, then env vars.
pub fn load_from(path: &Path) -> Result<NodeConfig, ConfigError> {
    let mut c = load_file(path)?;
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/abyss/config.toml"));
    }
    out.push(PathBuf::from("/etc/abyss/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let c: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(c, NodeConfig::default());
        assert_eq!(c.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn file_values_loaded() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
listen_addr = "0.0.0.0:1605"
advertise_addrs = ["10.0.0.4:1605"]
key_path = "/var/lib/abyss/key.pem"
worlds = ["/rooms/1", "/lobby"]
auto_accept = true
idle_timeout_ms = 1000
"#
        )
        .unwrap();
        let c = load_file(f.path()).unwrap();
        assert_eq!(c.listen_addr, "0.0.0.0:1605".parse().unwrap());
        assert_eq!(c.advertise_addrs.len(), 1);
        assert_eq!(c.worlds, vec!["/rooms/1", "/lobby"]);
        assert!(c.auto_accept);
        assert_eq!(c.idle_timeout(), Duration::from_secs(1));
        assert_eq!(c.keepalive_interval_ms, 10_000);
    }

    #[test]
    fn unknown_field_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "proxy_port = 3128").unwrap();
        assert!(matches!(load_file(f.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_file(&dir.path().join("nope.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("ABYSS_LISTEN_ADDR", "127.0.0.1:7000"),
            ("ABYSS_KEY_PATH", "/tmp/k.pem"),
            ("ABYSS_LOG", "abyss_node=debug"),
        ]
        .into_iter()
        .collect();
        let mut c = NodeConfig::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr.port(), 7000);
        assert_eq!(c.key_path, Some(PathBuf::from("/tmp/k.pem")));
        assert_eq!(c.log_filter, "abyss_node=debug");
    }

    #[test]
    fn bad_env_addr_ignored() {
        let mut c = NodeConfig::default();
        c.apply_env(|k| (k == "ABYSS_LISTEN_ADDR").then(|| "not an addr".to_string()));
        assert_eq!(c.listen_addr, default_listen_addr());
    }
}
