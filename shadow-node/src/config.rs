//! Load config from file and environment.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/shadow/config.toml or /etc/shadow/config.toml.
/// Env overrides: SHADOW_LISTEN_PORT, SHADOW_DATA_DIR, SHADOW_RECONNECT_DELAY_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port for inbound sessions (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Directory holding identity.toml.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Delay before re-registering after the listener fails (default 2000 ms).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Hello exchange timeout (default 5000 ms).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Node IDs to connect to once registered.
    #[serde(default)]
    pub autoconnect: Vec<String>,
    /// Rendezvous table: node ID -> address.
    #[serde(default)]
    pub directory: BTreeMap<String, SocketAddr>,
}

fn default_listen_port() -> u16 {
    45680
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/shadow"),
        None => PathBuf::from(".shadow"),
    }
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            data_dir: default_data_dir(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            autoconnect: Vec::new(),
            directory: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.toml")
    }
}

/// Load config: default, then config file, then env vars.
///
/// An explicit `path` must exist and parse. Without one, the first default location that
/// exists is used and an unparsable file falls back to defaults.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let c = match path {
        Some(p) => parse_file(p)?,
        None => load_default_file().unwrap_or_default(),
    };
    Ok(apply_env(c, |k| std::env::var(k).ok()))
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shadow/config.toml"));
    }
    out.push(PathBuf::from("/etc/shadow/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&p) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "ignoring config file");
            None
        }
    }
}

/// Apply env overrides. Unparsable values are ignored.
pub fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(p) = var("SHADOW_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(d) = var("SHADOW_DATA_DIR").filter(|s| !s.is_empty()) {
        c.data_dir = PathBuf::from(d);
    }
    if let Some(ms) = var("SHADOW_RECONNECT_DELAY_MS").and_then(|s| s.parse().ok()) {
        c.reconnect_delay_ms = ms;
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.listen_port, 45680);
        assert_eq!(c.reconnect_delay(), Duration::from_secs(2));
        assert!(c.directory.is_empty());
        assert!(c.identity_path().ends_with("identity.toml"));
    }

    #[test]
    fn parses_file_with_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
listen_port = 5000
autoconnect = ["shadow-bbb"]

[directory]
shadow-bbb = "127.0.0.1:5001"
"#,
        )
        .unwrap();
        let c = parse_file(&path).unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.autoconnect, vec!["shadow-bbb".to_string()]);
        assert_eq!(
            c.directory.get("shadow-bbb"),
            Some(&"127.0.0.1:5001".parse().unwrap())
        );
        assert_eq!(c.handshake_timeout_ms, 5000);
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(parse_file(&path).is_err());
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn env_overrides() {
        let c = apply_env(Config::default(), |k| match k {
            "SHADOW_LISTEN_PORT" => Some("6000".into()),
            "SHADOW_DATA_DIR" => Some("/tmp/shadow-test".into()),
            "SHADOW_RECONNECT_DELAY_MS" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.data_dir, PathBuf::from("/tmp/shadow-test"));
        assert_eq!(c.reconnect_delay_ms, 2000);
    }
}
