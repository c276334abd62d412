//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Peer configuration. File: ~/.config/chatlink/config.toml or /etc/chatlink/config.toml.
/// Env overrides: CHATLINK_PORT, CHATLINK_DOWNLOAD_DIR, CHATLINK_USERNAME.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port the listener binds and the dialer connects to (default 60000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where the dialer saves received files (default: working directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Dialer name shown to the peer. Prompted for when absent.
    #[serde(default)]
    pub username: Option<String>,
}

fn default_port() -> u16 {
    chatlink_core::DEFAULT_PORT
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            download_dir: default_download_dir(),
            username: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let base = load_file(&config_paths()).unwrap_or_default();
    apply_env(base, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("CHATLINK_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => log::warn!("ignoring CHATLINK_PORT={:?}: not a port", s),
        }
    }
    if let Some(s) = var("CHATLINK_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(s) = var("CHATLINK_USERNAME") {
        c.username = Some(s);
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chatlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/chatlink/config.toml"));
    out
}

/// First existing file wins; a broken one is reported and defaults are used.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let path = paths.iter().find(|p| p.exists())?;
    match parse_file(path) {
        Ok(c) => {
            log::debug!("loaded config from {}", path.display());
            Some(c)
        }
        Err(e) => {
            log::warn!("ignoring {}: {}", path.display(), e);
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&s)?)
}
