//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use sluice_core::outbound::DEFAULT_CHUNK_SIZE;

/// Node configuration. File: ~/.config/sluice/config.toml or /etc/sluice/config.toml.
/// Env overrides: SLUICE_LISTEN_PORT, SLUICE_CHUNK_SIZE, SLUICE_MAX_FRAME_LEN,
/// SLUICE_AUTO_ACCEPT, SLUICE_DOWNLOAD_DIR, SLUICE_IDENTITY_FILE.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port `sluice listen` binds (default 47800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Payload bytes per outbound frame (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest frame accepted from a peer (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Accept every offer without asking.
    #[serde(default)]
    pub auto_accept: bool,
    /// Where received files are written (default: current directory).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Persisted node identity (default: ~/.config/sluice/identity.key).
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_listen_port() -> u16 {
    47800
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_max_frame_len() -> u32 {
    16 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            chunk_size: default_chunk_size(),
            max_frame_len: default_max_frame_len(),
            auto_accept: false,
            download_dir: None,
            identity_file: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Apply `SLUICE_*` overrides from `var`. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = var("SLUICE_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.listen_port = p;
        }
        if let Some(n) = var("SLUICE_CHUNK_SIZE").and_then(|s| s.parse::<usize>().ok()) {
            self.chunk_size = n;
        }
        if let Some(n) = var("SLUICE_MAX_FRAME_LEN").and_then(|s| s.parse::<u32>().ok()) {
            self.max_frame_len = n;
        }
        if let Some(b) = var("SLUICE_AUTO_ACCEPT").and_then(|s| parse_bool(&s)) {
            self.auto_accept = b;
        }
        if let Some(d) = var("SLUICE_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
            self.download_dir = Some(PathBuf::from(d));
        }
        if let Some(f) = var("SLUICE_IDENTITY_FILE").filter(|s| !s.is_empty()) {
            self.identity_file = Some(PathBuf::from(f));
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        if let Some(p) = &self.identity_file {
            return p.clone();
        }
        match std::env::var_os("HOME") {
            Some(h) => PathBuf::from(h).join(".config/sluice/identity.key"),
            None => PathBuf::from("sluice-identity.key"),
        }
    }

    pub fn download_dir(&self) -> &Path {
        self.download_dir.as_deref().unwrap_or(Path::new("."))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sluice/config.toml"));
    }
    out.push(PathBuf::from("/etc/sluice/config.toml"));
    out
}

/// First existing file wins; a file that fails to parse is reported and skipped over to defaults.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match Config::from_toml_str(&text) {
        Ok(c) => {
            tracing::debug!(path = %path.display(), "config loaded");
            Some(c)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}
