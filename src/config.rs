//! Application configuration: optional TOML file overlaid with
//! `CLIPMARK__SECTION__KEY` environment variables.

use crate::download::{ProxyEndpoints, BROWSER_USER_AGENT, DEFAULT_REFERER};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "clipmark.toml";
const ENV_PREFIX: &str = "CLIPMARK";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub anon_key: String,
    pub table: String,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".into(),
            anon_key: String::new(),
            table: "videos".into(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub download_url: Option<String>,
    pub image_url: Option<String>,
    pub user_agent: String,
    pub referer: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            download_url: None,
            image_url: None,
            user_agent: BROWSER_USER_AGENT.into(),
            referer: DEFAULT_REFERER.into(),
        }
    }
}

impl ProxyConfig {
    pub fn endpoints(&self) -> ProxyEndpoints {
        ProxyEndpoints {
            download_url: self.download_url.clone().filter(|u| !u.is_empty()),
            image_url: self.image_url.clone().filter(|u| !u.is_empty()),
            user_agent: self.user_agent.clone(),
            referer: self.referer.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub data_dir: Option<PathBuf>,
    pub min_free_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            min_free_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub proxy: ProxyConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load from `path` (or `clipmark.toml` if present) plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Directory holding the store and the video cache.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.cache.data_dir {
            return dir.clone();
        }
        ProjectDirs::from("com", "clipmark", "clipmark")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".clipmark"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join("store.json")
    }

    pub fn video_dir(&self) -> PathBuf {
        self.data_dir().join("videos")
    }
}
