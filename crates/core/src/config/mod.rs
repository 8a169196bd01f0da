//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (TILAWA_*)
//! 2. TOML config file (if TILAWA_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (TILAWA_*)
/// 2. TOML config file (if TILAWA_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Address the edge adapter listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Origin every intercepted request is forwarded to.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// User-Agent string for upstream requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HTTP request timeout in milliseconds. This is the only timeout
    /// applied to network fetches.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bucket version token. Bump on deploy to invalidate every cache bucket.
    #[serde(default = "default_cache_version")]
    pub cache_version: String,

    /// Path prefixes served network-first.
    #[serde(default = "default_content_api_prefixes")]
    pub content_api_prefixes: Vec<String>,

    /// Exact paths served cache-first.
    #[serde(default = "default_static_paths")]
    pub static_paths: Vec<String>,

    /// Path prefixes served cache-first.
    #[serde(default = "default_static_prefixes")]
    pub static_prefixes: Vec<String>,

    /// Dev-tooling path prefixes that bypass the router entirely.
    #[serde(default = "default_passthrough_prefixes")]
    pub passthrough_prefixes: Vec<String>,

    /// Paths fetched into the static shell at install. The offline page is
    /// always added.
    #[serde(default = "default_precache_paths")]
    pub precache_paths: Vec<String>,

    /// Route returned for failed navigations.
    #[serde(default = "default_offline_page")]
    pub offline_page: String,

    /// Age after which default-strategy hits are revalidated in the
    /// background. 0 disables revalidation.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Connectivity assumed at startup.
    #[serde(default = "default_true")]
    pub start_online: bool,

    #[serde(default = "default_contact_endpoint")]
    pub contact_endpoint: String,

    #[serde(default = "default_reading_position_endpoint")]
    pub reading_position_endpoint: String,

    #[serde(default = "default_notes_endpoint")]
    pub notes_endpoint: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./tilawa-store.sqlite")
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".into()
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".into()
}

fn default_user_agent() -> String {
    "tilawa-edge/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_cache_version() -> String {
    "v1".into()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_content_api_prefixes() -> Vec<String> {
    strings(&["/api/quran/", "/api/translations/", "/api/search"])
}

fn default_static_paths() -> Vec<String> {
    strings(&["/", "/offline", "/manifest.json", "/favicon.ico"])
}

fn default_static_prefixes() -> Vec<String> {
    strings(&["/fonts/", "/icons/", "/static/", "/_next/static/"])
}

fn default_passthrough_prefixes() -> Vec<String> {
    strings(&["/_next/webpack-hmr", "/__webpack_hmr", "/__nextjs", "/_debug/", "/sockjs-node"])
}

fn default_precache_paths() -> Vec<String> {
    strings(&["/", "/manifest.json"])
}

fn default_offline_page() -> String {
    "/offline".into()
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_contact_endpoint() -> String {
    "/api/contact".into()
}

fn default_reading_position_endpoint() -> String {
    "/api/reading-position".into()
}

fn default_notes_endpoint() -> String {
    "/api/notes".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            cache_version: default_cache_version(),
            content_api_prefixes: default_content_api_prefixes(),
            static_paths: default_static_paths(),
            static_prefixes: default_static_prefixes(),
            passthrough_prefixes: default_passthrough_prefixes(),
            precache_paths: default_precache_paths(),
            offline_page: default_offline_page(),
            stale_after_secs: default_stale_after_secs(),
            start_online: true,
            contact_endpoint: default_contact_endpoint(),
            reading_position_endpoint: default_reading_position_endpoint(),
            notes_endpoint: default_notes_endpoint(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Revalidation age for the staleness tracker; `None` when disabled.
    pub fn stale_after(&self) -> Option<chrono::Duration> {
        (self.stale_after_secs > 0).then(|| chrono::Duration::seconds(self.stale_after_secs as i64))
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `TILAWA_`
    /// 2. TOML file from `TILAWA_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("TILAWA_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("TILAWA_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
