//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `cache_version` is empty or contains whitespace
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    /// - `upstream_url` is not an http(s) URL
    /// - `offline_page` or any route prefix is not an absolute path
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_version.is_empty() || self.cache_version.chars().any(char::is_whitespace) {
            return Err(invalid("cache_version", "must be a non-empty token without whitespace"));
        }

        if self.timeout_ms < 100 {
            return Err(invalid("timeout_ms", "must be at least 100ms"));
        }
        if self.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        match url::Url::parse(&self.upstream_url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            Ok(u) => return Err(invalid("upstream_url", format!("unsupported scheme: {}", u.scheme()))),
            Err(e) => return Err(invalid("upstream_url", e.to_string())),
        }

        if !self.offline_page.starts_with('/') {
            return Err(invalid("offline_page", "must be an absolute path"));
        }

        let route_lists = [
            ("content_api_prefixes", &self.content_api_prefixes),
            ("static_paths", &self.static_paths),
            ("static_prefixes", &self.static_prefixes),
            ("passthrough_prefixes", &self.passthrough_prefixes),
            ("precache_paths", &self.precache_paths),
        ];
        for (field, list) in route_lists {
            if let Some(bad) = list.iter().find(|p| !p.starts_with('/')) {
                return Err(invalid(field, format!("'{bad}' must start with '/'")));
            }
        }

        let overlap = self
            .content_api_prefixes
            .iter()
            .find(|p| self.static_prefixes.contains(p));
        if let Some(prefix) = overlap {
            tracing::warn!(
                prefix = %prefix,
                "prefix is both content-domain and static; content-domain takes precedence"
            );
        }

        Ok(())
    }
}
