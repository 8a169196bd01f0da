//! Request classification.
//!
//! Rules are evaluated in a fixed order; the first match wins:
//!
//! 1. Passthrough: websocket schemes, non-GET methods, dev-tooling prefixes
//! 2. Content domain: content-API prefixes
//! 3. Static asset: exact static paths, then static prefixes
//! 4. Default

use reqwest::Method;
use serde::Serialize;
use tilawa_core::AppConfig;

use crate::fetch::Request;

/// Strategy a request is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Forwarded untouched, never cached.
    Passthrough,
    /// Network-first with cache and offline-page fallback.
    ContentDomain,
    /// Cache-first.
    StaticAsset,
    /// Cache hit, else network; caches 2xx same-origin responses.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRules {
    pub content_api_prefixes: Vec<String>,
    pub static_paths: Vec<String>,
    pub static_prefixes: Vec<String>,
    pub passthrough_prefixes: Vec<String>,
}

impl Default for RouteRules {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl RouteRules {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            content_api_prefixes: config.content_api_prefixes.clone(),
            static_paths: config.static_paths.clone(),
            static_prefixes: config.static_prefixes.clone(),
            passthrough_prefixes: config.passthrough_prefixes.clone(),
        }
    }

    pub fn classify(&self, request: &Request) -> RequestClass {
        if matches!(request.url.scheme(), "ws" | "wss") || request.method != Method::GET {
            return RequestClass::Passthrough;
        }

        let path = request.url.path();

        if self.passthrough_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return RequestClass::Passthrough;
        }

        if self.content_api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return RequestClass::ContentDomain;
        }

        if self.static_paths.iter().any(|p| p == path)
            || self.static_prefixes.iter().any(|p| path.starts_with(p.as_str()))
        {
            return RequestClass::StaticAsset;
        }

        RequestClass::Default
    }
}
