//! URL canonicalization for consistent cache identity.

/// Error type for URL canonicalization failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<UrlError> for tilawa_core::Error {
    fn from(err: UrlError) -> Self {
        tilawa_core::Error::InvalidUrl(err.to_string())
    }
}

/// Canonicalize an absolute URL string.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Require an http(s) or ws(s) scheme
/// 3. Lowercase the host
/// 4. Remove fragment (#...)
/// 5. Keep query string intact (do not reorder)
pub fn canonicalize(input: &str) -> Result<url::Url, UrlError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let mut parsed = url::Url::parse(trimmed).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    if let Some(host) = parsed.host_str() {
        let lowered = host.to_lowercase();
        parsed
            .set_host(Some(&lowered))
            .map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    }

    parsed.set_fragment(None);

    Ok(parsed)
}

/// Resolve a path (or an absolute URL) against an origin and canonicalize it.
///
/// `resolve(origin, "/api/contact")` yields the endpoint on that origin;
/// absolute inputs are canonicalized as-is.
pub fn resolve(origin: &url::Url, path_or_url: &str) -> Result<url::Url, UrlError> {
    let trimmed = path_or_url.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }
    if trimmed.contains("://") {
        return canonicalize(trimmed);
    }

    let joined = origin
        .join(trimmed)
        .map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    canonicalize(joined.as_str())
}
