use crate::error::ServiceError;
use reqwest::{Client, Url};
use std::time::Duration;

pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Accepts only absolute http(s) image URLs, optionally restricted to
/// `IMAGE_DOMAIN_ALLOWLIST`.
pub fn ensure_image_url(stage: &'static str, raw: &str) -> Result<Url, ServiceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::invalid_input(stage, "image url is required"));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|_| ServiceError::invalid_input(stage, format!("invalid_image_url: {trimmed}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ServiceError::invalid_input(
            stage,
            format!("unsupported_url_scheme: {trimmed}"),
        ));
    }
    if let Some(allowed) = image_domain_allowlist()
        && let Some(host) = parsed.host_str()
        && !host_allowed(host, &allowed)
    {
        return Err(ServiceError::invalid_input(
            stage,
            format!("domain_not_allowed: {host}"),
        ));
    }
    Ok(parsed)
}

fn image_domain_allowlist() -> Option<Vec<String>> {
    std::env::var("IMAGE_DOMAIN_ALLOWLIST")
        .ok()
        .map(|v| {
            v.split([',', ' ', '\n', '\t'])
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
}

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.to_lowercase();
    allowed
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

/// First 200 characters of an upstream error body, for log and error details.
pub fn body_excerpt(body: &str) -> String {
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn rejects_non_http_schemes() {
        let err = ensure_image_url("redesign", "ftp://example.com/a.jpg").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.detail().starts_with("unsupported_url_scheme"));
        assert!(ensure_image_url("redesign", "not a url").is_err());
        assert!(ensure_image_url("redesign", "  ").is_err());
    }

    #[test]
    fn accepts_https_urls() {
        let url = ensure_image_url("redesign", " https://cdn.example.com/room.jpg ").unwrap();
        assert_eq!(url.host_str(), Some("cdn.example.com"));
    }

    #[test]
    fn allowlist_matches_subdomains() {
        let allowed = vec!["example.com".to_string()];
        assert!(host_allowed("cdn.example.com", &allowed));
        assert!(host_allowed("EXAMPLE.com", &allowed));
        assert!(!host_allowed("badexample.com", &allowed));
    }
}
