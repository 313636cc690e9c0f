//! HTTP host-based routing

use ::http::header::HOST;
use ::http::HeaderMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::trace;

/// HTTP routing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpRouterError {
    #[error("Invalid host header: {0}")]
    InvalidHost(String),

    #[error("Host header is required")]
    HostHeaderNotFound,
}

/// Maps `Host` headers to tunnel identities
#[derive(Debug, Clone, Default)]
pub struct HostRouter {
    /// Base domain the relay is served under (e.g. `example.com`)
    domain: Option<String>,
}

impl HostRouter {
    pub fn new(domain: Option<String>) -> Self {
        let domain = domain
            .map(|d| Self::normalize_host(&d))
            .filter(|d| !d.is_empty());
        Self { domain }
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Tunnel identity addressed by `host`, if any
    ///
    /// With a base domain configured, the label(s) in front of it are returned.
    /// Otherwise (or for hosts outside the base domain) everything in front of
    /// the registrable domain is returned: the last two labels, or only the
    /// last label for `*.localhost`. IP literals and bare domains have no
    /// tunnel identity.
    pub fn client_id(&self, host: &str) -> Option<String> {
        let host = Self::normalize_host(host);
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return None;
        }

        if let Some(domain) = &self.domain {
            if host == *domain {
                return None;
            }
            if let Some(subdomain) = host.strip_suffix(domain.as_str()) {
                if let Some(subdomain) = subdomain.strip_suffix('.') {
                    trace!(host = %host, client_id = %subdomain, "Routed by base domain");
                    return Some(subdomain.to_string()).filter(|s| !s.is_empty());
                }
            }
        }

        let labels: Vec<&str> = host.split('.').collect();
        let suffix_len = if labels.last() == Some(&"localhost") { 1 } else { 2 };
        if labels.len() <= suffix_len {
            return None;
        }

        let subdomain = labels[..labels.len() - suffix_len].join(".");
        trace!(host = %host, client_id = %subdomain, "Routed by registrable domain");
        Some(subdomain).filter(|s| !s.is_empty())
    }

    /// Lowercase `host` and strip the port and any trailing dot
    ///
    /// Bracketed IPv6 literals keep their address without brackets.
    pub fn normalize_host(host: &str) -> String {
        let host = host.trim();
        let without_port = if let Some(rest) = host.strip_prefix('[') {
            rest.split(']').next().unwrap_or(rest)
        } else {
            host.split(':').next().unwrap_or(host)
        };
        without_port.trim_end_matches('.').to_ascii_lowercase()
    }

    /// Extract the `Host` header value
    pub fn extract_host(headers: &HeaderMap) -> Result<&str, HttpRouterError> {
        let value = headers
            .get(HOST)
            .ok_or(HttpRouterError::HostHeaderNotFound)?;
        let host = value
            .to_str()
            .map_err(|_| HttpRouterError::InvalidHost(String::from_utf8_lossy(value.as_bytes()).into_owned()))?;

        if host.trim().is_empty() {
            return Err(HttpRouterError::HostHeaderNotFound);
        }
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::http::HeaderValue;

    #[test]
    fn test_base_domain() {
        let router = HostRouter::new(Some("example.com".to_string()));

        assert_eq!(router.client_id("demo.example.com"), Some("demo".to_string()));
        assert_eq!(
            router.client_id("demo.example.com:8080"),
            Some("demo".to_string())
        );
        assert_eq!(router.client_id("Demo.Example.COM"), Some("demo".to_string()));
        assert_eq!(router.client_id("example.com"), None);
        assert_eq!(router.client_id("example.com:3000"), None);
    }

    #[test]
    fn test_base_domain_with_port_is_normalized() {
        let router = HostRouter::new(Some("Relay.Example.com:443".to_string()));
        assert_eq!(router.domain(), Some("relay.example.com"));
        assert_eq!(
            router.client_id("demo.relay.example.com"),
            Some("demo".to_string())
        );
        assert_eq!(router.client_id("relay.example.com"), None);
    }

    #[test]
    fn test_without_base_domain() {
        let router = HostRouter::default();

        assert_eq!(router.client_id("demo.example.com"), Some("demo".to_string()));
        assert_eq!(router.client_id("a.b.example.com"), Some("a.b".to_string()));
        assert_eq!(router.client_id("example.com"), None);
        assert_eq!(router.client_id("demo.localhost:3000"), Some("demo".to_string()));
        assert_eq!(router.client_id("localhost:3000"), None);
    }

    #[test]
    fn test_ip_literals_have_no_client() {
        let router = HostRouter::default();

        assert_eq!(router.client_id("127.0.0.1:3000"), None);
        assert_eq!(router.client_id("10.0.0.1"), None);
        assert_eq!(router.client_id("[::1]:3000"), None);
    }

    #[test]
    fn test_host_outside_base_domain_falls_back() {
        let router = HostRouter::new(Some("example.com".to_string()));
        assert_eq!(router.client_id("demo.other.org"), Some("demo".to_string()));
        assert_eq!(router.client_id("other.org"), None);
        assert_eq!(router.client_id("notexample.com"), None);
    }

    #[test]
    fn test_extract_host() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            HostRouter::extract_host(&headers),
            Err(HttpRouterError::HostHeaderNotFound)
        );

        headers.insert(HOST, HeaderValue::from_static("demo.example.com"));
        assert_eq!(HostRouter::extract_host(&headers), Ok("demo.example.com"));

        headers.insert(HOST, HeaderValue::from_static(""));
        assert_eq!(
            HostRouter::extract_host(&headers),
            Err(HttpRouterError::HostHeaderNotFound)
        );
    }
}
