//! Resolving the upstream-authenticated identity of an upgrade request.

use axum::http::{HeaderMap, HeaderName};

use crate::errors::{ConfigError, Result};

/// Maps an upgrade request to the display name an upstream authenticator
/// established for it.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<String>;
}

/// Reads the identity from a request header set by a trusted proxy.
#[derive(Clone, Debug)]
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    pub fn new(header: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| ConfigError::InvalidValue(format!("invalid header name: {header}")))?;
        Ok(Self { header })
    }
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
    }
}

/// Never resolves an identity; clients name themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct Anonymous;

impl IdentityResolver for Anonymous {
    fn resolve(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            let _ = map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn reads_configured_header() {
        let resolver = HeaderIdentity::new("x-authenticated-user").unwrap();
        let found = resolver.resolve(&headers(&[("x-authenticated-user", "alice")]));
        assert_eq!(found.as_deref(), Some("alice"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resolver = HeaderIdentity::new("X-Authenticated-User").unwrap();
        let found = resolver.resolve(&headers(&[("x-authenticated-user", "bob")]));
        assert_eq!(found.as_deref(), Some("bob"));
    }

    #[test]
    fn missing_or_blank_header_is_none() {
        let resolver = HeaderIdentity::new("x-authenticated-user").unwrap();
        assert!(resolver.resolve(&HeaderMap::new()).is_none());
        assert!(resolver.resolve(&headers(&[("x-authenticated-user", "   ")])).is_none());
    }

    #[test]
    fn value_is_trimmed() {
        let resolver = HeaderIdentity::new("x-user").unwrap();
        let found = resolver.resolve(&headers(&[("x-user", " carol ")]));
        assert_eq!(found.as_deref(), Some("carol"));
    }

    #[test]
    fn invalid_header_name_rejected() {
        assert!(HeaderIdentity::new("bad header").is_err());
    }

    #[test]
    fn anonymous_never_resolves() {
        assert!(Anonymous.resolve(&headers(&[("x-authenticated-user", "alice")])).is_none());
    }
}
