//! Request identity and target resolution.
//!
//! # Responsibilities
//! - Tag every exchange with an id shared by logs and audit records
//! - Turn the inbound request target into the absolute URL re-issued upstream

use http::header::HOST;
use http::request::Parts;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::Uri;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Resolve a plain proxy request target to an absolute URI.
///
/// Absolute-form targets are kept. Origin-form targets (a client talking to
/// the proxy as if it were the origin) are resolved against `Host` over http.
pub fn absolute_uri(parts: &Parts) -> Option<Uri> {
    let uri = &parts.uri;
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.clone());
    }

    let host = parts.headers.get(HOST)?.to_str().ok()?;
    let authority = Authority::from_str(host).ok()?;
    with_origin(uri, Scheme::HTTP, authority)
}

/// Resolve a request read inside a CONNECT tunnel.
///
/// The tunnel authority always wins so a request cannot escape its tunnel.
pub fn tunnel_uri(uri: &Uri, scheme: Scheme, authority: &Authority) -> Option<Uri> {
    with_origin(uri, scheme, authority.clone())
}

fn with_origin(uri: &Uri, scheme: Scheme, authority: Authority) -> Option<Uri> {
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = Request::get(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn absolute_form_is_kept() {
        let parts = parts("http://example.test/a?b=1", Some("other.test"));
        assert_eq!(
            absolute_uri(&parts).unwrap(),
            "http://example.test/a?b=1".parse::<Uri>().unwrap()
        );
    }

    #[test]
    fn origin_form_uses_host_header() {
        let parts = parts("/a?b=1", Some("example.test:8080"));
        assert_eq!(
            absolute_uri(&parts).unwrap().to_string(),
            "http://example.test:8080/a?b=1"
        );
    }

    #[test]
    fn origin_form_without_host_is_unresolvable() {
        assert!(absolute_uri(&parts("/a", None)).is_none());
    }

    #[test]
    fn tunnel_authority_overrides_target() {
        let authority = Authority::from_static("secure.test:443");
        let uri = tunnel_uri(&"/path".parse().unwrap(), Scheme::HTTPS, &authority).unwrap();
        assert_eq!(uri.to_string(), "https://secure.test:443/path");

        let smuggled = tunnel_uri(
            &"http://elsewhere.test/x".parse().unwrap(),
            Scheme::HTTPS,
            &authority,
        )
        .unwrap();
        assert_eq!(smuggled.host(), Some("secure.test"));
    }

    #[test]
    fn exchange_ids_are_unique() {
        assert_ne!(ExchangeId::new(), ExchangeId::new());
        assert_eq!(ExchangeId::new().to_string().len(), 32);
    }
}
