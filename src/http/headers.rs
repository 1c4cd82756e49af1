//! Hop-by-hop header sanitation.
//!
//! Header names meaningful only for a single transport leg never cross the
//! proxy. `HeaderMap` keys are lowercase, so removal is case-insensitive.

use http::header::{
    HeaderName, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::HeaderMap;

/// Headers removed from every relayed response and every re-issued request.
pub static HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(name)
}

/// Strip hop-by-hop headers in place. Idempotent; other keys keep their value order.
pub fn sanitize(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn origin_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("Connection", "close"),
            ("Proxy-Connection", "keep-alive"),
            ("Keep-Alive", "timeout=5"),
            ("Proxy-Authenticate", "Basic realm=\"x\""),
            ("Proxy-Authorization", "Basic Zm9vOmJhcg=="),
            ("TE", "trailers"),
            ("Trailer", "Expires"),
            ("Transfer-Encoding", "chunked"),
            ("Upgrade", "h2c"),
            ("Set-Cookie", "a=1"),
            ("Set-Cookie", "b=2"),
            ("Content-Type", "text/plain"),
        ] {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static(value),
            );
        }
        headers
    }

    #[test]
    fn removes_every_hop_header() {
        let mut headers = origin_headers();
        sanitize(&mut headers);

        for name in &HOP_BY_HOP_HEADERS {
            assert!(!headers.contains_key(name), "{name} survived");
        }
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn keeps_end_to_end_values_in_order() {
        let mut headers = origin_headers();
        sanitize(&mut headers);

        let cookies: Vec<_> = headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut once = origin_headers();
        sanitize(&mut once);
        let mut twice = once.clone();
        sanitize(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn classification_ignores_case() {
        assert!(is_hop_by_hop(&HeaderName::from_bytes(b"KEEP-ALIVE").unwrap()));
        assert!(is_hop_by_hop(&HeaderName::from_bytes(b"proxy-connection").unwrap()));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-encoding")));
    }
}
