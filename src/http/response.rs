//! Origin response as seen between the round-trip and the client write.

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode, Version};
use std::io;

use crate::http::body::BodyStream;

/// Response received from the origin (or upstream proxy).
///
/// Single owner: it moves from the round-trip through the sanitizer and
/// normalizer into the client response.
pub struct OriginResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: BodyStream,
    /// Set when the normalizer replaced the body with its decompressed form.
    pub decoded: bool,
}

impl OriginResponse {
    pub fn new<S>(status: StatusCode, headers: HeaderMap, body: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            body: Box::pin(body),
            decoded: false,
        }
    }

    pub fn from_upstream(response: reqwest::Response) -> Self {
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(io::Error::other);

        Self {
            version,
            ..Self::new(status, headers, body)
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("decoded", &self.decoded)
            .finish_non_exhaustive()
    }
}
