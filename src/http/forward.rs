//! Forwarding engine: one outbound round-trip per inbound request.
//!
//! # Responsibilities
//! - Resolve the request target to an absolute URL
//! - Re-issue the request over the shared client (direct or via upstream proxy),
//!   streaming the request body rather than buffering it
//! - Sanitize and normalize the origin response, attach the audit tee
//!
//! There is no retry. A transport failure is returned to the connection,
//! which closes without writing a response.

use bytes::Bytes;
use http::header::EXPECT;
use http::request::Parts;
use http::uri::{Authority, Scheme};
use http::{Request, Response, StatusCode, Uri};
use http_body::Body;
use http_body_util::BodyDataStream;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::audit::{AuditLog, RequestCapture, RequestRecord, RequestTee, ResponseHead};
use crate::config::TransportConfig;
use crate::http::body::{self, BoxError, ProxyBody};
use crate::http::client::{build_client, ClientError};
use crate::http::headers::sanitize;
use crate::http::normalize::normalize;
use crate::http::request::{absolute_uri, tunnel_uri, ExchangeId};
use crate::http::response::OriginResponse;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request target `{0}` cannot be forwarded")]
    InvalidTarget(String),

    #[error("upstream request to {target} failed")]
    Transport {
        target: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Settle a forwarding outcome for the connection.
///
/// An unusable target is answered with `400`; every other error closes the
/// connection without a response.
pub fn respond(
    result: Result<Response<ProxyBody>, ForwardError>,
) -> Result<Response<ProxyBody>, ForwardError> {
    match result {
        Err(ForwardError::InvalidTarget(target)) => {
            tracing::warn!(uri = %target, "Rejecting request with unusable target");
            let mut response = Response::new(body::empty());
            *response.status_mut() = StatusCode::BAD_REQUEST;
            Ok(response)
        }
        other => other,
    }
}

/// Shared by every connection; cloning is cheap.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    audit: Arc<AuditLog>,
}

impl Forwarder {
    pub fn new(config: &TransportConfig, audit: Arc<AuditLog>) -> Result<Self, ClientError> {
        Ok(Self::with_client(build_client(config)?, audit))
    }

    pub fn with_client(client: reqwest::Client, audit: Arc<AuditLog>) -> Self {
        Self { client, audit }
    }

    /// Forward a plain proxy request (absolute-form, or origin-form with `Host`).
    pub async fn forward<B>(&self, request: Request<B>) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();
        let target = absolute_uri(&parts);
        self.round_trip(parts, target, body).await
    }

    /// Forward a request read inside a CONNECT tunnel to `authority`.
    pub async fn forward_tunneled<B>(
        &self,
        scheme: Scheme,
        authority: &Authority,
        request: Request<B>,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();
        let target = tunnel_uri(&parts.uri, scheme, authority);
        self.round_trip(parts, target, body).await
    }

    async fn round_trip<B>(
        &self,
        parts: Parts,
        target: Option<Uri>,
        body: B,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let exchange = ExchangeId::new();
        let method = parts.method.clone();

        let (target, url) = target
            .filter(|uri| matches!(uri.scheme_str(), Some("http" | "https")))
            .and_then(|uri| {
                let url = reqwest::Url::parse(&uri.to_string()).ok()?;
                Some((uri, url))
            })
            .ok_or_else(|| ForwardError::InvalidTarget(parts.uri.to_string()))?;

        tracing::debug!(exchange = %exchange, method = %method, url = %url, "Forwarding request");

        let mut headers = parts.headers;
        sanitize(&mut headers);
        headers.remove(EXPECT);

        let capture = RequestCapture::new(self.audit.max_body_bytes());
        let mut outbound = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if body.is_end_stream() {
            capture.finish();
        } else {
            let tee = RequestTee::new(body, capture.clone());
            outbound = outbound.body(reqwest::Body::wrap_stream(BodyDataStream::new(tee)));
        }

        let started = Instant::now();
        let sent = outbound.send().await;

        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(source) => {
                metrics::counter!("proxy_upstream_errors_total", "method" => method.to_string())
                    .increment(1);
                tracing::error!(
                    exchange = %exchange,
                    method = %method,
                    url = %url,
                    error = %source,
                    "Upstream request failed"
                );
                return Err(ForwardError::Transport {
                    target: url.to_string(),
                    source,
                });
            }
        };
        metrics::histogram!("proxy_upstream_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let mut origin = OriginResponse::from_upstream(upstream);
        sanitize(&mut origin.headers);
        let origin = normalize(origin).await;

        metrics::counter!(
            "proxy_exchanges_total",
            "method" => method.to_string(),
            "status" => origin.status.as_u16().to_string()
        )
        .increment(1);
        if origin.decoded {
            metrics::counter!("proxy_decoded_responses_total").increment(1);
        }
        tracing::debug!(
            exchange = %exchange,
            method = %method,
            url = %url,
            status = origin.status.as_u16(),
            content_type = origin.content_type().unwrap_or("-"),
            decoded = origin.decoded,
            "Relaying response"
        );

        let OriginResponse {
            status,
            version,
            headers: response_headers,
            body: stream,
            ..
        } = origin;

        let relayed = self.audit.observe(
            exchange,
            RequestRecord {
                method,
                uri: target,
                version: parts.version,
                headers,
                body: capture,
            },
            ResponseHead {
                status,
                version,
                headers: response_headers.clone(),
            },
            body::from_stream(stream),
        );

        let mut response = Response::new(relayed);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}
