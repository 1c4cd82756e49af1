//! CONNECT tunnel interception.
//!
//! After the dispatcher has answered a CONNECT with `200` and the connection
//! has been upgraded, the raw client stream is handed to an [`Interceptor`].
//! The interceptor terminates whatever protocol the client speaks inside the
//! tunnel (TLS, in [`TlsInterceptor`]) and serves the plaintext requests
//! through a [`TunnelHandler`], which forwards each one to the tunnel target.

pub mod tls;

use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::body::ProxyBody;
use crate::http::forward::{respond, ForwardError, Forwarder};

pub use tls::{CertificateAuthority, TlsInterceptor};

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("TLS handshake with client failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("failed to serve tunneled connection: {0}")]
    Serve(#[from] hyper::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Terminates the client side of a CONNECT tunnel.
pub trait Interceptor: Send + Sync + 'static {
    /// Take over an upgraded client connection.
    ///
    /// Returning an error closes the tunnel; the dispatcher logs it with the
    /// tunnel authority.
    fn intercept(
        &self,
        client: TokioIo<Upgraded>,
        handler: TunnelHandler,
    ) -> impl Future<Output = Result<(), InterceptError>> + Send;
}

/// Per-tunnel callback: the forwarding engine bound to the CONNECT authority.
#[derive(Clone)]
pub struct TunnelHandler {
    forwarder: Forwarder,
    authority: Authority,
}

impl TunnelHandler {
    pub fn new(forwarder: Forwarder, authority: Authority) -> Self {
        Self {
            forwarder,
            authority,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    /// Forward one request read from inside the tunnel.
    pub async fn handle<B>(
        &self,
        scheme: Scheme,
        request: Request<B>,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<crate::http::body::BoxError>,
    {
        respond(
            self.forwarder
                .forward_tunneled(scheme, &self.authority, request)
                .await,
        )
    }

    /// Serve HTTP/1.1 over an already-plaintext stream until the client closes it.
    pub async fn serve<S>(self, io: S, scheme: Scheme) -> Result<(), InterceptError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |request: Request<Incoming>| {
            let handler = self.clone();
            let scheme = scheme.clone();
            async move { handler.handle(scheme, request).await }
        });

        hyper::server::conn::http1::Builder::new()
            .title_case_headers(true)
            .serve_connection(TokioIo::new(io), service)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for TunnelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandler")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}
