//! Request classification: plain proxy requests versus CONNECT tunnels.

use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use thiserror::Error;

use crate::http::body::{self, ProxyBody};
use crate::http::forward::{respond, ForwardError, Forwarder};
use crate::intercept::{Interceptor, TunnelHandler};
use crate::net::ConnectionTracker;

/// Errors that end a client connection without a response.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("CONNECT request without an authority target: {0}")]
    MissingAuthority(String),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// Routes every inbound request. Cloned into each connection's service.
pub struct Dispatcher<I> {
    forwarder: Forwarder,
    interceptor: Arc<I>,
    tracker: ConnectionTracker,
}

impl<I> Clone for Dispatcher<I> {
    fn clone(&self) -> Self {
        Self {
            forwarder: self.forwarder.clone(),
            interceptor: Arc::clone(&self.interceptor),
            tracker: self.tracker.clone(),
        }
    }
}

impl<I: Interceptor> Dispatcher<I> {
    pub fn new(forwarder: Forwarder, interceptor: Arc<I>, tracker: ConnectionTracker) -> Self {
        Self {
            forwarder,
            interceptor,
            tracker,
        }
    }

    /// CONNECT opens a tunnel; every other method is forwarded.
    pub async fn dispatch(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        if request.method() == Method::CONNECT {
            return self.tunnel(request);
        }
        Ok(respond(self.forwarder.forward(request).await)?)
    }

    /// Answer `200` and hand the upgraded stream to the interceptor.
    fn tunnel(&self, request: Request<Incoming>) -> Result<Response<ProxyBody>, DispatchError> {
        let Some(authority) = request.uri().authority().cloned() else {
            tracing::warn!(uri = %request.uri(), "CONNECT without authority");
            return Err(DispatchError::MissingAuthority(request.uri().to_string()));
        };

        tracing::debug!(authority = %authority, "Opening tunnel");
        metrics::counter!("proxy_tunnels_total").increment(1);

        let handler = TunnelHandler::new(self.forwarder.clone(), authority.clone());
        let interceptor = Arc::clone(&self.interceptor);
        let guard = self.tracker.track();

        tokio::spawn(async move {
            let _guard = guard;
            let upgraded = match hyper::upgrade::on(request).await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    tracing::warn!(authority = %authority, %error, "Tunnel upgrade failed");
                    return;
                }
            };

            if let Err(error) = interceptor.intercept(TokioIo::new(upgraded), handler).await {
                metrics::counter!("proxy_interception_errors_total").increment(1);
                tracing::warn!(authority = %authority, %error, "Tunnel interception failed");
            }
        });

        Ok(Response::new(body::empty()))
    }
}
