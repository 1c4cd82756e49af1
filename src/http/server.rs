//! Proxy server: accept loop and per-connection HTTP/1.1 serving.
//!
//! # Responsibilities
//! - Accept connections from the bounded listener
//! - Serve each one on its own task, with upgrades enabled for CONNECT
//! - Stop accepting on shutdown and drain in-flight connections

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::audit::AuditLog;
use crate::config::ProxyConfig;
use crate::http::client::ClientError;
use crate::http::dispatch::Dispatcher;
use crate::http::forward::Forwarder;
use crate::intercept::Interceptor;
use crate::net::{ConnectionPermit, ConnectionTracker, Listener, ListenerError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// The forward proxy.
pub struct ProxyServer<I> {
    dispatcher: Dispatcher<I>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl<I: Interceptor> ProxyServer<I> {
    pub fn new(
        config: &ProxyConfig,
        interceptor: I,
        audit: Arc<AuditLog>,
    ) -> Result<Self, ServerError> {
        let transport = &config.transport;
        tracing::info!(
            upstream_proxy = transport.upstream_proxy.as_deref().unwrap_or("direct"),
            dial_timeout = ?transport.dial_timeout(),
            tls_handshake_timeout = ?transport.tls_handshake_timeout(),
            keep_alive = ?transport.keep_alive(),
            audit_enabled = audit.is_enabled(),
            "Configuring outbound transport"
        );

        let forwarder = Forwarder::new(transport, audit)?;
        let tracker = ConnectionTracker::new();
        let dispatcher = Dispatcher::new(forwarder, Arc::new(interceptor), tracker.clone());

        Ok(Self {
            dispatcher,
            tracker,
            drain_timeout: config.listener.drain_timeout(),
        })
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve until `shutdown` fires, then drain in-flight connections.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        if let Ok(address) = listener.local_addr() {
            tracing::info!(address = %address, "Proxy server started");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.spawn_connection(stream, peer, permit),
                    Err(ListenerError::Accept(error)) => {
                        tracing::warn!(%error, "Failed to accept connection");
                    }
                    Err(error) => return Err(error.into()),
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, "Draining connections");
        }
        if !self.tracker.drain(self.drain_timeout).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let dispatcher = self.dispatcher.clone();
        let guard = self.tracker.track();

        tokio::spawn(async move {
            let _permit = permit;
            let service = service_fn(move |request: Request<Incoming>| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(request).await }
            });

            // A service error closes the connection without writing a response.
            if let Err(error) = http1::Builder::new()
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                tracing::debug!(
                    connection_id = %guard.id(),
                    peer_addr = %peer,
                    %error,
                    "Connection closed with error"
                );
            }
        });
    }
}
