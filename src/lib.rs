//! Intercepting HTTP/HTTPS forward proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────────────────────────────────────────┐
//!                 │                      FORWARD PROXY                        │
//!                 │                                                           │
//!  Client ───────▶│  net::Listener ─▶ http::server ─▶ http::dispatch          │
//!                 │                                     │          │          │
//!                 │                           CONNECT   │          │ other    │
//!                 │                                     ▼          ▼          │
//!                 │                         intercept::Interceptor  http::forward ──┼──▶ Origin
//!                 │                           (TLS, per-host certs)   │   ▲     │    (or upstream
//!                 │                                     └─TunnelHandler┘   │     │     proxy)
//!                 │                                                   │    │     │
//!                 │                      http::headers ◀── response ◀─┘    │     │
//!                 │                      http::normalize (gzip)            │     │
//!                 │                      audit::AuditLog (tee + dump) ─────┘     │
//!  Client ◀───────│                                                           │
//!                 └───────────────────────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod config;
pub mod http;
pub mod intercept;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use audit::AuditLog;
pub use config::schema::ProxyConfig;
pub use http::ProxyServer;
pub use intercept::{Interceptor, TlsInterceptor, TunnelHandler};
pub use lifecycle::Shutdown;
