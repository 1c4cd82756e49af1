//! HTTP proxying subsystem.
//!
//! # Data Flow
//! ```text
//! client connection
//!     → server.rs (hyper HTTP/1.1, upgrades enabled)
//!     → dispatch.rs (CONNECT → intercept::Interceptor, everything else → forward.rs)
//!     → forward.rs (absolute target, one outbound round-trip via client.rs)
//!     → headers.rs (strip hop-by-hop headers)
//!     → normalize.rs (gzip decoding, fail open)
//!     → audit::AuditLog::observe (tee into the audit record)
//!     → streamed back to the client
//! ```

pub mod body;
pub mod client;
pub mod dispatch;
pub mod forward;
pub mod headers;
pub mod normalize;
pub mod request;
pub mod response;
pub mod server;

pub use body::{BodyStream, BoxError, ProxyBody};
pub use client::{build_client, ClientError};
pub use dispatch::{DispatchError, Dispatcher};
pub use forward::{ForwardError, Forwarder};
pub use headers::{sanitize, HOP_BY_HOP_HEADERS};
pub use normalize::normalize;
pub use request::ExchangeId;
pub use response::OriginResponse;
pub use server::{ProxyServer, ServerError};
