//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, written to stderr)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stderr)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Logs go to stderr so the audit stream on stdout stays parseable
//! - Exchange ids flow through logs and audit records alike
//! - Metrics are cheap (atomic increments) and recorded even when not exported

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
