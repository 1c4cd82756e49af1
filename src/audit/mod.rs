//! Audit stream: one human-readable record per proxied exchange.
//!
//! Records are rendered whole and written by a single writer thread so
//! concurrent exchanges never interleave. Binary media types are recorded
//! without their body.

pub mod capture;
pub mod dumper;

pub use capture::{CappedBuffer, CaptureBody, PendingRecord, RequestCapture, RequestTee};
pub use dumper::{
    suppressed_content_type, AuditLog, AuditRecord, BodyRecord, RequestRecord, ResponseHead,
    RECORD_QUEUE_CAPACITY, SUPPRESSED_CONTENT_TYPES,
};
