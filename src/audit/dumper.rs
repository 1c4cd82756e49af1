//! Human-readable audit records and the writer thread that owns the sink.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use crate::audit::capture::{CaptureBody, PendingRecord, RequestCapture};
use crate::config::AuditConfig;
use crate::http::body::ProxyBody;
use crate::http::request::ExchangeId;
use http_body_util::BodyExt;

/// Response bodies of these media types are never copied into a record.
pub const SUPPRESSED_CONTENT_TYPES: [&str; 6] = [
    "application/octet-stream",
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/x-icon",
    "font/woff",
];

/// Rendered records waiting for the writer thread.
pub const RECORD_QUEUE_CAPACITY: usize = 1024;

const SEPARATOR: &str = "----- ------ ----- ----- ----- -----";

/// The suppressed media type of a response, parameters ignored, matched case-sensitively.
pub fn suppressed_content_type(headers: &HeaderMap) -> Option<&'static str> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let media_type = value.split(';').next().unwrap_or_default().trim();
    SUPPRESSED_CONTENT_TYPES
        .iter()
        .copied()
        .find(|suppressed| *suppressed == media_type)
}

/// The request as it was sent upstream.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Capped copy of the streamed request body, read when the record is written.
    pub body: RequestCapture,
}

/// Status line and headers of the relayed (sanitized, maybe decoded) response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRecord {
    Captured {
        bytes: Bytes,
        /// More bytes were relayed than the capture limit allowed.
        truncated: bool,
        /// The body was relayed to its end.
        complete: bool,
    },
    Omitted(&'static str),
}

/// One request/response exchange, ready to be written.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub exchange: ExchangeId,
    pub request: RequestRecord,
    pub response: ResponseHead,
    pub body: BodyRecord,
}

impl AuditRecord {
    /// Render the full record up front so it reaches the sink as a single write.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        line(&mut out, SEPARATOR);
        line(&mut out, &format!("exchange: {}", self.exchange));

        let request = &self.request;
        line(
            &mut out,
            &format!("{} {} {:?}", request.method, request.uri, request.version),
        );
        headers(&mut out, &request.headers);
        line(&mut out, "");
        body(&mut out, &request.body.snapshot());
        line(&mut out, "");

        let response = &self.response;
        line(
            &mut out,
            &format!(
                "{:?} {} {}",
                response.version,
                response.status.as_u16(),
                response.status.canonical_reason().unwrap_or_default()
            ),
        );
        headers(&mut out, &response.headers);
        line(&mut out, "");
        body(&mut out, &self.body);
        line(&mut out, "");
        out
    }
}

fn line(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
    out.push(b'\n');
}

fn headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
}

fn body(out: &mut Vec<u8>, record: &BodyRecord) {
    match record {
        BodyRecord::Omitted(content_type) => {
            line(out, &format!("[body omitted: {}]", content_type));
        }
        BodyRecord::Captured {
            bytes,
            truncated,
            complete,
        } => {
            if !bytes.is_empty() {
                out.extend_from_slice(bytes);
                line(out, "");
            }
            if *truncated {
                line(out, &format!("[body truncated after {} bytes]", bytes.len()));
            }
            if !complete {
                line(out, "[body incomplete]");
            }
        }
    }
}

enum Message {
    Record { exchange: ExchangeId, bytes: Vec<u8> },
    Flush(SyncSender<()>),
}

/// Drain the queue into the sink until every sender is gone.
fn spawn_writer(
    mut sink: Box<dyn Write + Send>,
    capacity: usize,
) -> io::Result<SyncSender<Message>> {
    let (queue, records) = mpsc::sync_channel(capacity);
    thread::Builder::new()
        .name("audit-writer".to_string())
        .spawn(move || {
            for message in records {
                match message {
                    Message::Record { exchange, bytes } => {
                        if let Err(error) = sink.write_all(&bytes).and_then(|()| sink.flush()) {
                            tracing::warn!(%exchange, %error, "Failed to write audit record");
                        }
                    }
                    Message::Flush(done) => {
                        let _ = sink.flush();
                        let _ = done.send(());
                    }
                }
            }
        })?;
    Ok(queue)
}

/// The audit stream.
///
/// One instance is owned by the process and shared with every handler.
/// Handlers only render records and hand them to a bounded queue; a
/// dedicated thread owns the sink and writes one record at a time, so
/// records never interleave and a slow sink never blocks a runtime worker.
/// When the queue is full the record is dropped and counted.
pub struct AuditLog {
    queue: Option<SyncSender<Message>>,
    max_body_bytes: usize,
    dropped: AtomicU64,
}

impl AuditLog {
    pub fn new<W>(sink: W, max_body_bytes: usize) -> Self
    where
        W: Write + Send + 'static,
    {
        Self::with_queue(sink, max_body_bytes, RECORD_QUEUE_CAPACITY)
    }

    pub fn with_queue<W>(sink: W, max_body_bytes: usize, capacity: usize) -> Self
    where
        W: Write + Send + 'static,
    {
        match spawn_writer(Box::new(sink), capacity) {
            Ok(queue) => Self {
                queue: Some(queue),
                max_body_bytes,
                dropped: AtomicU64::new(0),
            },
            Err(error) => {
                tracing::error!(%error, "Failed to start audit writer, audit disabled");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            queue: None,
            max_body_bytes: 0,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AuditConfig) -> io::Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        match &config.path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                tracing::info!(path = %path.display(), "Writing audit records to file");
                Ok(Self::new(file, config.max_body_bytes))
            }
            None => Ok(Self::new(io::stdout(), config.max_body_bytes)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Records dropped because the writer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue one record. Never blocks.
    pub fn dump(&self, record: &AuditRecord) {
        let Some(queue) = &self.queue else {
            return;
        };

        let message = Message::Record {
            exchange: record.exchange,
            bytes: record.render(),
        };
        match queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("proxy_audit_dropped_total").increment(1);
                tracing::warn!(exchange = %record.exchange, "Audit queue full, record dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!(exchange = %record.exchange, "Audit writer stopped, record dropped");
            }
        }
    }

    /// Block until every record queued so far has been written.
    pub fn flush(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let (done, wait) = mpsc::sync_channel(1);
        if queue.send(Message::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }

    /// Attach the audit side channel to a response body about to be relayed.
    ///
    /// Suppressed content types are recorded immediately without their body.
    /// Otherwise the returned body tees a capped copy of every frame and
    /// writes the record once the client-bound stream ends or is dropped.
    pub fn observe(
        self: &Arc<Self>,
        exchange: ExchangeId,
        request: RequestRecord,
        response: ResponseHead,
        body: ProxyBody,
    ) -> ProxyBody {
        if !self.is_enabled() {
            return body;
        }

        if let Some(content_type) = suppressed_content_type(&response.headers) {
            self.dump(&AuditRecord {
                exchange,
                request,
                response,
                body: BodyRecord::Omitted(content_type),
            });
            return body;
        }

        let pending = PendingRecord::new(Arc::clone(self), exchange, request, response);
        CaptureBody::new(body, pending).boxed_unsync()
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("enabled", &self.is_enabled())
            .field("max_body_bytes", &self.max_body_bytes)
            .field("dropped", &self.dropped())
            .finish()
    }
}
