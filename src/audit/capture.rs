//! Body tees that feed the audit record while bodies are relayed.

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_LENGTH;
use http::Method;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use crate::audit::dumper::{AuditLog, AuditRecord, BodyRecord, RequestRecord, ResponseHead};
use crate::http::request::ExchangeId;

/// First `limit` bytes of a body, plus how much was seen in total.
#[derive(Debug)]
pub struct CappedBuffer {
    bytes: BytesMut,
    limit: usize,
    seen: u64,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            limit,
            seen: 0,
            truncated: false,
        }
    }

    pub fn push(&mut self, data: &Bytes) {
        self.seen += data.len() as u64;
        let room = self.limit.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn snapshot(&self, complete: bool) -> BodyRecord {
        BodyRecord::Captured {
            bytes: Bytes::copy_from_slice(&self.bytes),
            truncated: self.truncated,
            complete,
        }
    }

    /// Take the captured bytes, leaving the buffer empty.
    pub fn take(&mut self, complete: bool) -> BodyRecord {
        BodyRecord::Captured {
            bytes: std::mem::take(&mut self.bytes).freeze(),
            truncated: self.truncated,
            complete,
        }
    }
}

/// Capped copy of a request body streamed upstream.
///
/// One clone feeds from the outbound [`RequestTee`], another travels with the
/// audit record and is read when the record is written.
#[derive(Debug, Clone)]
pub struct RequestCapture {
    inner: Arc<Mutex<RequestCaptureState>>,
}

#[derive(Debug)]
struct RequestCaptureState {
    buffer: CappedBuffer,
    finished: bool,
}

impl RequestCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RequestCaptureState {
                buffer: CappedBuffer::new(limit),
                finished: false,
            })),
        }
    }

    pub fn push(&self, data: &Bytes) {
        self.lock().buffer.push(data);
    }

    /// The body reached its end.
    pub fn finish(&self) {
        self.lock().finished = true;
    }

    /// The body as captured so far.
    pub fn snapshot(&self) -> BodyRecord {
        let state = self.lock();
        state.buffer.snapshot(state.finished)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestCaptureState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An exchange whose record is written once its response body is done.
///
/// The record is written exactly once: when the body reaches its end, when it
/// fails, or when the body is dropped by the connection.
pub struct PendingRecord {
    log: Arc<AuditLog>,
    exchange: ExchangeId,
    request: RequestRecord,
    response: ResponseHead,
    captured: CappedBuffer,
    written: bool,
}

impl PendingRecord {
    pub fn new(
        log: Arc<AuditLog>,
        exchange: ExchangeId,
        request: RequestRecord,
        response: ResponseHead,
    ) -> Self {
        let captured = CappedBuffer::new(log.max_body_bytes());
        Self {
            log,
            exchange,
            request,
            response,
            captured,
            written: false,
        }
    }

    fn capture(&mut self, data: &Bytes) {
        self.captured.push(data);
    }

    /// Whether the bytes relayed so far account for the whole body.
    ///
    /// Used when the connection stops polling without observing the end of
    /// stream, which happens once a length-delimited body has been written.
    fn looks_complete(&self) -> bool {
        let status = self.response.status;
        if self.request.method == Method::HEAD
            || status.is_informational()
            || status == http::StatusCode::NO_CONTENT
            || status == http::StatusCode::NOT_MODIFIED
        {
            return true;
        }

        self.response
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .is_some_and(|expected| expected == self.captured.seen())
    }

    fn finish(&mut self, complete: bool) {
        if self.written {
            return;
        }
        self.written = true;

        let record = AuditRecord {
            exchange: self.exchange,
            request: self.request.clone(),
            response: self.response.clone(),
            body: self.captured.take(complete),
        };
        self.log.dump(&record);
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if !self.written {
            let complete = self.looks_complete();
            self.finish(complete);
        }
    }
}

pin_project! {
    /// Streams a request body upstream while copying it into a [`RequestCapture`].
    pub struct RequestTee<B> {
        #[pin]
        inner: B,
        capture: RequestCapture,
    }
}

impl<B> RequestTee<B> {
    pub fn new(inner: B, capture: RequestCapture) -> Self {
        Self { inner, capture }
    }
}

impl<B> Body for RequestTee<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let frame = ready!(this.inner.as_mut().poll_frame(cx));
        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.push(data);
                }
                if this.inner.is_end_stream() {
                    this.capture.finish();
                }
            }
            Some(Err(_)) => {}
            None => this.capture.finish(),
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Relays frames unchanged while copying data frames into a [`PendingRecord`].
    pub struct CaptureBody<B> {
        #[pin]
        inner: B,
        pending: PendingRecord,
    }
}

impl<B> CaptureBody<B> {
    pub fn new(inner: B, pending: PendingRecord) -> Self {
        Self { inner, pending }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        match ready!(this.inner.as_mut().poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.pending.capture(data);
                }
                if this.inner.is_end_stream() {
                    this.pending.finish(true);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(error)) => {
                this.pending.finish(false);
                Poll::Ready(Some(Err(error)))
            }
            None => {
                this.pending.finish(true);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::dumper::tests::{request, response, SharedSink};
    use crate::http::body::{from_stream, ProxyBody};
    use futures_util::stream;
    use http::HeaderValue;
    use http_body_util::BodyExt;
    use std::io;

    fn chunks(parts: Vec<io::Result<Bytes>>) -> ProxyBody {
        from_stream(Box::pin(stream::iter(parts)))
    }

    struct Written {
        sink: SharedSink,
        log: Arc<AuditLog>,
    }

    impl Written {
        fn contents(&self) -> String {
            self.log.flush();
            self.sink.contents()
        }
    }

    fn setup(max: usize, head: ResponseHead) -> (Written, PendingRecord) {
        let sink = SharedSink::default();
        let log = Arc::new(AuditLog::new(sink.clone(), max));
        let pending = PendingRecord::new(Arc::clone(&log), ExchangeId::new(), request(), head);
        (Written { sink, log }, pending)
    }

    #[test]
    fn capped_buffer_keeps_prefix_and_counts_all() {
        let mut buffer = CappedBuffer::new(5);
        buffer.push(&Bytes::from_static(b"abc"));
        buffer.push(&Bytes::from_static(b"defg"));
        buffer.push(&Bytes::from_static(b"hij"));
        assert_eq!(buffer.seen(), 10);
        assert_eq!(
            buffer.take(true),
            BodyRecord::Captured {
                bytes: Bytes::from_static(b"abcde"),
                truncated: true,
                complete: true,
            }
        );
    }

    #[test]
    fn capped_buffer_at_exact_limit_is_not_truncated() {
        let mut buffer = CappedBuffer::new(4);
        buffer.push(&Bytes::from_static(b"abcd"));
        buffer.push(&Bytes::new());
        assert_eq!(
            buffer.take(false),
            BodyRecord::Captured {
                bytes: Bytes::from_static(b"abcd"),
                truncated: false,
                complete: false,
            }
        );
    }

    #[test]
    fn request_capture_is_shared_between_clones() {
        let capture = RequestCapture::new(3);
        let tee = capture.clone();
        tee.push(&Bytes::from_static(b"q=12345"));
        assert!(matches!(
            capture.snapshot(),
            BodyRecord::Captured { complete: false, truncated: true, .. }
        ));

        let capture = RequestCapture::new(16);
        let tee = capture.clone();
        tee.push(&Bytes::from_static(b"q=1"));
        tee.finish();
        assert_eq!(
            capture.snapshot(),
            BodyRecord::Captured {
                bytes: Bytes::from_static(b"q=1"),
                truncated: false,
                complete: true,
            }
        );
    }

    #[tokio::test]
    async fn relays_and_records_whole_body() {
        let (sink, pending) = setup(1024, response("text/html"));
        let body = chunks(vec![Ok(Bytes::from_static(b"<p>")), Ok(Bytes::from_static(b"hi</p>"))]);

        let relayed = CaptureBody::new(body, pending).collect().await.unwrap().to_bytes();
        assert_eq!(&relayed[..], b"<p>hi</p>");

        let text = sink.contents();
        assert!(text.contains("\n<p>hi</p>\n"));
        assert!(!text.contains("[body"));
        assert_eq!(text.matches("exchange: ").count(), 1);
    }

    #[tokio::test]
    async fn caps_recorded_copy_but_relays_everything() {
        let (sink, pending) = setup(4, response("text/plain"));
        let body = chunks(vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"defgh"))]);

        let relayed = CaptureBody::new(body, pending).collect().await.unwrap().to_bytes();
        assert_eq!(&relayed[..], b"abcdefgh");

        let text = sink.contents();
        assert!(text.contains("\nabcd\n[body truncated after 4 bytes]\n"));
        assert!(!text.contains("[body incomplete]"));
    }

    #[tokio::test]
    async fn stream_error_records_incomplete_body() {
        let (sink, pending) = setup(1024, response("text/plain"));
        let body = chunks(vec![
            Ok(Bytes::from_static(b"part")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);

        assert!(CaptureBody::new(body, pending).collect().await.is_err());
        let text = sink.contents();
        assert!(text.contains("\npart\n[body incomplete]\n"));
    }

    #[tokio::test]
    async fn dropped_body_is_recorded_once() {
        let mut head = response("text/plain");
        head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4"));
        let (sink, pending) = setup(1024, head);
        let body = chunks(vec![Ok(Bytes::from_static(b"full")), Ok(Bytes::from_static(b"more"))]);

        let mut capture = CaptureBody::new(body, pending);
        let frame = capture.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"full"));
        drop(capture);

        let text = sink.contents();
        assert_eq!(text.matches("exchange: ").count(), 1);
        assert!(text.contains("\nfull\n"));
        assert!(!text.contains("[body incomplete]"));
    }

    #[tokio::test]
    async fn dropped_short_body_is_incomplete() {
        let mut head = response("text/plain");
        head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        let (sink, pending) = setup(1024, head);
        drop(CaptureBody::new(chunks(vec![]), pending));

        assert!(sink.contents().contains("[body incomplete]"));
    }

    #[tokio::test]
    async fn request_tee_streams_everything_and_caps_the_copy() {
        let capture = RequestCapture::new(8);
        let parts = (0..100).map(|_| Ok(Bytes::from(vec![b'a'; 1000]))).collect();
        let tee = RequestTee::new(chunks(parts), capture.clone());

        let forwarded = tee.collect().await.unwrap().to_bytes();
        assert_eq!(forwarded.len(), 100_000);
        assert_eq!(
            capture.snapshot(),
            BodyRecord::Captured {
                bytes: Bytes::from_static(b"aaaaaaaa"),
                truncated: true,
                complete: true,
            }
        );
    }

    #[tokio::test]
    async fn request_tee_error_leaves_body_unfinished() {
        let capture = RequestCapture::new(64);
        let body = chunks(vec![
            Ok(Bytes::from_static(b"half")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        assert!(RequestTee::new(body, capture.clone()).collect().await.is_err());
        assert!(matches!(
            capture.snapshot(),
            BodyRecord::Captured { complete: false, truncated: false, .. }
        ));
    }
}
