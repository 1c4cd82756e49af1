//! Body types shared by the forwarding path.

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body::Frame;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, StreamBody};
use std::io;
use std::pin::Pin;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body relayed to the client.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Raw byte stream of an origin response, possibly wrapped by the normalizer.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Adapt a byte stream into a frame-level body, streamed until EOF.
pub fn from_stream(stream: BodyStream) -> ProxyBody {
    let frames = stream
        .map_ok(Frame::data)
        .map_err(|err| -> BoxError { Box::new(err) });
    StreamBody::new(frames).boxed_unsync()
}
