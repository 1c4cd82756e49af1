//! Transparent content-encoding normalization.
//!
//! A gzip response is decoded so the audit stream and the client see the
//! plain bytes. The decoder is only installed once the gzip preamble checks
//! out; anything else fails open and the original bytes go through untouched.

use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::HeaderMap;
use std::io;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::http::body::BodyStream;
use crate::http::response::OriginResponse;

/// Magic bytes, method, and flags of the fixed gzip header (RFC 1952).
const GZIP_HEADER_LEN: usize = 10;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DEFLATE_METHOD: u8 = 8;
const RESERVED_FLAGS: u8 = 0xe0;

/// Decode a gzip body for inspection, or return the response unchanged.
pub async fn normalize(mut response: OriginResponse) -> OriginResponse {
    if !is_gzip(&response.headers) {
        return response;
    }

    let preamble = Preamble::read(&mut response.body).await;
    let valid = preamble.is_gzip();
    let replayed = preamble.replay(response.body);

    if !valid {
        tracing::debug!(
            status = %response.status,
            "Gzip preamble rejected, forwarding encoded body"
        );
        response.body = replayed;
        return response;
    }

    let mut decoder = GzipDecoder::new(StreamReader::new(replayed));
    decoder.multiple_members(true);

    response.body = Box::pin(ReaderStream::new(decoder));
    response.headers.remove(CONTENT_ENCODING);
    response.headers.remove(CONTENT_LENGTH);
    response.decoded = true;
    response
}

/// True when the response declares exactly the single coding `gzip`.
pub fn is_gzip(headers: &HeaderMap) -> bool {
    let mut codings = headers.get_all(CONTENT_ENCODING).iter();
    match (codings.next(), codings.next()) {
        (Some(value), None) => value
            .to_str()
            .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
            .unwrap_or(false),
        _ => false,
    }
}

/// Leading chunks read off the body to inspect the gzip header.
struct Preamble {
    chunks: Vec<Bytes>,
    error: Option<io::Error>,
}

impl Preamble {
    async fn read(body: &mut BodyStream) -> Self {
        let mut chunks = Vec::new();
        let mut len = 0;
        let mut error = None;

        while len < GZIP_HEADER_LEN {
            match body.next().await {
                Some(Ok(chunk)) => {
                    len += chunk.len();
                    chunks.push(chunk);
                }
                Some(Err(err)) => {
                    error = Some(err);
                    break;
                }
                None => break,
            }
        }

        Self { chunks, error }
    }

    fn is_gzip(&self) -> bool {
        if self.error.is_some() {
            return false;
        }

        let header: Vec<u8> = self
            .chunks
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .take(GZIP_HEADER_LEN)
            .collect();

        header.len() == GZIP_HEADER_LEN
            && header[..2] == GZIP_MAGIC
            && header[2] == DEFLATE_METHOD
            && header[3] & RESERVED_FLAGS == 0
    }

    /// Put the consumed bytes (and any read error) back in front of the rest.
    fn replay(self, rest: BodyStream) -> BodyStream {
        let head = self
            .chunks
            .into_iter()
            .map(Ok)
            .chain(self.error.map(Err));
        Box::pin(stream::iter(head).chain(rest))
    }
}
