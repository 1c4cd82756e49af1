//! Shared utilities for integration tests: raw-TCP origins and in-process proxies.
#![allow(dead_code)]

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use forward_proxy::config::ProxyConfig;
use forward_proxy::intercept::{InterceptError, Interceptor, TunnelHandler};
use forward_proxy::net::Listener;
use forward_proxy::{AuditLog, ProxyServer, Shutdown};
use http::uri::Scheme;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Build a raw HTTP/1.1 response. `Connection: close` keeps pooled
/// connections from being reused against a socket the origin already closed.
pub fn raw_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status).into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}

/// Start an origin answering every connection with `response`.
///
/// Each received request (head and body) is sent on the returned channel.
pub async fn start_origin(response: Vec<u8>) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let response = response.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(request) = read_request(&mut socket).await {
                    let _ = tx.send(request);
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });

    (addr, rx)
}

async fn read_request(socket: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Serves tunneled requests as plaintext HTTP, standing in for TLS termination.
pub struct LoopbackInterceptor;

impl Interceptor for LoopbackInterceptor {
    async fn intercept(
        &self,
        client: TokioIo<Upgraded>,
        handler: TunnelHandler,
    ) -> Result<(), InterceptError> {
        handler.serve(client, Scheme::HTTP).await
    }
}

/// Refuses every tunnel, like a certificate that cannot be issued.
pub struct FailingInterceptor;

impl Interceptor for FailingInterceptor {
    async fn intercept(
        &self,
        _client: TokioIo<Upgraded>,
        handler: TunnelHandler,
    ) -> Result<(), InterceptError> {
        Err(InterceptError::Certificate(format!(
            "cannot issue certificate for {}",
            handler.host()
        )))
    }
}

/// Audit sink the test can read back.
#[derive(Clone, Default)]
pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Wait until the sink contains `needle`; records are written when the body ends.
    pub async fn wait_for(&self, needle: &str) -> String {
        for _ in 0..100 {
            let contents = self.contents();
            if contents.contains(needle) {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("audit output never contained {needle:?}:\n{}", self.contents());
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn audit_log(sink: &SharedSink) -> Arc<AuditLog> {
    Arc::new(AuditLog::new(sink.clone(), 1 << 20))
}

/// Run a proxy on an ephemeral port until the returned `Shutdown` fires.
pub async fn start_proxy<I: Interceptor>(
    config: ProxyConfig,
    interceptor: I,
    audit: Arc<AuditLog>,
) -> (SocketAddr, Shutdown) {
    let server = ProxyServer::new(&config, interceptor, audit).unwrap();
    let listener = Listener::from_tcp(TcpListener::bind("127.0.0.1:0").await.unwrap(), 64);
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(server.run(listener, receiver));
    (addr, shutdown)
}

/// A client that sends every http:// request through the proxy at `proxy`.
pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy)).unwrap())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

pub fn gzip(data: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    Bytes::from(encoder.finish().unwrap())
}
