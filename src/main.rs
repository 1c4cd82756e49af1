use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use forward_proxy::config::{load_config, validate_config, ConfigError};
use forward_proxy::lifecycle::{wait_for_signal, Shutdown};
use forward_proxy::net::Listener;
use forward_proxy::observability::{init_logging, init_metrics};
use forward_proxy::{AuditLog, ProxyConfig, ProxyServer, TlsInterceptor};

/// Intercepting HTTP/HTTPS forward proxy with an audit stream on stdout.
#[derive(Debug, Parser)]
#[command(name = "forward-proxy", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding listener.bind_address
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream proxy URL every request is sent through
    #[arg(long)]
    proxy: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(port) = self.port {
            config.listener.bind_address = match config.listener.bind_address.parse::<SocketAddr>()
            {
                Ok(mut address) => {
                    address.set_port(port);
                    address.to_string()
                }
                Err(_) => format!("0.0.0.0:{}", port),
            };
        }
        if let Some(proxy) = &self.proxy {
            config.transport.upstream_proxy = Some(proxy.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    init_logging(&config.observability);
    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        upstream_proxy = config.transport.upstream_proxy.as_deref().unwrap_or("direct"),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let address: SocketAddr = config.observability.metrics_address.parse()?;
        init_metrics(address)?;
    }

    let audit = Arc::new(AuditLog::from_config(&config.audit)?);
    let interceptor = TlsInterceptor::from_config(&config.interception)?;
    tracing::info!(
        ca_cert = %interceptor.authority().ca_cert_path().display(),
        "Clients must trust this CA for HTTPS interception"
    );

    let server = ProxyServer::new(&config, interceptor, Arc::clone(&audit))?;
    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger();
    });

    server.run(listener, receiver).await?;

    tokio::task::spawn_blocking(move || audit.flush()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
