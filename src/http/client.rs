//! Outbound transport.
//!
//! One `reqwest::Client` is built from the TransportConfig at startup and
//! shared (read-only, cheaply cloned) by every request. It never follows
//! redirects and never decompresses; both are the client's business.

use thiserror::Error;

use crate::config::schema::DEFAULT_EXPECT_CONTINUE_TIMEOUT_SECS;
use crate::config::validation::check_upstream_proxy;
use crate::config::TransportConfig;

/// Errors building the outbound client. Fatal at startup.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid upstream proxy `{url}`: {reason}")]
    UpstreamProxy { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Configured transport settings the outbound client cannot honor.
pub fn unsupported_settings(config: &TransportConfig) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if config.expect_continue_timeout_secs != DEFAULT_EXPECT_CONTINUE_TIMEOUT_SECS {
        ignored.push("expect_continue_timeout_secs");
    }
    ignored
}

/// Build the shared outbound client.
///
/// reqwest applies its connect timeout to the TCP dial and the TLS handshake
/// together, so the two configured budgets are summed.
pub fn build_client(config: &TransportConfig) -> Result<reqwest::Client, ClientError> {
    for setting in unsupported_settings(config) {
        tracing::warn!(setting, "Transport setting is not supported and will be ignored");
    }

    let keep_alive = Some(config.keep_alive()).filter(|d| !d.is_zero());

    let builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.dial_timeout() + config.tls_handshake_timeout())
        .tcp_keepalive(keep_alive);

    let builder = match &config.upstream_proxy {
        Some(raw) => {
            let url = check_upstream_proxy(raw).map_err(|reason| ClientError::UpstreamProxy {
                url: raw.clone(),
                reason,
            })?;
            let proxy =
                reqwest::Proxy::all(url.as_str()).map_err(|e| ClientError::UpstreamProxy {
                    url: raw.clone(),
                    reason: e.to_string(),
                })?;
            builder.proxy(proxy)
        }
        // Direct dial, ignoring HTTP(S)_PROXY from the environment.
        None => builder.no_proxy(),
    };

    Ok(builder.build()?)
}
