//! TLS termination for CONNECT tunnels.
//!
//! A root CA is loaded from (or created in) the configured certificate
//! directory. For each tunnel host a leaf certificate is issued on first use
//! and its `ServerConfig` is cached for the lifetime of the process.

use dashmap::DashMap;
use http::uri::Scheme;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::TlsAcceptor;

use crate::config::InterceptionConfig;
use crate::intercept::{InterceptError, Interceptor, TunnelHandler};

const CA_COMMON_NAME: &str = "Forward Proxy Root CA";
const CA_ORGANIZATION: &str = "Forward Proxy";
const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";

fn certificate_error(error: impl std::fmt::Display) -> InterceptError {
    InterceptError::Certificate(error.to_string())
}

/// Root CA plus the per-host server configurations it has signed.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// PEM handed to users for installation; the file on disk when one existed.
    ca_pem: String,
    cert_path: PathBuf,
    validity_days: u32,
    server_configs: DashMap<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
    /// Load `ca.crt`/`ca.key` from `dir`, creating both when either is missing.
    pub fn load_or_create(dir: &Path, validity_days: u32) -> Result<Self, InterceptError> {
        fs::create_dir_all(dir)?;
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (ca_cert, ca_key, ca_pem) = if cert_path.exists() && key_path.exists() {
            tracing::info!(path = %cert_path.display(), "Loading interception CA");
            let ca_pem = fs::read_to_string(&cert_path)?;
            let ca_key = KeyPair::from_pem(&fs::read_to_string(&key_path)?)
                .map_err(certificate_error)?;
            // Re-sign the CA parameters with the stored key: leaves chain to
            // the same subject and key as the installed certificate.
            let ca_cert = ca_params(validity_days)?
                .self_signed(&ca_key)
                .map_err(certificate_error)?;
            (ca_cert, ca_key, ca_pem)
        } else {
            tracing::info!(path = %cert_path.display(), "Generating interception CA");
            let ca_key = KeyPair::generate().map_err(certificate_error)?;
            let ca_cert = ca_params(validity_days)?
                .self_signed(&ca_key)
                .map_err(certificate_error)?;
            let ca_pem = ca_cert.pem();
            fs::write(&cert_path, &ca_pem)?;
            fs::write(&key_path, ca_key.serialize_pem())?;
            (ca_cert, ca_key, ca_pem)
        };

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem,
            cert_path,
            validity_days,
            server_configs: DashMap::new(),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    pub fn ca_cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Server configuration presenting a certificate for `host`.
    ///
    /// IPv6 literals may be given with or without their URI brackets; the
    /// certificate carries the bare address as an IP subject alternative name.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, InterceptError> {
        let host = host
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host);
        if let Some(config) = self.server_configs.get(host) {
            return Ok(Arc::clone(&config));
        }

        let config = Arc::new(self.issue(host)?);
        tracing::debug!(host, "Issued interception certificate");
        Ok(Arc::clone(
            self.server_configs
                .entry(host.to_string())
                .or_insert(config)
                .value(),
        ))
    }

    fn issue(&self, host: &str) -> Result<ServerConfig, InterceptError> {
        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(certificate_error)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(i64::from(self.validity_days));

        let key = KeyPair::generate().map_err(certificate_error)?;
        let leaf = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(certificate_error)?;

        let chain = vec![leaf.der().clone(), self.ca_cert.der().clone()];
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(certificate_error)?
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(certificate_error)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

fn ca_params(validity_days: u32) -> Result<CertificateParams, InterceptError> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(certificate_error)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(i64::from(validity_days) * 10);
    Ok(params)
}

/// Terminates client TLS with a certificate issued for the tunnel host.
#[derive(Clone)]
pub struct TlsInterceptor {
    authority: Arc<CertificateAuthority>,
}

impl TlsInterceptor {
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        Self { authority }
    }

    pub fn from_config(config: &InterceptionConfig) -> Result<Self, InterceptError> {
        let authority =
            CertificateAuthority::load_or_create(&config.cert_dir, config.cert_validity_days)?;
        Ok(Self::new(Arc::new(authority)))
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }
}

impl Interceptor for TlsInterceptor {
    async fn intercept(
        &self,
        client: TokioIo<Upgraded>,
        handler: TunnelHandler,
    ) -> Result<(), InterceptError> {
        let config = self.authority.server_config(handler.host())?;
        let tls = TlsAcceptor::from(config)
            .accept(client)
            .await
            .map_err(InterceptError::Handshake)?;
        handler.serve(tls, Scheme::HTTPS).await
    }
}
