use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use rustls::{
    RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio_rustls::TlsConnector;

use crate::lanproxy::transport::{BoxedStream, Dialer, host_of, tcp::TcpDialer};

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub insecure_skip_verify: bool,
    /// PEM bundle used as the trust root.
    pub ca_file: Option<PathBuf>,
    /// SNI / verification name. Defaults to the host part of the dialed address.
    pub server_name: Option<String>,
}

pub struct TlsDialer {
    tcp: TcpDialer,
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsDialer {
    pub fn new(tcp: TcpDialer, opts: &TlsOptions) -> anyhow::Result<Self> {
        let cfg = client_config(opts)?;
        Ok(Self {
            tcp,
            connector: TlsConnector::from(Arc::new(cfg)),
            server_name: opts
                .server_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let c = self.tcp.connect(addr).await?;
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(addr).to_string());
        let server_name = ServerName::try_from(name.clone())
            .with_context(|| format!("tls: invalid server name {name:?}"))?;
        let st = self
            .connector
            .connect(server_name, c)
            .await
            .with_context(|| format!("tls: handshake with {addr}"))?;
        Ok(Box::new(st))
    }
}

/// Provider for every TLS config built here. Never left to rustls feature
/// detection: more than one provider may be compiled in.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn client_config(opts: &TlsOptions) -> anyhow::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .context("tls: protocol versions")?;

    if opts.insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth());
    }

    let Some(path) = opts.ca_file.as_deref() else {
        anyhow::bail!("tls: a certificate bundle is required unless verification is skipped");
    };
    let roots = load_trust_store(path)?;
    Ok(builder
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Loads every certificate of a PEM bundle into a trust store.
pub fn load_trust_store(path: &Path) -> anyhow::Result<RootCertStore> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .with_context(|| format!("tls: parse {}", path.display()))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(path = %path.display(), ignored, "tls: skipped unparsable certificates");
    }
    if added == 0 {
        anyhow::bail!("tls: no certificates found in {}", path.display());
    }
    Ok(roots)
}

/// Accepts any server certificate.
///
/// NOTE: vulnerable to MITM. Only selected when no trust root is configured.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(crypto_provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("lanproxy_tls_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    /// Starts a one-shot TLS echo server for `localhost` and returns its
    /// address plus the PEM of its self-signed certificate.
    async fn echo_server() -> (String, String) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let pem = cert.pem();
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        let cfg = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(cfg));

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (c, _) = ln.accept().await.unwrap();
            let mut st = acceptor.accept(c).await.unwrap();
            let mut buf = [0u8; 4];
            st.read_exact(&mut buf).await.unwrap();
            st.write_all(&buf).await.unwrap();
            st.flush().await.unwrap();
        });
        (addr, pem)
    }

    #[tokio::test]
    async fn dial_verifies_against_pem_bundle() {
        let (addr, pem) = echo_server().await;
        let dir = temp_dir("bundle");
        let ca = dir.join("ca.pem");
        std::fs::write(&ca, pem).unwrap();

        let d = TlsDialer::new(
            TcpDialer::new(Duration::from_secs(2)),
            &TlsOptions {
                insecure_skip_verify: false,
                ca_file: Some(ca),
                server_name: Some("localhost".into()),
            },
        )
        .unwrap();

        let mut st = d.dial(&addr).await.unwrap();
        st.write_all(b"ping").await.unwrap();
        st.flush().await.unwrap();
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dial_skip_verify_accepts_self_signed() {
        let (addr, _pem) = echo_server().await;
        let d = TlsDialer::new(
            TcpDialer::new(Duration::from_secs(2)),
            &TlsOptions {
                insecure_skip_verify: true,
                ca_file: None,
                server_name: None,
            },
        )
        .unwrap();

        let mut st = d.dial(&addr).await.unwrap();
        st.write_all(b"pong").await.unwrap();
        st.flush().await.unwrap();
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn skip_verify_config_builds_with_the_ring_provider() {
        let cfg = client_config(&TlsOptions {
            insecure_skip_verify: true,
            ca_file: None,
            server_name: None,
        })
        .unwrap();
        assert_eq!(
            cfg.crypto_provider().cipher_suites.len(),
            rustls::crypto::ring::default_provider().cipher_suites.len()
        );
    }

    #[test]
    fn verification_without_bundle_is_rejected() {
        let err = client_config(&TlsOptions::default()).unwrap_err();
        assert!(err.to_string().contains("certificate bundle"));
    }

    #[test]
    fn empty_bundle_is_rejected() {
        let dir = temp_dir("empty");
        let ca = dir.join("ca.pem");
        std::fs::write(&ca, "not a certificate\n").unwrap();

        let err = load_trust_store(&ca).unwrap_err();
        assert!(err.to_string().contains("no certificates"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
