//! Broker endpoint: URL options, TLS client setup, connecting.
//!
//! Backend URLs look like `grpc://broker.example.org:8080?skip_verify=true`.
//! Two boolean options are understood:
//! - `insecure`: plaintext TCP instead of TLS
//! - `skip_verify`: TLS without certificate verification, for self-signed
//!   broker certificates
//!
//! `SSLKEYLOGFILE` is honored for traffic inspection.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::warn;
use url::Url;

use crate::BackendError;

const DEFAULT_PORT: u16 = 8080;

/// A connection-oriented stream to the broker, plain or TLS.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Where and how to reach the broker.
pub(crate) struct Endpoint {
    host: String,
    port: u16,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl Endpoint {
    pub(crate) fn parse(uri: &Url) -> Result<Self, BackendError> {
        let host = uri
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| BackendError::Config(format!("missing host in {uri}")))?
            .to_string();
        let port = uri.port().unwrap_or(DEFAULT_PORT);

        let mut insecure = false;
        let mut skip_verify = false;
        for (name, value) in uri.query_pairs() {
            match name.as_ref() {
                "insecure" => insecure = parse_bool(&name, &value)?,
                "skip_verify" => skip_verify = parse_bool(&name, &value)?,
                other => {
                    return Err(BackendError::Config(format!("unknown option {other:?}")));
                }
            }
        }

        let tls = if insecure {
            None
        } else {
            let name = ServerName::try_from(host.clone())
                .map_err(|_| BackendError::Config(format!("invalid host name {host:?}")))?;

            Some((TlsConnector::from(Arc::new(tls_config(skip_verify))), name))
        };

        Ok(Self { host, port, tls })
    }

    pub(crate) async fn connect(&self) -> Result<Box<dyn Stream>, BackendError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;

        match &self.tls {
            Some((connector, name)) => {
                let stream = connector.connect(name.clone(), tcp).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, BackendError> {
    match value {
        "" | "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        other => Err(BackendError::Config(format!(
            "invalid value {other:?} for option {name:?}"
        ))),
    }
}

fn tls_config(skip_verify: bool) -> rustls::ClientConfig {
    let mut config = if skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerify::new()))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in native.errors {
            warn!("failed to load a system root certificate: {error}");
        }
        for cert in native.certs {
            if let Err(e) = roots.add(cert) {
                warn!("rejected system root certificate: {e}");
            }
        }

        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.key_log = Arc::new(rustls::KeyLogFile::new());
    config
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Signatures are still verified so a
    /// passive attacker cannot splice traffic; only the certificate chain
    /// is left unchecked.
    #[derive(Debug)]
    pub(super) struct NoVerify(CryptoProvider);

    impl NoVerify {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerify {
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
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
