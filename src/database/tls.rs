//! rustls-backed TLS for the PostgreSQL driver.
//!
//! The certificate policy follows the libpq `sslmode` names: `require` (and the
//! opportunistic `prefer`/`allow`) encrypt without checking the server certificate,
//! `verify-ca` checks the chain only, `verify-full` checks the chain and host name.

use std::fs::File;
use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use futures::future::BoxFuture;
use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, CertificateError, ClientConfig, PrivateKey, RootCertStore, ServerName};
use rustls_pemfile::Item;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_postgres::tls::{ChannelBinding, MakeTlsConnect, TlsConnect, TlsStream};
use tokio_rustls::{client::TlsStream as ClientTlsStream, TlsConnector};
use x509_parser::prelude::*;

use super::config::{DatabaseConfig, SslMode};
use crate::error::{Error, Result};

/// Creates per-connection TLS handshakes for the driver
#[derive(Clone)]
pub struct MakeRustlsConnect {
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for MakeRustlsConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MakeRustlsConnect").finish_non_exhaustive()
    }
}

impl MakeRustlsConnect {
    /// Builds the TLS client configuration for the given database settings
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let verifier: Arc<dyn ServerCertVerifier> = match config.ssl_mode {
            SslMode::Disable | SslMode::Allow | SslMode::Prefer | SslMode::Require => {
                Arc::new(AcceptAnyServerCert)
            }
            SslMode::VerifyCa => Arc::new(ChainOnlyVerifier {
                inner: WebPkiVerifier::new(load_root_store(config.ssl_root_cert_path.as_deref())?, None),
            }),
            SslMode::VerifyFull => Arc::new(WebPkiVerifier::new(
                load_root_store(config.ssl_root_cert_path.as_deref())?,
                None,
            )),
        };

        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(verifier);

        let client_config = match (&config.ssl_cert_path, &config.ssl_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert_chain = load_cert_chain(cert_path)?;
                validate_cert_expiry(&cert_chain[0])?;
                let private_key = load_private_key(key_path)?;
                builder
                    .with_client_auth_cert(cert_chain, private_key)
                    .map_err(|e| Error::config(format!("failed to set client certificate: {}", e)))?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            config: Arc::new(client_config),
        })
    }
}

impl<S> MakeTlsConnect<S> for MakeRustlsConnect
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = RustlsStream<S>;
    type TlsConnect = RustlsConnect;
    type Error = io::Error;

    fn make_tls_connect(&mut self, domain: &str) -> io::Result<RustlsConnect> {
        let server_name = ServerName::try_from(domain)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(RustlsConnect {
            connector: TlsConnector::from(self.config.clone()),
            server_name,
        })
    }
}

/// A single pending TLS handshake
pub struct RustlsConnect {
    connector: TlsConnector,
    server_name: ServerName,
}

impl<S> TlsConnect<S> for RustlsConnect
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = RustlsStream<S>;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<RustlsStream<S>>>;

    fn connect(self, stream: S) -> Self::Future {
        Box::pin(async move {
            let stream = self.connector.connect(self.server_name, stream).await?;
            Ok(RustlsStream(stream))
        })
    }
}

/// Encrypted driver stream
pub struct RustlsStream<S>(ClientTlsStream<S>);

impl<S> AsyncRead for RustlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for RustlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl<S> TlsStream for RustlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn channel_binding(&self) -> ChannelBinding {
        ChannelBinding::none()
    }
}

/// Encryption without authentication of the server
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Chain verification that ignores a host name mismatch
struct ChainOnlyVerifier {
    inner: WebPkiVerifier,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }
}

fn read_pem(path: &str) -> Result<Vec<Item>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("failed to open '{}': {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::read_all(&mut reader)
        .map_err(|e| Error::config(format!("failed to parse '{}': {}", path, e)))
}

/// Load certificate chain from PEM file
fn load_cert_chain(path: &str) -> Result<Vec<Certificate>> {
    let certs: Vec<Certificate> = read_pem(path)?
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();
    if certs.is_empty() {
        return Err(Error::config(format!("no certificate found in '{}'", path)));
    }
    Ok(certs)
}

/// Load private key from PEM file
fn load_private_key(path: &str) -> Result<PrivateKey> {
    read_pem(path)?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| Error::config(format!("no private key found in '{}'", path)))
}

/// Load trusted roots from a PEM bundle, or the bundled web PKI roots
fn load_root_store(path: Option<&str>) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    match path {
        Some(path) => {
            let ders: Vec<Vec<u8>> = load_cert_chain(path)?.into_iter().map(|c| c.0).collect();
            let (added, _ignored) = root_store.add_parsable_certificates(&ders[..]);
            if added == 0 {
                return Err(Error::config(format!("no usable root certificate in '{}'", path)));
            }
        }
        None => {
            root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
        }
    }
    Ok(root_store)
}

/// Validate certificate expiry
fn validate_cert_expiry(cert: &Certificate) -> Result<()> {
    let (_, cert) = X509Certificate::from_der(&cert.0)
        .map_err(|e| Error::config(format!("failed to parse X509 certificate: {}", e)))?;

    let now = chrono::Utc::now().timestamp();

    if now < cert.validity().not_before.timestamp() {
        return Err(Error::config("client certificate not yet valid"));
    }

    if now > cert.validity().not_after.timestamp() {
        return Err(Error::config("client certificate has expired"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_with(mode: SslMode) -> DatabaseConfig {
        DatabaseConfig {
            ssl_mode: mode,
            ..DatabaseConfig::new("db1", 5432, "m", "", "x")
        }
    }

    #[test]
    fn test_connector_without_client_auth() {
        for mode in [SslMode::Disable, SslMode::Prefer, SslMode::Require, SslMode::VerifyFull] {
            assert!(MakeRustlsConnect::from_config(&config_with(mode)).is_ok());
        }
    }

    #[test]
    fn test_missing_root_bundle() {
        let mut config = config_with(SslMode::VerifyCa);
        config.ssl_root_cert_path = Some("/nonexistent/root.pem".into());
        let err = MakeRustlsConnect::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_pem_without_certificates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let mut config = config_with(SslMode::VerifyFull);
        config.ssl_root_cert_path = Some(file.path().to_str().unwrap().to_string());
        let err = MakeRustlsConnect::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("no certificate found"));
    }

    #[test]
    fn test_missing_private_key() {
        let mut key_file = NamedTempFile::new().unwrap();
        writeln!(key_file, "-----BEGIN NOTHING-----").unwrap();
        assert!(matches!(
            load_private_key(key_file.path().to_str().unwrap()),
            Err(Error::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_server_name_for_ip_and_host() {
        let mut connector = MakeRustlsConnect::from_config(&config_with(SslMode::Require)).unwrap();
        assert!(MakeTlsConnect::<tokio::net::TcpStream>::make_tls_connect(&mut connector, "db1.internal").is_ok());
        assert!(MakeTlsConnect::<tokio::net::TcpStream>::make_tls_connect(&mut connector, "10.0.0.5").is_ok());
    }
}
