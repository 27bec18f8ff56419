//! TLS configuration builders.
//!
//! Metadata keys: `certFile`, `keyFile`, `caFile`, `serverName`,
//! `secure` (verify the peer; off by default for hop-to-hop tunnels),
//! `alpn` (list).

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use passage_core::error::{Error, Result};
use passage_core::metadata::Metadata;

/// Client-side TLS settings parsed from dialer metadata.
pub struct TlsClientSetup {
    pub config: Arc<ClientConfig>,
    pub server_name: Option<ServerName<'static>>,
}

impl TlsClientSetup {
    pub fn from_metadata(md: &Metadata) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let ca_file = md.get_str("caFile");
        if !ca_file.is_empty() {
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Protocol(format!("bad CA cert: {e}")))?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let mut config = if md.get_bool("secure") {
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        };
        config.alpn_protocols = md
            .get_str_list("alpn")
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        let server_name = match md.get_str("serverName") {
            "" => None,
            name => Some(
                ServerName::try_from(name.to_string())
                    .map_err(|e| Error::Protocol(format!("invalid serverName: {e}")))?,
            ),
        };

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    /// The SNI to present for a hop at `host`: the configured override,
    /// or the hop's own host.
    pub fn name_for(&self, host: &str) -> Result<ServerName<'static>> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        ServerName::try_from(host.to_string())
            .map_err(|e| Error::Protocol(format!("invalid SNI host {host:?}: {e}")))
    }
}

/// Server-side TLS settings parsed from listener metadata.
pub fn server_config(md: &Metadata) -> Result<Arc<ServerConfig>> {
    let cert_file = md.get_str("certFile");
    let key_file = md.get_str("keyFile");
    if cert_file.is_empty() || key_file.is_empty() {
        return Err(Error::Protocol("tls listener needs certFile and keyFile".into()));
    }
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Protocol(format!("tls config: {e}")))?;
    config.alpn_protocols = md
        .get_str_list("alpn")
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Protocol(format!("read {path}: {e}")))?;
    rustls_pemfile::certs(&mut &data[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Protocol(format!("parse certs {path}: {e}")))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Protocol(format!("read {path}: {e}")))?;
    rustls_pemfile::private_key(&mut &data[..])
        .map_err(|e| Error::Protocol(format!("parse key {path}: {e}")))?
        .ok_or_else(|| Error::Protocol(format!("no private key in {path}")))
}

/// Accept-anything verifier for hop-to-hop tunnels pinned by other
/// means (or explicitly configured insecure).
#[derive(Debug)]
pub struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}
