//! TLS material: PEM loading, the insecure verifier, and self-signed
//! certificates for development.

use super::TransportError;
use quicmux_common::protocol;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The process-independent crypto provider used for every endpoint
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::Certificate(format!("cannot open {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

/// Load every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Certificate(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| {
            TransportError::Certificate(format!("no private key found in {}", path.display()))
        })
}

/// Trust anchors read from a PEM bundle
pub fn load_roots(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Certificate(format!("{}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

/// Paths of a generated certificate/key pair
#[derive(Debug, Clone)]
pub struct SelfSigned {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Generate a self-signed certificate for `names` and write it as PEM into `dir`
pub fn generate_self_signed(dir: &Path, names: &[&str]) -> Result<SelfSigned, TransportError> {
    let mut subject_alt_names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    if subject_alt_names.is_empty() {
        subject_alt_names.push(protocol::DEFAULT_SERVER_NAME.to_string());
    }

    let certified = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|e| TransportError::Certificate(format!("generation failed: {}", e)))?;

    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem())?;
    std::fs::write(&key_path, certified.key_pair.serialize_pem())?;

    Ok(SelfSigned {
        cert_path,
        key_path,
    })
}

/// Accepts any server certificate chain (insecure mode)
///
/// Handshake signatures are still checked so the peer must hold the key
/// for the certificate it presents.
#[derive(Debug)]
pub struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl SkipServerVerification {
    pub fn new(provider: Arc<CryptoProvider>) -> Arc<Self> {
        Arc::new(Self { provider })
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
