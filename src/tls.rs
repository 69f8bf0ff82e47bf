//! Server-side TLS context
//!
//! Mirrors `connection_server.py`'s `ssl.SSLContext(ssl.PROTOCOL_TLS_SERVER)`
//! setup: a self-signed certificate (generated by the out-of-scope cert
//! collaborator, spec §1/§6) loaded from `cert_pem`/`key_pem`, TLS 1.2+ only,
//! and the cipher policy named in spec §4.9
//! (`EECDH+AESGCM:EDH+AESGCM:AES256+EECDH:AES256+EDH`) - ECDHE/DHE key
//! exchange with AES-GCM, no CBC, no RC4. Authentication of the *client* is
//! the `{uid, password}` frame handled in `server.rs`, not anything in this
//! module; this context only proves the gateway holds the private key
//! matching its advertised certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{CipherSuite, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{IotError, Result};

/// The `ring` provider's default suite list narrowed to the AES-GCM/ECDHE
/// suites named in spec §4.9 - drops CHACHA20-POLY1305 and any CBC suite a
/// future provider default might add.
fn aesgcm_provider() -> CryptoProvider {
    const ALLOWED: &[CipherSuite] = &[
        CipherSuite::TLS13_AES_256_GCM_SHA384,
        CipherSuite::TLS13_AES_128_GCM_SHA256,
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ];
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites.retain(|s| ALLOWED.contains(&s.suite()));
    provider
}

/// Build the server TLS config used by [`crate::server::DeviceServer`]:
/// TLS 1.2+ only, AES-GCM cipher suites, single cert chain + key loaded
/// from PEM files.
pub fn server_tls_config(cert_pem: &Path, key_pem: &Path) -> Result<Arc<ServerConfig>> {
    let chain = load_cert_chain(cert_pem)?;
    let key = load_private_key(key_pem)?;
    let config = ServerConfig::builder_with_provider(Arc::new(aesgcm_provider()))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .expect("TLS12/TLS13 are supported by the ring provider")
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| IotError::ConfigLoad {
            path: cert_pem.to_path_buf(),
            source: Box::new(e),
        })?;
    Ok(Arc::new(config))
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| IotError::ConfigLoad { path: path.to_path_buf(), source: Box::new(e) })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| IotError::ConfigLoad { path: path.to_path_buf(), source: Box::new(e) })?
        .ok_or_else(|| IotError::ConfigLoad {
            path: path.to_path_buf(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no private key found in file",
            )),
        })
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| IotError::ConfigLoad { path: path.to_path_buf(), source: Box::new(e) })?;
    Ok(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_tls_config_loads_a_generated_cert() {
        let (_dir, cert_path, key_path) = crate::test_support::generate_self_signed_cert();
        let config = server_tls_config(&cert_path, &key_path);
        assert!(config.is_ok());
    }

    #[test]
    fn server_tls_config_rejects_missing_cert() {
        let err = server_tls_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(err.is_err());
    }
}
