// tee-signer: TLS configuration and setup

use std::fs;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};

use crate::config::TlsSection;
use crate::error::{SignerError, SignerResult};

/// Validate that every configured TLS input exists.
///
/// Client certificates are mandatory: the CN of the verified client
/// certificate is the service's only identity input.
pub fn validate(section: &TlsSection) -> SignerResult<()> {
    for (name, path) in [
        ("tls.cert_file", &section.cert_file),
        ("tls.key_file", &section.key_file),
        ("tls.ca_file", &section.ca_file),
    ] {
        if path.is_empty() {
            return Err(SignerError::config_error(format!("{} is required", name)));
        }
        if !Path::new(path).exists() {
            return Err(SignerError::config_error(format!(
                "{} not found: {}",
                name, path
            )));
        }
    }
    Ok(())
}

/// Build the rustls server config: server certificate plus mandatory
/// client-certificate verification against the configured CA bundle.
pub fn build_server_config(section: &TlsSection) -> SignerResult<ServerConfig> {
    validate(section)?;

    let cert_chain = load_certs(&section.cert_file)?;
    let key = load_key(&section.key_file)?;
    let ca_certs = load_certs(&section.ca_file)?;

    let mut roots = RootCertStore::empty();
    for ca_cert in ca_certs {
        roots.add(ca_cert).map_err(|e| {
            SignerError::config_error(format!("failed to add CA certificate: {}", e))
        })?;
    }

    let client_verifier = WebPkiClientVerifier::builder(roots.into())
        .build()
        .map_err(|e| {
            SignerError::config_error(format!("failed to create client verifier: {}", e))
        })?;

    ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|e| SignerError::config_error(format!("failed to create TLS config: {}", e)))
}

fn load_certs(path: &str) -> SignerResult<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).map_err(|e| {
        SignerError::config_error(format!("failed to read certificate file {}: {}", path, e))
    })?;
    let mut reader = BufReader::new(data.as_slice());
    let parsed: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            SignerError::config_error(format!("failed to parse certificates in {}: {}", path, e))
        })?;
    if parsed.is_empty() {
        return Err(SignerError::config_error(format!(
            "no certificates found in {}",
            path
        )));
    }
    Ok(parsed)
}

fn load_key(path: &str) -> SignerResult<PrivateKeyDer<'static>> {
    let data = fs::read(path).map_err(|e| {
        SignerError::config_error(format!("failed to read key file {}: {}", path, e))
    })?;
    let mut reader = BufReader::new(data.as_slice());
    private_key(&mut reader)
        .map_err(|e| {
            SignerError::config_error(format!("failed to parse private key in {}: {}", path, e))
        })?
        .ok_or_else(|| SignerError::config_error(format!("no private key found in {}", path)))
}
