//! Mode 2 mutual TLS (§4.A): both peers present certificates signed by a
//! shared CA and verify the peer's certificate against it.
//!
//! Loading certificate and key material off disk, including the
//! passphrase-protected private key case, is deliberately kept out of this
//! crate: the certificate file layout is an external contract (§6) owned by
//! whoever bootstraps the process. This module only builds [`rustls`]
//! configs from already-parsed material.

use std::{path::Path, sync::Arc};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    ClientConfig, RootCertStore, ServerConfig,
};

use crate::error::TransportError;

/// Everything needed to stand up one side of a mode-2 mTLS connection: this
/// endpoint's own certificate chain and key, plus the CA that both this
/// endpoint's peer certificate and the peer's certificate are rooted in.
pub struct TlsMaterial {
    pub ca_cert: CertificateDer<'static>,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

fn root_store(
    ca_cert: &CertificateDer<'static>,
) -> Result<RootCertStore, TransportError> {
    let mut store = RootCertStore::empty();
    store.add(ca_cert.clone()).map_err(|e| {
        TransportError::TlsSetup(format!("invalid CA certificate: {e}"))
    })?;
    Ok(store)
}

/// Builds the [`ServerConfig`] for the listening side of an endpoint:
/// presents `material`'s cert chain, and requires the connecting peer to
/// present a certificate signed by `material.ca_cert`.
pub fn build_server_config(
    material: &TlsMaterial,
) -> Result<Arc<ServerConfig>, TransportError> {
    let roots = Arc::new(root_store(&material.ca_cert)?);
    let client_verifier =
        rustls::server::WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| {
                TransportError::TlsSetup(format!(
                    "failed to build client cert verifier: {e}"
                ))
            })?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(
            material.cert_chain.clone(),
            material.private_key.clone_key(),
        )
        .map_err(|e| {
            TransportError::TlsSetup(format!(
                "failed to install server certificate: {e}"
            ))
        })?;

    Ok(Arc::new(config))
}

/// Builds the [`ClientConfig`] for the connecting side of an endpoint:
/// trusts `material.ca_cert` for verifying the remote server, and presents
/// `material`'s own cert chain for the server's mutual-auth check.
pub fn build_client_config(
    material: &TlsMaterial,
) -> Result<Arc<ClientConfig>, TransportError> {
    let roots = root_store(&material.ca_cert)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            material.cert_chain.clone(),
            material.private_key.clone_key(),
        )
        .map_err(|e| {
            TransportError::TlsSetup(format!(
                "failed to install client certificate: {e}"
            ))
        })?;

    Ok(Arc::new(config))
}

/// Loads one endpoint's [`TlsMaterial`] off disk, per §6's certificate
/// layout: `ca_path` is the shared CA (`<config>/cert/CA.pem`), `cert_path`
/// and `key_path` are this endpoint's own leaf cert and key
/// (`<config>/cert/<sitename>/cert.pem` and `.../key.pem`). `passphrase`
/// decrypts the key if it's passphrase-protected (§6).
///
/// Where on disk `<config>` actually is, and how it got there, is an
/// external bootstrap concern (§1) owned by the caller; this function only
/// knows how to parse the three files once it's handed their paths.
pub fn load_tls_material(
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<TlsMaterial, TransportError> {
    let ca_cert = load_first_cert(ca_path)?;
    let cert_chain = load_cert_chain(cert_path)?;
    let private_key = load_private_key(key_path, passphrase)?;
    Ok(TlsMaterial { ca_cert, cert_chain, private_key })
}

fn read_file(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|e| {
        TransportError::TlsSetup(format!("failed to read {}: {e}", path.display()))
    })
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let bytes = read_file(path)?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::TlsSetup(format!(
                "invalid certificate PEM in {}: {e}",
                path.display()
            ))
        })
}

fn load_first_cert(path: &Path) -> Result<CertificateDer<'static>, TransportError> {
    load_cert_chain(path)?.into_iter().next().ok_or_else(|| {
        TransportError::TlsSetup(format!("no certificate found in {}", path.display()))
    })
}

/// Loads a private key, decrypting it first if `passphrase` is given.
/// `rustls-pemfile` alone only parses plaintext PKCS#8/SEC1/RSA keys, not
/// passphrase-protected ones (§4.A), hence the `pkcs8` fallback.
fn load_private_key(
    path: &Path,
    passphrase: Option<&str>,
) -> Result<PrivateKeyDer<'static>, TransportError> {
    let bytes = read_file(path)?;
    match passphrase {
        None => rustls_pemfile::private_key(&mut bytes.as_slice())
            .map_err(|e| {
                TransportError::TlsSetup(format!(
                    "invalid private key PEM in {}: {e}",
                    path.display()
                ))
            })?
            .ok_or_else(|| {
                TransportError::TlsSetup(format!("no private key found in {}", path.display()))
            }),
        Some(passphrase) => {
            let pem = std::str::from_utf8(&bytes).map_err(|e| {
                TransportError::TlsSetup(format!(
                    "private key {} is not valid utf-8: {e}",
                    path.display()
                ))
            })?;
            let doc = pkcs8::SecretDocument::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
                .map_err(|e| {
                    TransportError::TlsSetup(format!(
                        "failed to decrypt passphrase-protected key {}: {e}",
                        path.display()
                    ))
                })?;
            Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                doc.as_bytes().to_vec(),
            )))
        }
    }
}
