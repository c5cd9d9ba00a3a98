//! TLS material and configuration.
//!
//! All three components authenticate each other with the same self-signed
//! certificate/key pair stored under `~/.mdb` (`cert.pem`, `key.rsa`): the
//! server requires client certificates, and clients trust exactly that
//! certificate. The pair is generated once at launch by shelling out to
//! `openssl` (path overridable via `MDB_OPENSSL`).
//!
//! Environment switches, for development use only:
//! - `MDB_DISABLE_TLS` — run every connection as plain TCP.
//! - `MDB_DISABLE_HOSTNAME_VERIFY` — clients skip server certificate
//!   verification entirely.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Whether TLS is enabled for this process (`MDB_DISABLE_TLS` unset).
pub fn tls_enabled() -> bool {
    if std::env::var_os("MDB_DISABLE_TLS").is_some() {
        log::warn!("TLS is disabled by environment variable.");
        return false;
    }
    true
}

fn hostname_verify_disabled() -> bool {
    std::env::var_os("MDB_DISABLE_HOSTNAME_VERIFY").is_some()
}

/// The mdb configuration directory, `~/.mdb`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn mdb_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".mdb"))
}

/// Path of the shared certificate.
pub fn cert_path() -> Result<PathBuf> {
    Ok(mdb_home()?.join("cert.pem"))
}

/// Path of the shared private key.
pub fn key_path() -> Result<PathBuf> {
    Ok(mdb_home()?.join("key.rsa"))
}

/// Generate the self-signed certificate/key pair if it does not exist yet.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the `openssl`
/// invocation fails.
pub fn ensure_certificate(hostname: &str) -> Result<()> {
    let home = mdb_home()?;
    std::fs::create_dir_all(&home)
        .with_context(|| format!("create {}", home.display()))?;

    let cert = home.join("cert.pem");
    let key = home.join("key.rsa");
    if cert.exists() && key.exists() {
        return Ok(());
    }

    let openssl = std::env::var("MDB_OPENSSL").unwrap_or_else(|_| "openssl".to_owned());
    let subj = format!("/C=XX/ST=mdb/L=mdb/O=mdb/OU=mdb/CN={hostname}");
    log::info!("generating TLS certificate for {hostname}");
    let status = Command::new(&openssl)
        .args(["req", "-x509", "-newkey", "rsa:4096", "-sha256", "-days", "365", "-nodes"])
        .arg("-keyout")
        .arg(&key)
        .arg("-out")
        .arg(&cert)
        .arg("-subj")
        .arg(&subj)
        .status()
        .with_context(|| format!("run {openssl}"))?;
    if !status.success() {
        bail!("certificate generation failed ({openssl} exited with {status})");
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("open certificate {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("parse certificate {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("open key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse key {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

/// Trust store containing exactly the shared self-signed certificate.
fn trust_roots() -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&cert_path()?)? {
        roots.add(cert).context("add certificate to trust store")?;
    }
    Ok(roots)
}

/// Server-side acceptor requiring client certificates (mutual TLS).
///
/// # Errors
///
/// Returns an error if the certificate material is missing or invalid.
pub fn server_acceptor() -> Result<TlsAcceptor> {
    let certs = load_certs(&cert_path()?)?;
    let key = load_key(&key_path()?)?;
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(trust_roots()?))
        .build()
        .context("build client certificate verifier")?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("build server TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side connector presenting the shared certificate.
///
/// # Errors
///
/// Returns an error if the certificate material is missing or invalid.
pub fn client_connector() -> Result<TlsConnector> {
    let certs = load_certs(&cert_path()?)?;
    let key = load_key(&key_path()?)?;
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(trust_roots()?)
        .with_client_auth_cert(certs, key)
        .context("build client TLS config")?;

    if hostname_verify_disabled() {
        log::warn!("server certificate verification is disabled by environment variable.");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier::new()));
    }
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accept-anything server certificate verifier, gated behind
/// `MDB_DISABLE_HOSTNAME_VERIFY`. Signatures are still checked against the
/// presented certificate so the handshake stays well-formed.
#[derive(Debug)]
struct InsecureServerVerifier {
    provider: Arc<CryptoProvider>,
}

impl InsecureServerVerifier {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for InsecureServerVerifier {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_lives_under_mdb_home() {
        let home = mdb_home().unwrap();
        assert!(home.ends_with(".mdb"));
        assert_eq!(cert_path().unwrap(), home.join("cert.pem"));
        assert_eq!(key_path().unwrap(), home.join("key.rsa"));
    }

    #[test]
    fn test_missing_certificate_is_an_error() {
        // Point at a path that cannot exist rather than the real home.
        let missing = PathBuf::from("/nonexistent/cert.pem");
        assert!(load_certs(&missing).is_err());
    }
}
