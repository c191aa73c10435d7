//! Bridge-managed TLS certificate
//!
//! The local listeners present a self-signed certificate for `127.0.0.1` and
//! `localhost`. It is generated once into the settings directory and reused
//! on every start so mail clients only have to trust it once.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::errors::{AppError, AppResult};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Names the certificate is valid for
const SUBJECT_NAMES: [&str; 2] = ["127.0.0.1", "localhost"];

/// Locations of the PEM files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
        }
    }

    pub fn exist(&self) -> bool {
        self.cert.is_file() && self.key.is_file()
    }
}

/// Make sure a certificate pair exists in `dir`, generating one if needed
///
/// Returns whether a new pair was written.
///
/// # Errors
///
/// Returns `Internal` if generation fails and `Io` if the files cannot be
/// written.
pub fn ensure_certificate(dir: &Path) -> AppResult<bool> {
    let paths = CertPaths::in_dir(dir);
    if paths.exist() {
        return Ok(false);
    }
    generate_certificate(dir)?;
    Ok(true)
}

/// Write a fresh self-signed certificate pair into `dir`
///
/// Existing files are replaced.
pub fn generate_certificate(dir: &Path) -> AppResult<CertPaths> {
    let names: Vec<String> = SUBJECT_NAMES.iter().map(|s| (*s).to_owned()).collect();
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| AppError::Internal(format!("certificate generation failed: {e}")))?;

    fs::create_dir_all(dir)?;
    let paths = CertPaths::in_dir(dir);
    fs::write(&paths.cert, certified.cert.pem())?;
    fs::write(&paths.key, certified.key_pair.serialize_pem())?;
    info!(path = %paths.cert.display(), "generated bridge TLS certificate");
    Ok(paths)
}

fn read_certs(path: &Path) -> AppResult<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Config(format!("invalid certificate {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(AppError::Config(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> AppResult<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| AppError::Config(format!("invalid private key {}: {e}", path.display())))?
        .ok_or_else(|| AppError::Config(format!("no private key found in {}", path.display())))
}

/// Build the acceptor used by the local listeners
///
/// # Errors
///
/// Returns `Config` if the PEM files are missing, unreadable or do not form
/// a valid pair.
pub fn load_acceptor(dir: &Path) -> AppResult<TlsAcceptor> {
    let paths = CertPaths::in_dir(dir);
    let certs = read_certs(&paths.cert)?;
    let key = read_key(&paths.key)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::Config(format!("certificate rejected: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client connector that trusts only the bridge certificate
///
/// Used to talk to our own listeners.
pub fn local_connector(dir: &Path) -> AppResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&CertPaths::in_dir(dir).cert)? {
        roots
            .add(cert)
            .map_err(|e| AppError::Config(format!("certificate rejected: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
