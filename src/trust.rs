//! CA trust loading.

use crate::error::CaError;
use crate::prelude::debug;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use x509_parser::nom::Err;

const PEM_PREFIX: &[u8] = b"-----BEGIN";

/// Immutable set of trusted certificate authorities.
///
/// Built once per client from the configured CA file and owned by its TLS configuration.
#[derive(Clone)]
pub struct TrustRootSet {
    roots: Arc<RootCertStore>,
    subjects: Vec<String>,
}

impl TrustRootSet {
    /// The rustls root store.
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    /// Subjects of the trusted authorities, in file order.
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// Number of trusted authorities.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Returns `true` if no authority is trusted. Never the case for a loaded set.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl fmt::Debug for TrustRootSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustRootSet")
            .field("subjects", &self.subjects)
            .finish()
    }
}

/// Reads a CA certificate file and builds the trust roots from it.
///
/// The file may hold a single DER certificate or PEM `CERTIFICATE` blocks.
///
/// # Errors
///
/// * [`CaError::Io`] if the file cannot be read.
/// * [`CaError::Parse`] if the content is not a valid certificate.
pub fn load_trust_roots(path: impl AsRef<Path>) -> Result<TrustRootSet, CaError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let parse_error = |reason: String| CaError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let certs = if is_pem(&bytes) {
        let certs = rustls_pemfile::certs(&mut bytes.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| parse_error(format!("malformed PEM: {e}")))?;
        if certs.is_empty() {
            return Err(parse_error("no CERTIFICATE block found".into()));
        }
        certs
    } else {
        vec![CertificateDer::from(bytes)]
    };

    let mut store = RootCertStore::empty();
    let mut subjects = Vec::with_capacity(certs.len());
    for cert in certs {
        subjects.push(authority_subject(&cert).map_err(parse_error)?);
        store
            .add(cert)
            .map_err(|e| parse_error(format!("rejected as trust anchor: {e}")))?;
    }

    debug!(
        "loaded {} CA certificate(s) from {}: subjects={:?}",
        store.len(),
        path.display(),
        subjects
    );

    Ok(TrustRootSet {
        roots: Arc::new(store),
        subjects,
    })
}

fn is_pem(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(PEM_PREFIX)
}

fn authority_subject(cert: &CertificateDer<'_>) -> Result<String, String> {
    match x509_parser::parse_x509_certificate(cert.as_ref()) {
        Ok((rest, x509)) if rest.is_empty() => Ok(x509.subject().to_string()),
        Ok(_) => Err("trailing data after certificate".into()),
        Err(Err::Incomplete(_)) => Err("truncated certificate".into()),
        Err(Err::Error(e) | Err::Failure(e)) => Err(format!("not an X.509 certificate: {e}")),
    }
}
