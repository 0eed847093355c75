//! Client certificate/private key loading.

use crate::error::CredentialError;
use crate::prelude::{debug, warn};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

/// One identity snapshot: a certificate chain and the private key for its leaf.
///
/// Immutable. A rotation produces a new `CredentialPair`; existing ones are never changed.
#[derive(Clone)]
pub struct CredentialPair {
    certified_key: Arc<CertifiedKey>,
    subject: String,
    not_after: i64,
    key_verified: bool,
}

impl CredentialPair {
    /// The rustls certificate chain and signing key.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// The certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // A pair is never built from an empty chain.
        &self.certified_key.cert[0]
    }

    /// Subject of the leaf certificate.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Expiry of the leaf certificate, in seconds since the Unix epoch.
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// Returns `true` if both pairs hold the same chain and a key verified against it.
    pub fn same_material(&self, other: &CredentialPair) -> bool {
        self.key_verified && other.key_verified && self.cert_chain() == other.cert_chain()
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("subject", &self.subject)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.certified_key.cert.len())
            .finish_non_exhaustive()
    }
}

/// Loads a PEM certificate chain and PEM private key into a [`CredentialPair`].
///
/// Both files are opened, read and closed within the call.
///
/// # Errors
///
/// Returns a [`CredentialError`] if either file cannot be read or parsed, if the key type
/// is not supported by the crypto provider, or if the key does not match the leaf.
pub fn load_credentials(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<CredentialPair, CredentialError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_pem = std::fs::read(cert_path).map_err(|source| CredentialError::ReadCertificate {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialError::InvalidCertificatePem {
            path: cert_path.to_path_buf(),
            source,
        })?;
    let Some(leaf) = chain.first() else {
        return Err(CredentialError::NoCertificates {
            path: cert_path.to_path_buf(),
        });
    };
    let (subject, not_after) = inspect_leaf(leaf).map_err(|reason| {
        CredentialError::InvalidCertificate {
            path: cert_path.to_path_buf(),
            reason,
        }
    })?;

    let key_pem = Zeroizing::new(std::fs::read(key_path).map_err(|source| {
        CredentialError::ReadPrivateKey {
            path: key_path.to_path_buf(),
            source,
        }
    })?);
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| CredentialError::InvalidPrivateKeyPem {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CredentialError::NoPrivateKey {
            path: key_path.to_path_buf(),
        })?;

    let provider = crate::crypto::default_provider().ok_or(CredentialError::NoCryptoProvider)?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|source| CredentialError::UnsupportedPrivateKey {
            path: key_path.to_path_buf(),
            source,
        })?;

    let certified_key = CertifiedKey::new(chain, signing_key);
    let key_verified = match certified_key.keys_match() {
        Ok(()) => true,
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            debug!(
                "cannot verify that private key matches certificate; accepting: key={}",
                key_path.display()
            );
            false
        }
        Err(_) => {
            return Err(CredentialError::KeyMismatch {
                cert_path: cert_path.to_path_buf(),
                key_path: key_path.to_path_buf(),
            })
        }
    };

    if not_after < unix_now() {
        warn!(
            "client certificate is expired: subject={}, not_after={}",
            subject, not_after
        );
    }

    Ok(CredentialPair {
        certified_key: Arc::new(certified_key),
        subject,
        not_after,
        key_verified,
    })
}

fn inspect_leaf(leaf: &CertificateDer<'_>) -> Result<(String, i64), String> {
    let (_, x509) =
        x509_parser::parse_x509_certificate(leaf.as_ref()).map_err(|e| e.to_string())?;
    Ok((
        x509.subject().to_string(),
        x509.validity().not_after.timestamp(),
    ))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write, TestPki};

    #[test]
    fn loads_matching_pair() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let client = pki.issue_client("client-a");
        let cert = write(dir.path(), "cert.crt", &client.cert_pem);
        let key = write(dir.path(), "key", &client.key_pem);

        let pair = load_credentials(&cert, &key).unwrap();

        assert_eq!(pair.leaf().as_ref(), client.cert_der.as_slice());
        assert_eq!(pair.cert_chain().len(), 1);
        assert!(pair.subject().contains("client-a"));
        assert!(pair.not_after() > unix_now());
    }

    #[test]
    fn loads_combined_pem_file() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let client = pki.issue_client("combined");
        let both = write(
            dir.path(),
            "identity.pem",
            format!("{}{}", client.cert_pem, client.key_pem),
        );

        let pair = load_credentials(&both, &both).unwrap();

        assert_eq!(pair.leaf().as_ref(), client.cert_der.as_slice());
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let a = pki.issue_client("a");
        let b = pki.issue_client("b");
        let cert = write(dir.path(), "cert.crt", &a.cert_pem);
        let key = write(dir.path(), "key", &b.key_pem);

        let err = load_credentials(&cert, &key).unwrap_err();

        assert!(matches!(err, CredentialError::KeyMismatch { .. }));
    }

    #[test]
    fn missing_files_are_read_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let client = pki.issue_client("client");
        let cert = write(dir.path(), "cert.crt", &client.cert_pem);
        let key = write(dir.path(), "key", &client.key_pem);

        let err = load_credentials(dir.path().join("nope.crt"), &key).unwrap_err();
        assert!(matches!(err, CredentialError::ReadCertificate { .. }));

        let err = load_credentials(&cert, dir.path().join("nope.key")).unwrap_err();
        assert!(matches!(err, CredentialError::ReadPrivateKey { .. }));
    }

    #[test]
    fn empty_or_garbage_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let client = pki.issue_client("client");
        let cert = write(dir.path(), "cert.crt", &client.cert_pem);
        let key = write(dir.path(), "key", &client.key_pem);
        let empty = write(dir.path(), "empty", "");

        let err = load_credentials(&empty, &key).unwrap_err();
        assert!(matches!(err, CredentialError::NoCertificates { .. }));

        let err = load_credentials(&cert, &empty).unwrap_err();
        assert!(matches!(err, CredentialError::NoPrivateKey { .. }));
    }

    #[test]
    fn truncated_certificate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let client = pki.issue_client("client");
        let half = &client.cert_pem[..client.cert_pem.len() / 2];
        let cert = write(dir.path(), "cert.crt", half);
        let key = write(dir.path(), "key", &client.key_pem);

        assert!(load_credentials(&cert, &key).is_err());
    }

    #[test]
    fn same_material_compares_chains() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let a = pki.issue_client("a");
        let b = pki.issue_client("b");
        let a_cert = write(dir.path(), "a.crt", &a.cert_pem);
        let a_key = write(dir.path(), "a.key", &a.key_pem);
        let b_cert = write(dir.path(), "b.crt", &b.cert_pem);
        let b_key = write(dir.path(), "b.key", &b.key_pem);

        let first = load_credentials(&a_cert, &a_key).unwrap();
        let again = load_credentials(&a_cert, &a_key).unwrap();
        let other = load_credentials(&b_cert, &b_key).unwrap();

        assert!(first.same_material(&again));
        assert!(!first.same_material(&other));
    }
}
