//! Error types for `mutual-rustls`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while building or shutting down an [`MtlsClient`](crate::MtlsClient).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration is incomplete.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The CA certificate could not be loaded. Always fatal.
    #[error("failed loading CA certificate: {0}")]
    Ca(#[from] CaError),

    /// The client certificate or private key could not be loaded.
    ///
    /// Fatal only for the initial load; reloads keep the previous credential.
    #[error("failed loading client credentials: {0}")]
    Credential(#[from] CredentialError),

    /// The credential files could not be watched for changes.
    ///
    /// Only produced by the strict build paths; [`MtlsClientBuilder::build`](crate::MtlsClientBuilder::build)
    /// reports it alongside a usable client instead.
    #[error("failed watching credential files: {0}")]
    WatchSetup(#[from] WatchSetupError),

    /// The HTTP client could not be assembled.
    #[error("failed building HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    /// The watcher task did not stop within the shutdown timeout and was aborted.
    #[error("credential watcher did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum ConfigError {
    /// An environment variable holding a path is not set (or not unicode).
    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),

    /// A path setting is empty.
    #[error("{setting} must not be empty")]
    EmptyPath {
        /// The setting name (`certificate-path`, `private-key-path` or `ca-path`).
        setting: &'static str,
    },
}

/// Errors loading the CA trust root.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaError {
    /// The CA file could not be read (missing, permission denied, ...).
    #[error("could not read CA certificate {}: {source}", path.display())]
    Io {
        /// The CA path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The CA file content is not a valid certificate.
    #[error("CA certificate {} is invalid: {reason}", path.display())]
    Parse {
        /// The CA path.
        path: PathBuf,
        /// Why the content was rejected.
        reason: String,
    },
}

/// Errors loading a client certificate/private key pair.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// The certificate file could not be read.
    #[error("could not read certificate {}: {source}", path.display())]
    ReadCertificate {
        /// The certificate path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The private key file could not be read.
    #[error("could not read private key {}: {source}", path.display())]
    ReadPrivateKey {
        /// The private key path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The certificate file is not well-formed PEM.
    #[error("malformed PEM in certificate {}: {source}", path.display())]
    InvalidCertificatePem {
        /// The certificate path.
        path: PathBuf,
        /// The PEM decoding error.
        #[source]
        source: std::io::Error,
    },

    /// The certificate file contains no certificate.
    #[error("no certificate found in {}", path.display())]
    NoCertificates {
        /// The certificate path.
        path: PathBuf,
    },

    /// The leaf certificate is not a parseable X.509 certificate.
    #[error("invalid leaf certificate in {}: {reason}", path.display())]
    InvalidCertificate {
        /// The certificate path.
        path: PathBuf,
        /// The parser's complaint.
        reason: String,
    },

    /// The private key file is not well-formed PEM.
    #[error("malformed PEM in private key {}: {source}", path.display())]
    InvalidPrivateKeyPem {
        /// The private key path.
        path: PathBuf,
        /// The PEM decoding error.
        #[source]
        source: std::io::Error,
    },

    /// The private key file contains no private key.
    #[error("no private key found in {}", path.display())]
    NoPrivateKey {
        /// The private key path.
        path: PathBuf,
    },

    /// The crypto provider cannot use the private key.
    #[error("unsupported private key in {}: {source}", path.display())]
    UnsupportedPrivateKey {
        /// The private key path.
        path: PathBuf,
        /// The provider error.
        #[source]
        source: rustls::Error,
    },

    /// The private key does not belong to the certificate.
    #[error(
        "private key {} does not match certificate {}",
        key_path.display(),
        cert_path.display()
    )]
    KeyMismatch {
        /// The certificate path.
        cert_path: PathBuf,
        /// The private key path.
        key_path: PathBuf,
    },

    /// No rustls crypto provider is available.
    #[error("rustls crypto provider is not installed")]
    NoCryptoProvider,
}

/// Which credential file a watch failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedFile {
    /// The client certificate file.
    Certificate,
    /// The client private key file.
    PrivateKey,
}

impl WatchedFile {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            WatchedFile::Certificate => "certificate",
            WatchedFile::PrivateKey => "private key",
        }
    }
}

impl fmt::Display for WatchedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors subscribing to change notifications for the credential files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WatchSetupError {
    /// The platform file watcher could not be created.
    #[error("could not create file watcher: {0}")]
    Init(#[source] notify::Error),

    /// One of the two credential files could not be watched.
    #[error("could not watch {file} {}: {source}", path.display())]
    Subscribe {
        /// Which file failed.
        file: WatchedFile,
        /// The path that failed.
        path: PathBuf,
        /// The watcher error.
        #[source]
        source: notify::Error,
    },

    /// No Tokio runtime is available to run the watcher task.
    #[error("no Tokio runtime available to run the credential watcher")]
    NoRuntime,
}

impl WatchSetupError {
    /// Returns the file that could not be watched, if the failure was file specific.
    pub fn file(&self) -> Option<WatchedFile> {
        match self {
            WatchSetupError::Subscribe { file, .. } => Some(*file),
            _ => None,
        }
    }
}

/// Returned by [`CredentialUpdates`](crate::CredentialUpdates) once the certificate cell
/// has been dropped and no further installs can happen.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("certificate cell closed")]
pub struct UpdatesClosed;
