//! Paths of the credential material used to build an [`MtlsClient`](crate::MtlsClient).
//!
//! The three paths are resolved once, when the client is built. Rotation happens by
//! rewriting the files at those paths, never by changing the paths.

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Environment variable holding the client certificate path.
pub const CERTIFICATE_PATH_ENV: &str = "CF_INSTANCE_CERT";

/// Environment variable holding the client private key path.
pub const PRIVATE_KEY_PATH_ENV: &str = "CF_INSTANCE_KEY";

/// Environment variable holding the CA certificate path.
pub const CA_PATH_ENV: &str = "CF_SYSTEM_CERT_PATH";

/// The three files an mTLS client is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtlsConfig {
    certificate_path: PathBuf,
    private_key_path: PathBuf,
    ca_path: PathBuf,
}

impl MtlsConfig {
    /// Creates a configuration from explicit paths.
    ///
    /// * `certificate_path` - PEM certificate chain, leaf first.
    /// * `private_key_path` - PEM private key matching the leaf (PKCS#8, PKCS#1 or SEC1).
    /// * `ca_path` - the CA that issued the server certificates, PEM or DER.
    pub fn new(
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
            ca_path: ca_path.into(),
        }
    }

    /// Loads the paths from `CF_INSTANCE_CERT`, `CF_INSTANCE_KEY` and `CF_SYSTEM_CERT_PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] if any of the variables is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(CERTIFICATE_PATH_ENV, PRIVATE_KEY_PATH_ENV, CA_PATH_ENV)
    }

    /// Loads the paths from the given environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] naming the first variable that is unset.
    pub fn from_env_vars(
        certificate_var: &str,
        private_key_var: &str,
        ca_var: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            env_path(certificate_var)?,
            env_path(private_key_var)?,
            env_path(ca_var)?,
        ))
    }

    /// Checks that every path is set.
    ///
    /// The files themselves are checked when they are loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyPath`] naming the first empty setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (setting, path) in [
            ("certificate-path", &self.certificate_path),
            ("private-key-path", &self.private_key_path),
            ("ca-path", &self.ca_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPath { setting });
            }
        }
        Ok(())
    }

    /// Client certificate path.
    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    /// Client private key path.
    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    /// CA certificate path.
    pub fn ca_path(&self) -> &Path {
        &self.ca_path
    }

    pub(crate) fn credential_paths(&self) -> CredentialPaths {
        CredentialPaths {
            certificate: self.certificate_path.clone(),
            private_key: self.private_key_path.clone(),
        }
    }
}

/// Certificate and key locations shared by the loader and the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CredentialPaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

fn env_path(var: &str) -> Result<PathBuf, ConfigError> {
    std::env::var_os(var)
        .map(PathBuf::from)
        .ok_or_else(|| ConfigError::MissingEnvVar(var.to_owned()))
}
