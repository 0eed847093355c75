use rustls::crypto::CryptoProvider;
use std::sync::{Arc, OnceLock};

/// Ensures the crate's rustls crypto provider is installed as the process default.
///
/// Idempotent. If the application (or another crate) already installed a
/// provider, that one is left in place and used.
pub(crate) fn ensure_crypto_provider_installed() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = crypto_provider().install_default();
    });
}

/// Returns the process-default provider, installing ours first if needed.
pub(crate) fn default_provider() -> Option<Arc<CryptoProvider>> {
    ensure_crypto_provider_installed();
    CryptoProvider::get_default().cloned()
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(feature = "aws-lc-rs")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}
