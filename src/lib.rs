#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # mutual-rustls
//!
//! `mutual-rustls` builds a [`reqwest`] HTTP client that authenticates to servers with
//! a client certificate read from disk, and keeps that certificate current while the
//! process runs.
//!
//! Platforms that issue short-lived instance identities rewrite the certificate and
//! key files in place. The client watches both files; when they change it reloads
//! them, and **new TLS handshakes present the new certificate** without rebuilding the
//! client. If a rewrite is incomplete or invalid, the previous certificate stays in use
//! until a later change produces a valid pair.
//!
//! Servers are validated against a single configured CA file.
//!
//! ```no_run
//! use mutual_rustls::{mtls_client, MtlsConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // CF_INSTANCE_CERT, CF_INSTANCE_KEY, CF_SYSTEM_CERT_PATH
//! let client = mtls_client(MtlsConfig::from_env()?).build_strict()?;
//!
//! let body = client.get("https://service.internal/health").send().await?.text().await?;
//! println!("{body}");
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! Enabling more than one provider results in a compile-time error.
//!
//! Diagnostics go through `log` (`logging`, default) or `tracing` (`tracing`).

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

pub mod config;
pub mod error;
pub mod metrics;

mod cell;
mod client;
mod credential;
mod crypto;
mod resolve;
mod trust;
mod watcher;

mod observability;
mod prelude;

#[cfg(test)]
pub(crate) mod test_support;

// Public re-exports
pub use cell::{CertificateCell, CredentialUpdates};
pub use client::{mtls_client, BuildOutcome, MtlsClient, MtlsClientBuilder};
pub use config::MtlsConfig;
pub use credential::{load_credentials, CredentialPair};
pub use error::{
    CaError, ConfigError, CredentialError, Error, Result, UpdatesClosed, WatchSetupError,
    WatchedFile,
};
pub use metrics::{MetricsErrorKind, MetricsRecorder};
pub use trust::{load_trust_roots, TrustRootSet};
