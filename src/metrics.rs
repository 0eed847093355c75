//! Hooks for recording credential rotation metrics.

/// Error kinds reported to a [`MetricsRecorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MetricsErrorKind {
    /// A file change was observed but the credentials could not be reloaded.
    /// The previous credential stays in use.
    ReloadFailed,
    /// The platform file watcher reported an error.
    NotifyError,
    /// A TLS handshake asked for a client certificate before one was installed.
    NoCredential,
}

impl MetricsErrorKind {
    /// Stable, low-cardinality label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricsErrorKind::ReloadFailed => "reload_failed",
            MetricsErrorKind::NotifyError => "notify_error",
            MetricsErrorKind::NoCredential => "no_credential",
        }
    }
}

/// Trait for recording credential rotation metrics.
///
/// Implement this to integrate with your metrics system (e.g., Prometheus, `StatsD`).
/// Reload failures are never surfaced to the caller of
/// [`MtlsClientBuilder::build`](crate::MtlsClientBuilder::build), so this hook (and the
/// logs) are the only signal that a rotation did not take effect.
///
/// # Example
///
/// ```no_run
/// use mutual_rustls::{mtls_client, MetricsErrorKind, MetricsRecorder, MtlsConfig};
/// use std::sync::Arc;
///
/// struct MyMetrics;
///
/// impl MetricsRecorder for MyMetrics {
///     fn record_reload(&self) {
///         // Count successful rotations
///     }
///
///     fn record_error(&self, kind: MetricsErrorKind) {
///         println!("rotation error: {}", kind.as_str());
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = mtls_client(MtlsConfig::from_env()?)
///     .with_metrics(Arc::new(MyMetrics))
///     .build_strict()?;
/// # Ok(())
/// # }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records that a new credential was installed after a file change.
    fn record_reload(&self);

    /// Records an error with a structured kind.
    fn record_error(&self, kind: MetricsErrorKind);
}
