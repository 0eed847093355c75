use crate::cell::CertificateCell;
use crate::metrics::{MetricsErrorKind, MetricsRecorder};
use crate::prelude::warn;
use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

/// Presents whatever credential the cell holds at handshake time.
///
/// Nothing is cached: each handshake reads the cell again.
pub(crate) struct CellClientCertResolver {
    cell: Arc<CertificateCell>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl CellClientCertResolver {
    pub(crate) fn new(
        cell: Arc<CertificateCell>,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        Self { cell, metrics }
    }
}

impl fmt::Debug for CellClientCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellClientCertResolver")
            .field("cell", &self.cell)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl ResolvesClientCert for CellClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[rustls::SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let Some(pair) = self.cell.current() else {
            warn!("server requested a client certificate but none is loaded");
            if let Some(metrics) = self.metrics.as_deref() {
                metrics.record_error(MetricsErrorKind::NoCredential);
            }
            return None;
        };
        Some(pair.certified_key())
    }

    fn has_certs(&self) -> bool {
        true
    }
}
