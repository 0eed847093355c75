use crate::cell::{CertificateCell, CredentialUpdates};
use crate::config::{CredentialPaths, MtlsConfig};
use crate::credential::{load_credentials, CredentialPair};
use crate::error::{Error, Result, WatchSetupError};
use crate::metrics::MetricsRecorder;
use crate::prelude::{info, warn};
use crate::resolve::CellClientCertResolver;
use crate::trust::{load_trust_roots, TrustRootSet};
use crate::watcher::spawn_watcher;
use rustls::client::Resumption;
use rustls::ClientConfig;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Function type for customizing a `ClientConfig`.
type ClientConfigCustomizer = Box<dyn FnOnce(&mut ClientConfig) + Send>;

/// Function type for customizing the `reqwest` builder.
type HttpClientCustomizer = Box<dyn FnOnce(reqwest::ClientBuilder) -> reqwest::ClientBuilder + Send>;

/// Creates a builder for an [`MtlsClient`] from the given paths.
///
/// # Examples
///
/// ```no_run
/// use mutual_rustls::{mtls_client, MtlsConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = MtlsConfig::new(
///     "/etc/cf-instance-credentials/instance.crt",
///     "/etc/cf-instance-credentials/instance.key",
///     "/etc/cf-system-certificates/trusted-ca.crt",
/// );
/// let client = mtls_client(config).build_strict()?;
/// let response = client.get("https://service.internal/").send().await?;
/// # Ok(())
/// # }
/// ```
pub fn mtls_client(config: MtlsConfig) -> MtlsClientBuilder {
    MtlsClientBuilder::new(config)
}

/// Builds an [`MtlsClient`].
///
/// The client:
///
/// * validates servers against the configured CA only
/// * presents the certificate and key currently on disk as its client identity
/// * picks up rewrites of the certificate and key files without being rebuilt
///
/// Rotation affects new TLS handshakes only. Pooled connections keep the identity they
/// were established with until they close.
pub struct MtlsClientBuilder {
    config: MtlsConfig,
    alpn_protocols: Vec<Vec<u8>>,
    tls_customizer: Option<ClientConfigCustomizer>,
    http_customizer: Option<HttpClientCustomizer>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    shutdown_timeout: Option<Duration>,
}

impl fmt::Debug for MtlsClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsClientBuilder")
            .field("config", &self.config)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("tls_customizer", &self.tls_customizer.is_some())
            .field("http_customizer", &self.http_customizer.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl MtlsClientBuilder {
    /// Creates a new builder.
    ///
    /// Defaults:
    /// - ALPN protocols: empty (no ALPN)
    /// - Metrics: none
    /// - Shutdown timeout: none ([`MtlsClient::shutdown_configured`] waits indefinitely)
    pub fn new(config: MtlsConfig) -> Self {
        Self {
            config,
            alpn_protocols: Vec::new(),
            tls_customizer: None,
            http_customizer: None,
            metrics: None,
            shutdown_timeout: None,
        }
    }

    /// Sets the ALPN protocols, most preferred first.
    ///
    /// The HTTP client speaks HTTP/1.1; only advertise protocols it can use.
    #[must_use]
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn_protocols = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    /// Applies a customizer to the `ClientConfig` after the builder's settings.
    ///
    /// **Warning:** replacing the client certificate resolver or the root store disables
    /// rotation or server validation respectively.
    ///
    /// Session resumption is disabled before the customizer runs. A resumed TLS 1.3
    /// session does not send a client certificate, so re-enabling `resumption` lets new
    /// connections keep the identity of a session established before a rotation.
    #[must_use]
    pub fn with_tls_customizer<F>(mut self, customizer: F) -> Self
    where
        F: FnOnce(&mut ClientConfig) + Send + 'static,
    {
        self.tls_customizer = Some(Box::new(customizer));
        self
    }

    /// Applies a customizer to the `reqwest` builder (timeouts, pool settings, proxies, ...).
    ///
    /// The TLS configuration is installed before the customizer runs.
    #[must_use]
    pub fn with_http_customizer<F>(mut self, customizer: F) -> Self
    where
        F: FnOnce(reqwest::ClientBuilder) -> reqwest::ClientBuilder + Send + 'static,
    {
        self.http_customizer = Some(Box::new(customizer));
        self
    }

    /// Sets a metrics recorder for rotation events.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the timeout used by [`MtlsClient::shutdown_configured`].
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builds the client and starts watching the credential files.
    ///
    /// Must be called within a Tokio runtime for rotation to work. A failure to watch
    /// the files does not fail the build; it is reported in [`BuildOutcome`] and the
    /// client keeps presenting the initial credential.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    ///
    /// * the configuration has an empty path
    /// * the CA certificate cannot be read or parsed
    /// * the initial certificate or key cannot be loaded, or do not match
    /// * the HTTP client cannot be built
    pub fn build(self) -> Result<BuildOutcome> {
        Ok(self.assemble()?.start())
    }

    /// Builds the client, treating a failure to watch the credential files as an error.
    ///
    /// # Errors
    ///
    /// As [`build`](Self::build), plus [`Error::WatchSetup`].
    pub fn build_strict(self) -> Result<MtlsClient> {
        self.build()?.into_strict()
    }

    fn assemble(self) -> Result<Assembled> {
        crate::crypto::ensure_crypto_provider_installed();
        self.config.validate()?;

        let trust_roots = load_trust_roots(self.config.ca_path())?;

        let cell = Arc::new(CertificateCell::new());
        let paths = self.config.credential_paths();
        let initial = load_credentials(&paths.certificate, &paths.private_key)?;
        info!(
            "loaded client credential: subject={}, not_after={}",
            initial.subject(),
            initial.not_after()
        );
        cell.replace(initial);

        let resolver = Arc::new(CellClientCertResolver::new(
            Arc::clone(&cell),
            self.metrics.clone(),
        ));
        let mut tls = ClientConfig::builder()
            .with_root_certificates(trust_roots.roots())
            .with_client_cert_resolver(resolver);
        tls.alpn_protocols = self.alpn_protocols;
        // A resumed session carries the identity it was established with.
        tls.resumption = Resumption::disabled();

        // Apply customizer last
        if let Some(customizer) = self.tls_customizer {
            customizer(&mut tls);
        }
        let tls = Arc::new(tls);

        let mut http = reqwest::Client::builder().use_preconfigured_tls((*tls).clone());
        if let Some(customizer) = self.http_customizer {
            http = customizer(http);
        }
        let http = http.build()?;

        Ok(Assembled {
            http,
            tls,
            trust_roots,
            cell,
            paths,
            metrics: self.metrics,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A client whose pieces are in place but whose files are not yet watched.
struct Assembled {
    http: reqwest::Client,
    tls: Arc<ClientConfig>,
    trust_roots: TrustRootSet,
    cell: Arc<CertificateCell>,
    paths: CredentialPaths,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    shutdown_timeout: Option<Duration>,
}

impl Assembled {
    fn start(self) -> BuildOutcome {
        let cancel = CancellationToken::new();
        let (watcher, watch_error) = match spawn_watcher(
            self.paths,
            Arc::clone(&self.cell),
            self.metrics.clone(),
            cancel.clone(),
        ) {
            Ok(handle) => (Some(handle), None),
            Err(e) => {
                warn!(
                    "credential rotation disabled; client keeps its initial certificate: error={}",
                    e
                );
                (None, Some(e))
            }
        };

        let client = MtlsClient {
            inner: Arc::new(Inner {
                http: self.http,
                tls: self.tls,
                trust_roots: self.trust_roots,
                cell: self.cell,
                shutdown_timeout: self.shutdown_timeout,
                watching: watcher.is_some(),
                closed: AtomicBool::new(false),
                cancel,
                watcher: Mutex::new(watcher),
            }),
        };

        BuildOutcome {
            client,
            watch_error,
        }
    }
}

/// Result of [`MtlsClientBuilder::build`]: a usable client and, possibly, the reason its
/// credential files are not being watched.
#[derive(Debug)]
pub struct BuildOutcome {
    /// The client. Always usable.
    pub client: MtlsClient,
    /// Set when the credential files could not be watched; rotation is then disabled.
    pub watch_error: Option<WatchSetupError>,
}

impl BuildOutcome {
    /// Splits the outcome into the client and the optional watch failure.
    pub fn into_parts(self) -> (MtlsClient, Option<WatchSetupError>) {
        (self.client, self.watch_error)
    }

    /// Returns the client, or the watch failure as an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatchSetup`] if the credential files are not being watched.
    pub fn into_strict(self) -> Result<MtlsClient> {
        match self.watch_error {
            None => Ok(self.client),
            Some(e) => Err(Error::WatchSetup(e)),
        }
    }
}

/// HTTP client that authenticates with a client certificate reloaded from disk.
///
/// Cloning is cheap; clones share the connection pool, the credential and the watcher.
/// The watcher stops when [`shutdown`](Self::shutdown) is called or the last clone is
/// dropped. Either way the client keeps working with the last credential it loaded.
#[derive(Clone)]
pub struct MtlsClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    tls: Arc<ClientConfig>,
    trust_roots: TrustRootSet,
    cell: Arc<CertificateCell>,
    shutdown_timeout: Option<Duration>,
    watching: bool,
    closed: AtomicBool,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Best-effort cancellation. Do not block in Drop.
        self.cancel.cancel();
    }
}

impl fmt::Debug for MtlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsClient")
            .field("trust_roots", &self.inner.trust_roots)
            .field("cell", &self.inner.cell)
            .field("watching", &self.is_watching())
            .finish_non_exhaustive()
    }
}

impl MtlsClient {
    /// The underlying `reqwest` client.
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Starts a `GET` request.
    pub fn get<U: reqwest::IntoUrl>(&self, url: U) -> reqwest::RequestBuilder {
        self.inner.http.get(url)
    }

    /// Starts a `POST` request.
    pub fn post<U: reqwest::IntoUrl>(&self, url: U) -> reqwest::RequestBuilder {
        self.inner.http.post(url)
    }

    /// Starts a request with the given method.
    pub fn request<U: reqwest::IntoUrl>(
        &self,
        method: reqwest::Method,
        url: U,
    ) -> reqwest::RequestBuilder {
        self.inner.http.request(method, url)
    }

    /// The TLS configuration, for use with other transports such as `tokio-rustls`.
    ///
    /// It shares this client's credential and follows its rotations.
    pub fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.inner.tls)
    }

    /// The credential new handshakes present.
    pub fn current_credential(&self) -> Option<Arc<CredentialPair>> {
        self.inner.cell.current()
    }

    /// Subscribes to credential rotations.
    ///
    /// The initial load happens during build and does not trigger a notification.
    pub fn credential_updates(&self) -> CredentialUpdates {
        self.inner.cell.updated()
    }

    /// The CA roots servers are validated against.
    pub fn trust_roots(&self) -> &TrustRootSet {
        &self.inner.trust_roots
    }

    /// Returns `true` while the credential files are being watched.
    pub fn is_watching(&self) -> bool {
        self.inner.watching
            && !self.inner.closed.load(Ordering::Acquire)
            && !self.inner.cancel.is_cancelled()
    }

    /// Stops watching the credential files and waits for the watcher task to end.
    ///
    /// Idempotent. The client stays usable with its last credential.
    ///
    /// **Note:** waits indefinitely for the task. Prefer
    /// [`shutdown_with_timeout`](Self::shutdown_with_timeout) or
    /// [`shutdown_configured`](Self::shutdown_configured).
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let handle = self.inner.watcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("error joining credential watcher during shutdown: error={}", e);
            }
        }
    }

    /// Stops watching and waits up to `timeout` for the watcher task, aborting it after.
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownTimeout`] if the task had to be aborted.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let Some(mut handle) = self.inner.watcher.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("error joining credential watcher during shutdown: error={}", e);
                Ok(())
            }
            Err(_) => {
                warn!("shutdown timeout exceeded; aborting credential watcher");
                handle.abort();
                let _ = handle.await;
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }

    /// Stops watching using the timeout set with [`MtlsClientBuilder::shutdown_timeout`].
    ///
    /// Without a configured timeout this is [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownTimeout`] if the configured timeout is exceeded.
    pub async fn shutdown_configured(&self) -> Result<()> {
        if let Some(timeout) = self.inner.shutdown_timeout {
            self.shutdown_with_timeout(timeout).await
        } else {
            self.shutdown().await;
            Ok(())
        }
    }
}
