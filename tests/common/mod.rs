#![allow(dead_code)]

use mutual_rustls::{
    mtls_client, MetricsErrorKind, MetricsRecorder, MtlsClient, MtlsClientBuilder, MtlsConfig,
};
use rcgen::{
    BasicConstraints, CertificateParams, CertifiedIssuer, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";

pub fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// A throwaway CA issuing server and client certificates.
pub struct Pki {
    ca: CertifiedIssuer<'static, KeyPair>,
}

pub struct Credentials {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

impl Pki {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = common_name(name);
        let key = KeyPair::generate().unwrap();
        Self {
            ca: CertifiedIssuer::self_signed(params, key).unwrap(),
        }
    }

    pub fn ca_pem(&self) -> String {
        let ca: &rcgen::Certificate = self.ca.as_ref();
        ca.pem()
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        let ca: &rcgen::Certificate = self.ca.as_ref();
        ca.der().clone()
    }

    pub fn client(&self, name: &str) -> Credentials {
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params)
    }

    pub fn server(&self) -> Credentials {
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name("localhost");
        params.subject_alt_names = vec![
            SanType::DnsName("localhost".try_into().unwrap()),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.issue(params)
    }

    fn issue(&self, params: CertificateParams) -> Credentials {
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca).unwrap();
        Credentials {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().to_vec(),
        }
    }
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn
}

/// Credential and CA files in a temporary directory.
pub struct Workspace {
    dir: tempfile::TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl Workspace {
    pub fn new(pki: &Pki, initial: &Credentials) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        Self::populate(dir, &root, pki, initial)
    }

    /// Like [`Workspace::new`], but under the working directory and with relative paths.
    pub fn relative(pki: &Pki, initial: &Credentials) -> Self {
        let dir = tempfile::Builder::new()
            .prefix(".mtls-")
            .tempdir_in(".")
            .unwrap();
        let root = PathBuf::from(dir.path().file_name().unwrap());
        assert!(root.is_relative());
        Self::populate(dir, &root, pki, initial)
    }

    fn populate(dir: tempfile::TempDir, root: &Path, pki: &Pki, initial: &Credentials) -> Self {
        let cert = root.join("instance.crt");
        let key = root.join("instance.key");
        let ca = root.join("trusted-ca.crt");
        std::fs::write(&cert, &initial.cert_pem).unwrap();
        std::fs::write(&key, &initial.key_pem).unwrap();
        std::fs::write(&ca, pki.ca_pem()).unwrap();
        Self { dir, cert, key, ca }
    }

    pub fn config(&self) -> MtlsConfig {
        MtlsConfig::new(&self.cert, &self.key, &self.ca)
    }

    /// Rewrites both files in place, certificate first.
    pub fn rotate(&self, next: &Credentials) {
        std::fs::write(&self.cert, &next.cert_pem).unwrap();
        std::fs::write(&self.key, &next.key_pem).unwrap();
    }

    /// Deletes both files, waits, then writes them again.
    pub async fn recreate(&self, next: &Credentials) {
        std::fs::remove_file(&self.cert).unwrap();
        std::fs::remove_file(&self.key).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.rotate(next);
    }

    /// Replaces both files by renaming fully written siblings over them.
    pub fn rotate_by_rename(&self, next: &Credentials) {
        let staged_cert = self.dir.path().join(".instance.crt.new");
        let staged_key = self.dir.path().join(".instance.key.new");
        std::fs::write(&staged_cert, &next.cert_pem).unwrap();
        std::fs::write(&staged_key, &next.key_pem).unwrap();
        std::fs::rename(&staged_cert, &self.cert).unwrap();
        std::fs::rename(&staged_key, &self.key).unwrap();
    }
}

/// HTTPS responder that requires a client certificate and records each one it sees.
pub struct MtlsServer {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MtlsServer {
    pub async fn start(pki: &Pki) -> Self {
        install_provider();
        let identity = pki.server();

        let mut roots = RootCertStore::empty();
        roots.add(pki.ca_der()).unwrap();
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build().unwrap();
        let key = rustls_pemfile::private_key(&mut identity.key_pem.as_bytes())
            .unwrap()
            .unwrap();
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![CertificateDer::from(identity.cert_der)], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task_seen = Arc::clone(&seen);
        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let seen = Arc::clone(&task_seen);
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    if let Some(leaf) = tls.get_ref().1.peer_certificates().and_then(|c| c.first()) {
                        seen.lock().unwrap().push(leaf.to_vec());
                    }

                    let mut request: Vec<u8> = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match tls.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let _ = tls.write_all(RESPONSE).await;
                    let _ = tls.shutdown().await;
                });
            }
        });

        Self { addr, seen, task }
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}/", self.addr.port())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Leaf certificate presented on the most recent accepted handshake.
    pub fn last_client_cert(&self) -> Option<Vec<u8>> {
        self.seen.lock().unwrap().last().cloned()
    }

    pub fn handshakes(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl Drop for MtlsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    reloads: AtomicUsize,
    errors: Mutex<Vec<MetricsErrorKind>>,
}

impl RecordingMetrics {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn count(&self, kind: MetricsErrorKind) -> usize {
        self.errors.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        self.errors.lock().unwrap().push(kind);
    }
}

/// Polls `check` until it holds, failing the test after ten seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Builder for a client over `ws` that ignores proxy settings from the environment.
pub fn client_builder(ws: &Workspace) -> MtlsClientBuilder {
    mtls_client(ws.config()).with_http_customizer(reqwest::ClientBuilder::no_proxy)
}

/// Sends a GET and returns the body.
pub async fn fetch(client: &MtlsClient, server: &MtlsServer) -> reqwest::Result<String> {
    client.get(server.url()).send().await?.text().await
}
