//! Reloads the credential when its files change on disk.

use crate::cell::CertificateCell;
use crate::config::CredentialPaths;
use crate::credential::{load_credentials, CredentialPair};
use crate::error::{CredentialError, WatchSetupError, WatchedFile};
use crate::metrics::{MetricsErrorKind, MetricsRecorder};
use crate::prelude::{debug, info, warn};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Returns `true` for events that may leave new content at a path.
///
/// Removals are ignored: there is nothing to load until the file is written again.
fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_)
        | EventKind::Create(_)
        | EventKind::Any
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) | EventKind::Remove(_) | EventKind::Other => false,
    }
}

/// Where a credential file lives and which paths events may report it under.
#[derive(Debug, Clone)]
struct Target {
    file: WatchedFile,
    /// Absolute form of the configured path.
    path: PathBuf,
    /// The configured path and, when it is a symlink, the file it resolves to.
    aliases: Vec<PathBuf>,
}

impl Target {
    fn resolve(file: WatchedFile, configured: &Path) -> Result<Self, WatchSetupError> {
        let subscribe_error = |e: std::io::Error| WatchSetupError::Subscribe {
            file,
            path: configured.to_path_buf(),
            source: notify::Error::io(e).add_path(configured.to_path_buf()),
        };

        let path = std::path::absolute(configured).map_err(subscribe_error)?;
        let resolved = std::fs::canonicalize(&path).map_err(subscribe_error)?;
        let mut aliases = vec![path.clone()];
        if resolved != path {
            aliases.push(resolved);
        }
        Ok(Self {
            file,
            path,
            aliases,
        })
    }

    /// Directories whose entries must be watched to see this file replaced.
    fn directories(&self) -> impl Iterator<Item = &Path> {
        self.aliases.iter().filter_map(|alias| alias.parent())
    }

    fn matches(&self, event_path: &Path) -> bool {
        self.aliases.iter().any(|alias| alias == event_path)
    }
}

/// Subscribes to the directories holding both credential files and starts the reload
/// task on the current runtime.
///
/// Watching the directories rather than the files keeps the subscription alive when a
/// file is deleted and written again, or replaced by a rename.
///
/// The returned task runs until `cancel` fires. It owns the platform watcher, so the OS
/// subscriptions are released when it ends.
pub(crate) fn spawn_watcher(
    paths: CredentialPaths,
    cell: Arc<CertificateCell>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, WatchSetupError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchSetupError::NoRuntime)?;

    let targets = [
        Target::resolve(WatchedFile::Certificate, &paths.certificate)?,
        Target::resolve(WatchedFile::PrivateKey, &paths.private_key)?,
    ];

    let (tx, rx) = mpsc::unbounded_channel();
    let callback_metrics = metrics.clone();
    let filter = targets.clone();
    let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if !is_content_change(&event.kind) {
                return;
            }
            let matched = event
                .paths
                .into_iter()
                .find(|p| filter.iter().any(|target| target.matches(p)));
            if let Some(path) = matched {
                let _ = tx.send(path);
            }
        }
        Err(e) => {
            warn!("file watcher reported an error: error={}", e);
            if let Some(metrics) = callback_metrics.as_deref() {
                metrics.record_error(MetricsErrorKind::NotifyError);
            }
        }
    })
    .map_err(WatchSetupError::Init)?;

    let mut watched = BTreeSet::new();
    for target in &targets {
        for dir in target.directories() {
            if !watched.insert(dir.to_path_buf()) {
                continue;
            }
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|source| WatchSetupError::Subscribe {
                    file: target.file,
                    path: target.path.clone(),
                    source,
                })?;
            debug!("watching {} directory: path={}", target.file, dir.display());
        }
    }

    let [certificate, private_key] = targets;
    let task = ReloadTask {
        _watcher: watcher,
        paths: CredentialPaths {
            certificate: certificate.path,
            private_key: private_key.path,
        },
        cell,
        metrics,
    };
    Ok(runtime.spawn(task.run(rx, cancel)))
}

struct ReloadTask {
    /// Held so the OS subscriptions live as long as the task.
    _watcher: RecommendedWatcher,
    /// Absolute paths, so reloads do not depend on the working directory.
    paths: CredentialPaths,
    cell: Arc<CertificateCell>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl ReloadTask {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PathBuf>, cancel: CancellationToken) {
        loop {
            let changed = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("credential watcher cancelled; stopping");
                    break;
                }

                msg = rx.recv() => match msg {
                    Some(path) => path,
                    None => {
                        info!("file watcher channel closed; stopping credential watcher");
                        break;
                    }
                },
            };
            debug!("credential file changed: path={}", changed.display());

            // Everything queued so far collapses into one reload of the current files.
            while rx.try_recv().is_ok() {}

            self.reload().await;
        }
    }

    async fn reload(&self) {
        let certificate = self.paths.certificate.clone();
        let private_key = self.paths.private_key.clone();
        let loaded =
            tokio::task::spawn_blocking(move || load_credentials(&certificate, &private_key)).await;

        match loaded {
            Ok(Ok(pair)) => self.install(pair),
            Ok(Err(e)) => self.reload_failed(&e),
            Err(e) => {
                warn!("credential reload task failed; keeping previous: error={}", e);
                self.record_error(MetricsErrorKind::ReloadFailed);
            }
        }
    }

    fn install(&self, pair: CredentialPair) {
        if let Some(current) = self.cell.current() {
            if current.same_material(&pair) {
                debug!("credential files changed but material is identical; keeping current");
                return;
            }
        }
        let subject = pair.subject().to_owned();
        let not_after = pair.not_after();
        let generation = self.cell.replace(pair);
        if let Some(metrics) = self.metrics.as_deref() {
            metrics.record_reload();
        }
        info!(
            "reloaded client credential: subject={}, not_after={}, generation={}",
            subject, not_after, generation
        );
    }

    fn reload_failed(&self, e: &CredentialError) {
        warn!("failed reloading client credential; keeping previous: error={}", e);
        self.record_error(MetricsErrorKind::ReloadFailed);
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(metrics) = self.metrics.as_deref() {
            metrics.record_error(kind);
        }
    }
}
