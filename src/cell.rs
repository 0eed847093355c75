//! Single-slot holder of the current client credential.

use crate::credential::CredentialPair;
use crate::error::UpdatesClosed;
use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Holds the credential presented by new TLS handshakes.
///
/// Starts empty. Reads never block and never observe a partially replaced pair: a
/// reader gets either the pair installed before a [`replace`](Self::replace) or the one
/// installed by it.
pub struct CertificateCell {
    current: ArcSwapOption<CredentialPair>,
    generation: AtomicU64,
    update_tx: watch::Sender<u64>,
}

impl CertificateCell {
    /// Creates an empty cell at generation 0.
    pub fn new() -> Self {
        let (update_tx, _) = watch::channel(0u64);
        Self {
            current: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            update_tx,
        }
    }

    /// Installs `pair` and returns the new generation.
    ///
    /// Handshakes starting after this call present `pair`. Handshakes already holding
    /// the previous pair finish with it.
    pub fn replace(&self, pair: CredentialPair) -> u64 {
        self.current.store(Some(Arc::new(pair)));
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.update_tx.send_replace(next);
        next
    }

    /// Returns the current pair, or `None` before the first install.
    pub fn current(&self) -> Option<Arc<CredentialPair>> {
        self.current.load_full()
    }

    /// Number of pairs installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Subscribes to installs made after this call.
    pub fn updated(&self) -> CredentialUpdates {
        CredentialUpdates {
            rx: self.update_tx.subscribe(),
        }
    }
}

impl Default for CertificateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertificateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateCell")
            .field("generation", &self.generation())
            .field("current", &self.current.load().as_deref().map(CredentialPair::subject))
            .finish()
    }
}

/// Handle for receiving credential install notifications.
///
/// Cloning this handle creates another receiver on the same sequence. A slow receiver
/// may skip intermediate generations; it always observes the latest one.
///
/// # Examples
///
/// ```no_run
/// # use mutual_rustls::{mtls_client, MtlsConfig};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = mtls_client(MtlsConfig::from_env()?).build_strict()?;
/// let mut updates = client.credential_updates();
///
/// updates.changed().await?;
/// println!("rotated, generation {}", updates.last());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct CredentialUpdates {
    rx: watch::Receiver<u64>,
}

impl CredentialUpdates {
    /// Waits for the next install and returns its generation.
    ///
    /// # Errors
    ///
    /// Returns [`UpdatesClosed`] if the cell was dropped.
    pub async fn changed(&mut self) -> Result<u64, UpdatesClosed> {
        self.rx.changed().await.map_err(|_| UpdatesClosed)?;
        Ok(*self.rx.borrow_and_update())
    }

    /// Returns the latest generation without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the generation satisfies `f`.
    ///
    /// Returns immediately if the current generation already does.
    ///
    /// # Errors
    ///
    /// Returns [`UpdatesClosed`] if the cell was dropped first.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, UpdatesClosed>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let generation = self.changed().await?;
            if f(&generation) {
                return Ok(generation);
            }
        }
    }
}
