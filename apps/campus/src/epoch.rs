//! Operation epochs: monotonically numbered load operations with cooperative
//! cancellation. Only the newest epoch on a page may commit results; anything
//! older is discarded silently, never surfaced as an error.

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::watch;

/// Observable cancellation flag shared between an epoch and its in-flight work.
///
/// Built on a `watch` pair so callers can either poll (`is_cancelled`) or
/// await the signal (`cancelled`). Cancellation is cooperative: signalling the
/// token never preempts anything by itself.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is signalled. Never resolves for a token that
    /// is dropped without being signalled, which makes it safe to race
    /// against work via `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender gone without signalling: stay pending forever.
        std::future::pending::<()>().await;
    }
}

/// A single logical fetch-for-display operation.
#[derive(Clone, Debug)]
pub struct Epoch {
    sequence: u64,
    token: CancelToken,
}

impl Epoch {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

struct TrackerInner {
    counter: u64,
    current: Option<watch::Sender<bool>>,
}

/// Page-scoped ordering guard. Each `begin` supersedes and signals the
/// previous epoch; `is_current` is the commit gate callers consult after
/// every await boundary. No retry logic lives here.
pub struct EpochTracker {
    inner: Mutex<TrackerInner>,
}

impl EpochTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                counter: 0,
                current: None,
            }),
        }
    }

    /// Start a new epoch, signalling the token of the one it supersedes.
    pub fn begin(&self) -> Epoch {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.current.take() {
            let _ = previous.send(true);
        }
        inner.counter += 1;
        let (tx, rx) = watch::channel(false);
        let sequence = inner.counter;
        inner.current = Some(tx);
        tracing::trace!(target: "campus::epoch", sequence, "epoch started");
        Epoch {
            sequence,
            token: CancelToken { rx },
        }
    }

    /// Whether `sequence` still names the latest epoch.
    pub fn is_current(&self, sequence: u64) -> bool {
        self.inner.lock().counter == sequence
    }

    /// Signal the current epoch without starting a new one. Called on page
    /// teardown so nothing commits after unmount.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.current.take() {
            let _ = current.send(true);
        }
    }

    /// Drive `work` under `epoch`: races it against the cancel token and
    /// gates the outcome on `is_current`. A superseded or aborted operation
    /// yields `Ok(None)` regardless of how the work finished; its errors are
    /// absorbed along with its results.
    pub async fn run_latest<T, E, F>(&self, epoch: &Epoch, work: F) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        tokio::select! {
            _ = epoch.token.cancelled() => {
                tracing::trace!(target: "campus::epoch", sequence = epoch.sequence, "operation aborted");
                Ok(None)
            }
            result = work => {
                if !self.is_current(epoch.sequence) {
                    tracing::trace!(target: "campus::epoch", sequence = epoch.sequence, "stale result discarded");
                    return Ok(None);
                }
                result.map(Some)
            }
        }
    }
}

impl Default for EpochTracker {
    fn default() -> Self {
        Self::new()
    }
}
