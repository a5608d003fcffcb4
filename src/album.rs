//! Media group coalescing
//!
//! Chat platforms deliver an album as separate messages that share a group
//! identifier. [`AlbumCoalescer`] holds such messages for a short window and
//! hands the complete, ordered group to the next stage exactly once.
//! Transport-agnostic: works with any message type implementing [`Grouped`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Default coalescing window, measured from the first message of a group.
pub const DEFAULT_ALBUM_WINDOW: Duration = Duration::from_millis(500);

/// Extra time a joiner waits past the window before giving up on the releaser.
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(5);

/// A message that may belong to a group delivered together.
pub trait Grouped {
    /// Identifier shared by all messages of one group.
    type GroupId: Hash + Eq + Clone + Send + Sync + Debug + 'static;

    /// Returns the group identifier, or `None` for a standalone message.
    fn group_id(&self) -> Option<Self::GroupId>;
}

/// Result of [`AlbumCoalescer::intercept`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Dispatch<T> {
    /// This call ran the continuation and carries its output.
    Handled(T),
    /// The message was added to a batch that another call delivered.
    Joined,
    /// The message was added to a batch whose releaser was cancelled
    /// before delivery.
    Abandoned,
    /// The message was added to a batch, but the releaser did not signal
    /// within the join timeout.
    Orphaned,
}

impl<T> Dispatch<T> {
    /// Whether this call delivered the batch itself.
    pub const fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }

    /// Returns the continuation output if this call delivered the batch.
    pub fn into_handled(self) -> Option<T> {
        match self {
            Self::Handled(output) => Some(output),
            Self::Joined | Self::Abandoned | Self::Orphaned => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Collecting,
    Released,
    Abandoned,
}

struct Batch<M> {
    messages: Vec<M>,
    state: watch::Receiver<BatchState>,
}

enum Arrival {
    Opened(watch::Sender<BatchState>),
    Appended(watch::Receiver<BatchState>),
}

/// Groups messages by [`Grouped::group_id`] and releases each group once.
///
/// The first message of a group makes its caller the *releaser*: it sleeps
/// for the window, then removes the batch and runs the continuation with
/// every collected message. Later messages of the same group make their
/// callers *joiners*: they append and wait for the releaser's signal without
/// running the continuation.
pub struct AlbumCoalescer<M: Grouped> {
    window: Duration,
    join_timeout: Duration,
    batches: Mutex<HashMap<M::GroupId, Batch<M>>>,
}

impl<M: Grouped> Default for AlbumCoalescer<M> {
    fn default() -> Self {
        Self::new(DEFAULT_ALBUM_WINDOW)
    }
}

impl<M: Grouped> AlbumCoalescer<M> {
    /// Creates a coalescer with the given window.
    ///
    /// The join timeout defaults to `window + DEFAULT_JOIN_GRACE`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            join_timeout: window + DEFAULT_JOIN_GRACE,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides how long a joiner waits for the releaser.
    #[must_use]
    pub const fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Coalescing window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Upper bound on a joiner's wait.
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    /// Number of groups currently collecting messages.
    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.lock().len()
    }

    /// Routes `message` through the coalescer.
    ///
    /// Standalone messages go straight to `proceed`. Grouped messages are
    /// buffered; only the call that opened the batch runs `proceed`, with all
    /// messages of the group in arrival order. Errors carried in `T` reach
    /// that call alone.
    pub async fn intercept<F, Fut, T>(&self, message: M, proceed: F) -> Dispatch<T>
    where
        F: FnOnce(Vec<M>) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(group) = message.group_id() else {
            return Dispatch::Handled(proceed(vec![message]).await);
        };

        match self.register(&group, message) {
            Arrival::Opened(latch) => {
                trace!(?group, "Opened album batch");
                let mut guard = ReleaseGuard {
                    coalescer: self,
                    group: Some(group),
                    latch,
                };
                tokio::time::sleep(self.window).await;
                let messages = guard.close(BatchState::Released);
                debug!(count = messages.len(), "Releasing album batch");
                Dispatch::Handled(proceed(messages).await)
            }
            Arrival::Appended(latch) => {
                trace!(?group, "Joined album batch");
                self.wait_for_release(&group, latch).await
            }
        }
    }

    fn register(&self, group: &M::GroupId, message: M) -> Arrival {
        let mut batches = self.lock();
        match batches.entry(group.clone()) {
            Entry::Occupied(mut entry) => {
                let batch = entry.get_mut();
                batch.messages.push(message);
                Arrival::Appended(batch.state.clone())
            }
            Entry::Vacant(entry) => {
                let (latch, state) = watch::channel(BatchState::Collecting);
                entry.insert(Batch {
                    messages: vec![message],
                    state,
                });
                Arrival::Opened(latch)
            }
        }
    }

    async fn wait_for_release<T>(
        &self,
        group: &M::GroupId,
        mut latch: watch::Receiver<BatchState>,
    ) -> Dispatch<T> {
        let waited = tokio::time::timeout(self.join_timeout, async {
            latch
                .wait_for(|state| *state != BatchState::Collecting)
                .await
                .map(|state| *state)
        })
        .await;

        match waited {
            Ok(Ok(state)) => match state {
                BatchState::Abandoned => Dispatch::Abandoned,
                BatchState::Released | BatchState::Collecting => Dispatch::Joined,
            },
            Ok(Err(_)) => {
                warn!(?group, "Album releaser dropped without signalling");
                Dispatch::Orphaned
            }
            Err(_) => {
                warn!(
                    ?group,
                    timeout_ms = self.join_timeout.as_millis(),
                    "Gave up waiting for album release"
                );
                Dispatch::Orphaned
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<M::GroupId, Batch<M>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Closes the releaser's batch exactly once, on release or on drop.
struct ReleaseGuard<'a, M: Grouped> {
    coalescer: &'a AlbumCoalescer<M>,
    group: Option<M::GroupId>,
    latch: watch::Sender<BatchState>,
}

impl<M: Grouped> ReleaseGuard<'_, M> {
    fn close(&mut self, outcome: BatchState) -> Vec<M> {
        let Some(group) = self.group.take() else {
            return Vec::new();
        };
        let mut batches = self.coalescer.lock();
        let messages = batches
            .remove(&group)
            .map(|batch| batch.messages)
            .unwrap_or_default();
        // Signalled under the lock: no append can land between removal and signal.
        self.latch.send_replace(outcome);
        messages
    }
}

impl<M: Grouped> Drop for ReleaseGuard<'_, M> {
    fn drop(&mut self) {
        let Some(group) = self.group.clone() else {
            return;
        };
        let dropped = self.close(BatchState::Abandoned);
        warn!(
            ?group,
            dropped = dropped.len(),
            "Album releaser cancelled, batch abandoned"
        );
    }
}
