//! Cached consistency token for "now".
//!
//! The manager keeps the latest known [`SnapshotToken`] and serves it
//! until it is older than the TTL. Commits published on the store's feed
//! replace the cache immediately; the TTL only matters when the feed is
//! quiet or gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use arbiter_core::snapshot::SnapshotToken;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::traits::{SnapshotSource, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotManagerConfig {
    pub ttl: Duration,
    /// Interval of the background refresh that runs even when the feed is quiet.
    pub keep_alive: Duration,
}

impl Default for SnapshotManagerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(250),
            keep_alive: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct Cached {
    token: SnapshotToken,
    fetched_at: Instant,
}

struct Inner<S> {
    source: Arc<S>,
    config: SnapshotManagerConfig,
    cache: RwLock<Option<Cached>>,
    refreshes: AtomicU64,
}

impl<S: SnapshotSource> Inner<S> {
    fn fresh(&self) -> Option<SnapshotToken> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.config.ttl)
            .map(|c| c.token.clone())
    }

    /// Stores `token` unless the cache already holds a newer one, and
    /// returns whatever the cache holds afterwards.
    fn observe(&self, token: SnapshotToken) -> SnapshotToken {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match cache.as_mut() {
            Some(current) if !token.includes(&current.token) => {
                tracing::trace!(%token, cached = %current.token, "ignoring stale snapshot");
                current.token.clone()
            }
            _ => {
                *cache = Some(Cached {
                    token: token.clone(),
                    fetched_at: Instant::now(),
                });
                token
            }
        }
    }

    async fn refresh(&self) -> Result<SnapshotToken, StorageError> {
        let token = self.source.current_snapshot().await.map_err(|e| {
            tracing::warn!(error = %e, "snapshot refresh failed");
            StorageError::SnapshotUnavailable(e.to_string())
        })?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(self.observe(token))
    }
}

pub struct SnapshotManager<S: SnapshotSource> {
    inner: Arc<Inner<S>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: SnapshotSource> SnapshotManager<S> {
    pub fn new(source: Arc<S>, config: SnapshotManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                cache: RwLock::new(None),
                refreshes: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Fetches the initial token and starts following the change feed.
    /// Calling it on a running manager does nothing.
    pub async fn start(&self) -> Result<(), StorageError> {
        if self.is_running() {
            return Ok(());
        }

        // Subscribe before fetching so no commit falls between the two.
        let feed = self.inner.source.subscribe();
        let token = self.inner.refresh().await?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(tokio::spawn(follow_feed(Arc::clone(&self.inner), feed)));
            tracing::info!(%token, "snapshot manager started");
        }
        Ok(())
    }

    /// Idempotent; the cache keeps serving with TTL refreshes afterwards.
    pub fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("snapshot manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn current_token(&self) -> Result<SnapshotToken, StorageError> {
        if let Some(token) = self.inner.fresh() {
            return Ok(token);
        }
        self.inner.refresh().await
    }

    /// Moves the cache forward to a token learned outside the feed, such as
    /// the result of a local commit. Older tokens are ignored.
    pub fn advance(&self, token: SnapshotToken) -> SnapshotToken {
        self.inner.observe(token)
    }

    /// The cached token regardless of age, without touching the source.
    pub fn cached_token(&self) -> Option<SnapshotToken> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.token.clone())
    }

    /// Number of successful fetches from the source.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn set_token(&self, token: SnapshotToken) {
        let mut cache = self
            .inner
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *cache = Some(Cached {
            token,
            fetched_at: Instant::now(),
        });
    }
}

impl<S: SnapshotSource> Drop for SnapshotManager<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn follow_feed<S: SnapshotSource>(
    inner: Arc<Inner<S>>,
    mut feed: broadcast::Receiver<SnapshotToken>,
) {
    let period = inner.config.keep_alive.max(Duration::from_millis(1));
    let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut feed_open = true;

    loop {
        tokio::select! {
            received = feed.recv(), if feed_open => match received {
                Ok(token) => {
                    inner.observe(token);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "snapshot feed lagged, refreshing from store");
                    let _ = inner.refresh().await;
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("snapshot feed closed, falling back to ttl refresh");
                    feed_open = false;
                }
            },
            _ = keep_alive.tick() => {
                let _ = inner.refresh().await;
            }
        }
    }
}
