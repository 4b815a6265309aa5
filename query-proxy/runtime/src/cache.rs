use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

/// Caches each bearer token's legacy project list for a short time.
///
/// Entries are evicted by a background sweep once they are at least `expiry` old. Lookups do not
/// check expiry themselves, so an entry remains visible until a sweep removes it.
#[derive(Clone, Debug)]
pub struct UserProjectCache(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    entries: RwLock<HashMap<String, UserProjectEntry>>,
    expiry: Duration,
    stop: CancellationToken,
}

#[derive(Clone, Debug)]
pub struct UserProjectEntry {
    pub username: String,
    pub token: String,
    pub timestamp: Instant,
    pub projects: Vec<String>,
}

// === impl UserProjectCache ===

impl UserProjectCache {
    pub fn new(expiry: Duration) -> Self {
        Self(Arc::new(Inner {
            entries: RwLock::new(HashMap::default()),
            expiry,
            stop: CancellationToken::new(),
        }))
    }

    /// Starts evicting expired entries every `period` until [`UserProjectCache::stop`] is called.
    pub fn spawn_sweeper(&self, period: Duration) {
        let cache = self.clone();
        tokio::spawn(
            async move {
                let mut interval = time::interval(period);
                interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cache.0.stop.cancelled() => {
                            tracing::debug!("Stopped");
                            return;
                        }
                        _ = interval.tick() => {}
                    }
                    let evicted = cache.sweep();
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted expired entries");
                    }
                }
            }
            .instrument(info_span!("cache")),
        );
    }

    pub fn get(&self, token: &str) -> Option<Vec<String>> {
        self.0
            .entries
            .read()
            .get(token)
            .map(|entry| entry.projects.clone())
    }

    pub fn put(&self, username: String, token: String, projects: Vec<String>) {
        let entry = UserProjectEntry {
            username,
            token: token.clone(),
            timestamp: Instant::now(),
            projects,
        };
        self.0.entries.write().insert(token, entry);
    }

    /// Removes every entry at least `expiry` old, returning the number removed.
    pub(crate) fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.0.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.timestamp) < self.0.expiry);
        before - entries.len()
    }

    /// Stops the sweeper. Safe to call repeatedly and concurrently with a sweep.
    pub fn stop(&self) {
        self.0.stop.cancel();
    }
}
