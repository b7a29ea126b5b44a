//! The result-correlation store: where workers publish responses and result
//! handles block waiting for them.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ResolveError, Result};
use crate::request::Response;

pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP: Duration = Duration::from_secs(3600);

/// Blocking key/value store correlating responses to waiting callers.
///
/// Implementations must be safe for concurrent use by many workers and
/// clients; the engine applies no locking over them.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Publish a response. Retention is implementation-defined; a response
    /// that ages out behaves as if it was never set.
    async fn set(&self, response: &Response) -> Result<()>;

    /// Block until the response for `id` arrives. `timeout` overrides the
    /// store's default; [`ResolveError::Timeout`] is returned when nothing
    /// arrives in time. Reading a response does not consume it.
    async fn get(&self, id: Uuid, timeout: Option<Duration>)
        -> std::result::Result<Response, ResolveError>;
}

/// In-process store: a shared map plus a wakeup for blocked getters.
///
/// Entries expire `keep` after being set; expired entries are purged lazily
/// on the next write.
pub struct MemoryStore {
    default_timeout: Duration,
    keep: Duration,
    entries: DashMap<Uuid, (Response, Instant)>,
    arrivals: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_GET_TIMEOUT, DEFAULT_KEEP)
    }

    pub fn with_timeouts(default_timeout: Duration, keep: Duration) -> Self {
        MemoryStore {
            default_timeout,
            keep,
            entries: DashMap::new(),
            arrivals: Notify::new(),
        }
    }

    fn purge_expired(&self) {
        let keep = self.keep;
        self.entries
            .retain(|_, (_, stored_at)| stored_at.elapsed() < keep);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn set(&self, response: &Response) -> Result<()> {
        self.purge_expired();
        self.entries
            .insert(response.id, (response.clone(), Instant::now()));
        self.arrivals.notify_waiters();
        debug!(id = %response.id, state = ?response.state, "stored response");
        Ok(())
    }

    async fn get(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> std::result::Result<Response, ResolveError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        loop {
            // Register for wakeups before checking, so a concurrent set
            // cannot slip between the check and the wait.
            let mut notified = std::pin::pin!(self.arrivals.notified());
            notified.as_mut().enable();

            if let Some(entry) = self.entries.get(&id) {
                let (response, stored_at) = entry.value();
                if stored_at.elapsed() < self.keep {
                    return Ok(response.clone());
                }
            }

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ResolveError::Timeout)?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(ResolveError::Timeout);
            }
        }
    }
}

/// Store that throws every response away: `set` succeeds, `get` always times
/// out immediately. A valid substitute when nobody reads results.
pub struct DiscardStore;

#[async_trait]
impl ResultStore for DiscardStore {
    async fn set(&self, _response: &Response) -> Result<()> {
        Ok(())
    }

    async fn get(
        &self,
        _id: Uuid,
        _timeout: Option<Duration>,
    ) -> std::result::Result<Response, ResolveError> {
        Err(ResolveError::Timeout)
    }
}
