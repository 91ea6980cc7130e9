//! Stream id to cancellation handle.
//!
//! Every running chat registers here so another task can stop it by id. The
//! entry lives exactly as long as the [`ActiveStream`] that owns it.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Identifier of one in-flight stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Entries = Arc<Mutex<HashMap<StreamId, CancellationToken>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<StreamId, CancellationToken>> {
    entries.lock().unwrap_or_else(|p| p.into_inner())
}

/// Live streams by id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    entries: Entries,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh stream.
    pub fn register(&self) -> ActiveStream {
        let id = StreamId::new();
        let token = CancellationToken::new();
        lock(&self.entries).insert(id.clone(), token.clone());
        tracing::debug!(stream = %id, "stream registered");
        ActiveStream {
            id,
            token,
            entries: Arc::clone(&self.entries),
        }
    }

    /// Cancel a live stream. Unknown ids are a no-op and return `false`.
    pub fn cancel(&self, id: &str) -> bool {
        let token = lock(&self.entries).get(id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                tracing::debug!(stream = id, "stream cancelled");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered stream. Dropping it removes the registry entry.
pub struct ActiveStream {
    id: StreamId,
    token: CancellationToken,
    entries: Entries,
}

impl ActiveStream {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        lock(&self.entries).remove(&self.id);
    }
}
