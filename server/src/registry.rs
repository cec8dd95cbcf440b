//! Live sessions keyed by connection.

use crate::session::Session;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Identity of one accepted connection, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} already has a session")]
    Duplicate(ConnectionId),
}

/// Handles returned when a connection is registered.
pub struct Registration {
    pub session: SharedSession,
    /// Cancelled when the entry is closed or the parent token fires.
    pub cancel: CancellationToken,
}

struct Entry {
    session: SharedSession,
    cancel: CancellationToken,
}

/// Every registry operation runs in one critical section.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<ConnectionId, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a new connection.
    pub async fn open(
        &self,
        id: ConnectionId,
        session: Session,
        parent: &CancellationToken,
    ) -> Result<Registration, RegistryError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let session = Arc::new(Mutex::new(session));
        let cancel = parent.child_token();
        entries.insert(
            id,
            Entry {
                session: session.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok(Registration { session, cancel })
    }

    pub async fn get(&self, id: ConnectionId) -> Option<SharedSession> {
        self.entries
            .lock()
            .await
            .get(&id)
            .map(|entry| entry.session.clone())
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    /// Remove the entry and cancel its pending work.
    pub async fn close(&self, id: ConnectionId) -> Option<SharedSession> {
        let entry = self.entries.lock().await.remove(&id)?;
        entry.cancel.cancel();
        Some(entry.session)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
