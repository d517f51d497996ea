//! Session registry for creating, reusing and evicting sessions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{DisposeReason, PersistentSession, SessionConfig, SessionId, SessionInfo};
use crate::transport::ShellConnector;
use crate::{Credentials, Error, Result};

/// Maps caller-visible ids to live [`PersistentSession`]s.
///
/// Cloning is cheap; clones share one map. Entries remove themselves when
/// their session is disposed, but only while the map still points at that
/// same session object.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

struct Shared {
    sessions: RwLock<HashMap<SessionId, Arc<PersistentSession>>>,
    connector: Arc<dyn ShellConnector>,
    config: SessionConfig,
}

impl Shared {
    fn evict(&self, session: &PersistentSession) -> bool {
        let mut sessions = self.sessions.write();
        let current = sessions
            .get(session.id())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), session));
        if current {
            sessions.remove(session.id());
            info!(
                session_id = %session.id(),
                remaining_sessions = sessions.len(),
                "Session removed from registry"
            );
        }
        current
    }
}

impl SessionRegistry {
    /// Creates an empty registry that opens shells through `connector`.
    pub fn new(connector: Arc<dyn ShellConnector>, config: SessionConfig) -> Self {
        info!(
            max_sessions = config.max_sessions,
            inactivity_timeout_secs = config.inactivity_timeout.as_secs(),
            "Session registry initialized"
        );
        Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                connector,
                config,
            }),
        }
    }

    /// Returns the configuration applied to new sessions.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Returns the live session for `id`, creating and connecting one if
    /// needed.
    ///
    /// With `force_new`, an existing session under `id` is disposed and
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaxSessionsReached`] at the session limit, or the
    /// connect failure (the failed session is evicted).
    pub async fn get_or_create(
        &self,
        id: impl Into<SessionId>,
        credentials: Credentials,
        force_new: bool,
    ) -> Result<Arc<PersistentSession>> {
        let id = id.into();

        if force_new {
            let replaced = self.shared.sessions.write().remove(&id);
            if let Some(old) = replaced {
                info!(session_id = %id, "Replacing existing session");
                old.dispose_with(DisposeReason::Replaced);
            }
        }

        let session = self.register(id, credentials, false)?;
        session.ensure_connected().await?;
        Ok(session)
    }

    /// Creates and connects a session under `id`, failing if a live
    /// session already uses it.
    ///
    /// The check and the insert happen under one lock, so of several
    /// concurrent callers with the same id exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExists`], [`Error::MaxSessionsReached`], or the
    /// connect failure (the failed session is evicted).
    pub async fn create(
        &self,
        id: impl Into<SessionId>,
        credentials: Credentials,
    ) -> Result<Arc<PersistentSession>> {
        let session = self.register(id.into(), credentials, true)?;
        session.ensure_connected().await?;
        Ok(session)
    }

    fn register(
        &self,
        id: SessionId,
        credentials: Credentials,
        exclusive: bool,
    ) -> Result<Arc<PersistentSession>> {
        let mut sessions = self.shared.sessions.write();
        match sessions.get(&id) {
            Some(existing) if !existing.is_disposed() => {
                if exclusive {
                    debug!(session_id = %id, "Session id already in use");
                    return Err(Error::SessionExists(id.to_string()));
                }
                debug!(session_id = %id, "Reusing session");
                Ok(Arc::clone(existing))
            }
            _ => {
                // A disposed entry whose eviction has not landed yet.
                sessions.remove(&id);

                let max = self.shared.config.max_sessions;
                if sessions.len() >= max {
                    warn!(
                        session_id = %id,
                        max,
                        current = sessions.len(),
                        "Maximum sessions reached, rejecting"
                    );
                    return Err(Error::MaxSessionsReached { max });
                }

                let session = PersistentSession::new(
                    id.clone(),
                    credentials,
                    Arc::clone(&self.shared.connector),
                    self.shared.config.clone(),
                );
                let registry: Weak<Shared> = Arc::downgrade(&self.shared);
                session.on_dispose(move |disposed| {
                    if let Some(shared) = registry.upgrade() {
                        shared.evict(disposed);
                    }
                });
                sessions.insert(id.clone(), Arc::clone(&session));
                info!(
                    session_id = %id,
                    host = %session.target().host,
                    total_sessions = sessions.len(),
                    "Session registered"
                );
                Ok(session)
            }
        }
    }

    /// Looks up a session without side effects.
    ///
    /// `None` means no entry; a returned session may still be disposed.
    pub fn get(&self, id: &str) -> Option<Arc<PersistentSession>> {
        self.shared.sessions.read().get(id).cloned()
    }

    /// Returns true if a session that has not been disposed uses `id`.
    pub fn contains_live(&self, id: &str) -> bool {
        self.get(id).is_some_and(|session| !session.is_disposed())
    }

    /// Disposes and removes the session under `id`.
    ///
    /// Returns false if there was no entry.
    pub fn remove(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        session.dispose_with(DisposeReason::Closed);
        // Covers entries whose session was disposed before it was removed.
        self.shared.evict(&session);
        true
    }

    /// Returns a snapshot of every live session, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .shared
            .sessions
            .read()
            .values()
            .filter(|session| !session.is_disposed())
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Returns the ids of all entries, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.shared.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.shared.sessions.read().len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.shared.sessions.read().is_empty()
    }

    /// Disposes every session and empties the registry.
    ///
    /// Returns how many sessions were still live.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Arc<PersistentSession>> = self
            .shared
            .sessions
            .write()
            .drain()
            .map(|(_, session)| session)
            .collect();

        let disposed = drained
            .iter()
            .filter(|session| session.dispose_with(DisposeReason::Shutdown))
            .count();
        info!(disposed, "Session registry shut down");
        disposed
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionState;
    use crate::transport::fake::FakeShell;

    fn creds() -> Credentials {
        Credentials::password("fake", 22, "user", "pw")
    }

    fn registry(shell: &FakeShell) -> SessionRegistry {
        SessionRegistry::new(Arc::new(shell.clone()), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_session() {
        let shell = FakeShell::new();
        let registry = registry(&shell);

        let a = registry.get_or_create("s1", creds(), false).await.unwrap();
        let b = registry.get_or_create("s1", creds(), false).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(shell.connect_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_force_new_replaces() {
        let shell = FakeShell::new();
        let registry = registry(&shell);

        let old = registry.get_or_create("s1", creds(), false).await.unwrap();
        let new = registry.get_or_create("s1", creds(), true).await.unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.dispose_reason(), Some(DisposeReason::Replaced));
        assert!(Arc::ptr_eq(&registry.get("s1").unwrap(), &new));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_disposal_keeps_newer_entry() {
        let shell = FakeShell::new();
        let registry = registry(&shell);

        let old = registry.get_or_create("s1", creds(), false).await.unwrap();
        // Simulate the map having moved on while the old session lingers.
        registry.shared.sessions.write().remove("s1");
        let new = registry.get_or_create("s1", creds(), false).await.unwrap();

        old.dispose();
        assert!(Arc::ptr_eq(&registry.get("s1").unwrap(), &new));
        assert_eq!(new.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_remove() {
        let shell = FakeShell::new();
        let registry = registry(&shell);

        let session = registry.get_or_create("s1", creds(), false).await.unwrap();
        assert!(registry.remove("s1"));
        assert!(session.is_disposed());
        assert!(registry.get("s1").is_none());
        assert!(!registry.remove("s1"));
    }

    #[tokio::test]
    async fn test_transport_close_evicts() {
        let shell = FakeShell::new();
        let registry = registry(&shell);

        let session = registry.get_or_create("s1", creds(), false).await.unwrap();
        shell.last_channel().unwrap().close();
        for _ in 0..100 {
            if session.is_disposed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(session.dispose_reason(), Some(DisposeReason::TransportClosed));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let shell = FakeShell::new();
        let registry = SessionRegistry::new(
            Arc::new(shell.clone()),
            SessionConfig::default().with_max_sessions(1),
        );

        registry.get_or_create("a", creds(), false).await.unwrap();
        let err = registry.get_or_create("b", creds(), false).await.unwrap_err();
        assert!(matches!(err, Error::MaxSessionsReached { max: 1 }));
        assert!(registry.contains_live("a"));
        assert_eq!(registry.ids(), vec![SessionId::from("a")]);
    }

    #[tokio::test]
    async fn test_failed_connect_is_evicted() {
        let shell = FakeShell::new();
        shell.fail_connect(Error::Connection {
            target: "user@fake:22".into(),
            message: "no route to host".into(),
        });
        let registry = registry(&shell);

        assert!(registry.get_or_create("s1", creds(), false).await.is_err());
        assert!(registry.is_empty());

        shell.allow_connect();
        let session = registry.get_or_create("s1", creds(), false).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_all() {
        let shell = FakeShell::new();
        let registry = registry(&shell);

        let a = registry.get_or_create("a", creds(), false).await.unwrap();
        let b = registry.get_or_create("b", creds(), false).await.unwrap();
        assert_eq!(registry.list().len(), 2);

        assert_eq!(registry.shutdown(), 2);
        assert!(registry.is_empty());
        assert_eq!(a.dispose_reason(), Some(DisposeReason::Shutdown));
        assert_eq!(b.dispose_reason(), Some(DisposeReason::Shutdown));
    }
}
