use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{AppError, AppResult};
use crate::services::gate::GateSession;

/// Live gate sessions, keyed by the id handed to the UI.
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<GateSession>>>,
    max_sessions: usize,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: config.max_sessions,
            idle_ttl: Duration::from_secs(config.idle_ttl_seconds),
        }
    }

    pub fn insert(&self, session: GateSession) -> AppResult<Arc<GateSession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.len() >= self.max_sessions {
            tracing::warn!("Session limit of {} reached", self.max_sessions);
            return Err(AppError::ServiceUnavailable(
                "too many active sessions, try again later".to_string(),
            ));
        }

        let session = Arc::new(session);
        sessions.insert(session.id, session.clone());
        Ok(session)
    }

    /// Look up a session and mark it as active.
    pub fn get(&self, id: Uuid) -> AppResult<Arc<GateSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {}", id)))?;
        session.touch();
        Ok(session)
    }

    /// Destroy a session, aborting its in-flight downloads.
    pub fn remove(&self, id: Uuid) -> AppResult<()> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        match removed {
            Some(session) => {
                let aborted = session.downloads().cancel_all();
                tracing::debug!("Removed session {} ({} downloads aborted)", id, aborted);
                Ok(())
            }
            None => Err(AppError::NotFound(format!("session {}", id))),
        }
    }

    /// Drop sessions idle for longer than the TTL. Busy sessions are kept.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<Uuid> = sessions
            .values()
            .filter(|s| !s.is_busy() && s.idle_for(now) > self.idle_ttl)
            .map(|s| s.id)
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.downloads().cancel_all();
            }
        }
        expired.len()
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShareToken;
    use tokio_test::assert_ok;

    fn store(max_sessions: usize) -> SessionStore {
        SessionStore::new(&SessionConfig {
            idle_ttl_seconds: 60,
            reap_interval_seconds: 1,
            max_sessions,
        })
    }

    fn session() -> GateSession {
        GateSession::new(ShareToken::parse("abc123").unwrap(), None)
    }

    #[test]
    fn insert_get_remove() {
        let store = store(10);
        let id = store.insert(session()).unwrap().id;

        assert_ok!(store.get(id));
        assert_eq!(store.count(), 1);
        assert_ok!(store.remove(id));
        assert!(matches!(store.get(id), Err(AppError::NotFound(_))));
        assert!(matches!(store.remove(id), Err(AppError::NotFound(_))));
    }

    #[test]
    fn capacity_is_enforced() {
        let store = store(1);
        assert_ok!(store.insert(session()));
        assert!(matches!(
            store.insert(session()),
            Err(AppError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn idle_sessions_are_reaped() {
        let store = store(10);
        let id = store.insert(session()).unwrap().id;

        assert_eq!(store.reap_idle(Instant::now()), 0);
        assert_eq!(
            store.reap_idle(Instant::now() + Duration::from_secs(61)),
            1
        );
        assert!(store.get(id).is_err());
    }
}
