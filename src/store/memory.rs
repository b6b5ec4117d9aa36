//! In-memory session store for testing and development

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{ids_oldest_first, SessionStore};
use crate::error::StoreError;
use crate::session::OrchestrationSession;

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, OrchestrationSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_session(&self, session: &OrchestrationSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<OrchestrationSession, StoreError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn list_active_session_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(ids_oldest_first(
            sessions.values().filter(|s| !s.is_expired(now)),
        ))
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(session_id).is_some())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - sessions.len();
        debug!(removed, "expired sessions removed from memory store");
        Ok(removed)
    }

    async fn update_session_dsl(
        &self,
        session_id: &str,
        unified_dsl: &str,
        version: u64,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound {
                session_id: session_id.to_string(),
            })?;
        session.apply_persisted_dsl(unified_dsl, version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::session;
    use chrono::Duration;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = InMemorySessionStore::new();
        store.save_session(&session("a", base())).await.unwrap();

        let loaded = store.load_session("a").await.unwrap();
        assert_eq!(loaded.session_id, "a");
        assert!(store.delete_session("a").await.unwrap());
        assert!(!store.delete_session("a").await.unwrap());
        assert!(matches!(
            store.load_session("a").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_listing_and_cleanup_respect_expiry() {
        let store = InMemorySessionStore::new();
        store.save_session(&session("late", base() + Duration::minutes(5))).await.unwrap();
        store.save_session(&session("early", base())).await.unwrap();

        let mut stale = session("stale", base());
        stale.backdate(Duration::hours(2));
        store.save_session(&stale).await.unwrap();

        let now = base() + Duration::minutes(10);
        assert_eq!(
            store.list_active_session_ids(now).await.unwrap(),
            vec!["early", "late"]
        );
        assert_eq!(store.cleanup_expired(now).await.unwrap(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_dsl_updates_only_move_forward() {
        let store = InMemorySessionStore::new();
        store.save_session(&session("a", base())).await.unwrap();

        store.update_session_dsl("a", "(kyc.start)", 2).await.unwrap();
        store.update_session_dsl("a", "(stale)", 1).await.unwrap();

        let loaded = store.load_session("a").await.unwrap();
        assert_eq!(loaded.unified_dsl(), "(kyc.start)");
        assert_eq!(loaded.version_number(), 2);

        assert!(matches!(
            store.update_session_dsl("missing", "", 1).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
