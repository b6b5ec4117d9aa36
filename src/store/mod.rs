//! Session persistence
//!
//! The orchestrator keeps live sessions in memory and mirrors them into an
//! optional [`SessionStore`]. Two backends ship with the crate:
//!
//! - [`InMemorySessionStore`]: a tokio `RwLock` map, for tests and
//!   single-process deployments
//! - [`JsonFileSessionStore`]: one pretty-printed JSON file per session
//!
//! Stores hold full session snapshots. `update_session_dsl` only moves a
//! record forward: a version at or below the stored one is ignored.

pub mod file;
pub mod memory;

pub use file::JsonFileSessionStore;
pub use memory::InMemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::session::OrchestrationSession;

/// Persistence boundary for orchestration sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the full session record
    async fn save_session(&self, session: &OrchestrationSession) -> Result<(), StoreError>;

    /// `StoreError::NotFound` when no record exists
    async fn load_session(&self, session_id: &str) -> Result<OrchestrationSession, StoreError>;

    /// Ids of stored sessions that have not expired at `now`, oldest first
    async fn list_active_session_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Returns whether a record was removed
    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Remove every record expired at `now`; returns how many went
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn update_session_dsl(
        &self,
        session_id: &str,
        unified_dsl: &str,
        version: u64,
    ) -> Result<(), StoreError>;
}

/// Sort by creation time, then id, and return the ids
fn ids_oldest_first<'a>(sessions: impl Iterator<Item = &'a OrchestrationSession>) -> Vec<String> {
    let mut sessions: Vec<&OrchestrationSession> = sessions.collect();
    sessions.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    sessions.into_iter().map(|s| s.session_id.clone()).collect()
}
