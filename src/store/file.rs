//! JSON file session store
//!
//! One `<session_id>.json` file per session under a single directory.
//! Writes go to a temporary file first and are renamed into place, so a
//! crash mid-write never leaves a truncated record. Files that fail to
//! parse are skipped by listing and cleanup, with a warning.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, warn};

use super::{ids_oldest_first, SessionStore};
use crate::error::StoreError;
use crate::session::OrchestrationSession;

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct JsonFileSessionStore {
    directory: PathBuf,
}

impl JsonFileSessionStore {
    /// Open a store rooted at `directory`, creating it if needed
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Backend(format!(
                "session id '{}' cannot be used as a file name",
                session_id
            )));
        }
        Ok(self
            .directory
            .join(format!("{}.{}", session_id, EXTENSION)))
    }

    async fn write(&self, session: &OrchestrationSession) -> Result<(), StoreError> {
        let path = self.path_for(&session.session_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(session)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<OrchestrationSession, StoreError> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every readable record with its path
    async fn read_all(&self) -> Result<Vec<(PathBuf, OrchestrationSession)>, StoreError> {
        let mut entries = fs::read_dir(&self.directory).await?;
        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match self.read(&path).await {
                Ok(session) => sessions.push((path, session)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
            }
        }
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn save_session(&self, session: &OrchestrationSession) -> Result<(), StoreError> {
        self.write(session).await?;
        debug!(session_id = %session.session_id, "session written to file store");
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<OrchestrationSession, StoreError> {
        let path = self.path_for(session_id)?;
        match self.read(&path).await {
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound {
                    session_id: session_id.to_string(),
                })
            }
            other => other,
        }
    }

    async fn list_active_session_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let sessions = self.read_all().await?;
        Ok(ids_oldest_first(
            sessions
                .iter()
                .map(|(_, s)| s)
                .filter(|s| !s.is_expired(now)),
        ))
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (path, session) in self.read_all().await? {
            if session.is_expired(now) {
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        debug!(removed, directory = %self.directory.display(), "expired session files removed");
        Ok(removed)
    }

    async fn update_session_dsl(
        &self,
        session_id: &str,
        unified_dsl: &str,
        version: u64,
    ) -> Result<(), StoreError> {
        let mut session = self.load_session(session_id).await?;
        if session.apply_persisted_dsl(unified_dsl, version) {
            self.write(&session).await?;
        }
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
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::open(dir.path().join("sessions")).await.unwrap();

        let original = session("file-a", base());
        store.save_session(&original).await.unwrap();
        assert!(dir.path().join("sessions/file-a.json").exists());

        let loaded = store.load_session("file-a").await.unwrap();
        assert_eq!(loaded.session_id, original.session_id);
        assert_eq!(loaded.master_dsl, original.master_dsl);
        assert_eq!(loaded.execution_plan, original.execution_plan);
        assert_eq!(loaded.state_history(), original.state_history());
    }

    #[tokio::test]
    async fn test_missing_and_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::open(dir.path()).await.unwrap();

        assert!(matches!(
            store.load_session("nope").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.delete_session("nope").await.unwrap());
        assert!(matches!(
            store.load_session("../etc/passwd").await,
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_skips_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::open(dir.path()).await.unwrap();

        store.save_session(&session("fresh", base())).await.unwrap();
        let mut stale = session("stale", base());
        stale.backdate(Duration::hours(3));
        store.save_session(&stale).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{not json").unwrap();

        let now = base() + Duration::minutes(1);
        assert_eq!(store.cleanup_expired(now).await.unwrap(), 1);
        assert_eq!(store.list_active_session_ids(now).await.unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_dsl_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::open(dir.path()).await.unwrap();
        store.save_session(&session("dsl", base())).await.unwrap();

        store.update_session_dsl("dsl", "(ubo.discover)", 3).await.unwrap();
        let loaded = store.load_session("dsl").await.unwrap();
        assert_eq!(loaded.unified_dsl(), "(ubo.discover)");
        assert_eq!(loaded.version_number(), 3);
    }
}
