//! JSON file backed session store

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SessionStore, SessionTable};
use crate::entities::{NewSession, SessionEnd, SessionRecord, SessionStats};
use crate::error::{StorageError, StorageResult};

/// Keeps every session in one JSON document
///
/// The whole table is rewritten on each change through a temp file in the
/// same directory followed by a rename, so a crash mid-write leaves the
/// previous version intact.
pub struct JsonFileSessionStore {
    path: PathBuf,
    table: Mutex<SessionTable>,
}

impl JsonFileSessionStore {
    /// Open the store, creating parent directories; a missing file is an empty store
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let table = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => SessionTable::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionTable::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), sessions = table.sessions.len(), "Opened session store");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &SessionTable) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(table)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| StorageError::Other(format!("persist task failed: {}", e)))?
    }

    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut SessionTable) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let out = change(&mut next)?;

        if let Err(e) = self.persist(&next).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist session store");
            return Err(e);
        }
        *table = next;
        Ok(out)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn start_session(&self, session: NewSession) -> StorageResult<SessionRecord> {
        self.mutate(|table| table.start(session)).await
    }

    async fn update_session_stats(&self, id: Uuid, stats: SessionStats) -> StorageResult<()> {
        self.mutate(|table| table.update(id, &stats)).await
    }

    async fn end_session(&self, id: Uuid, end: SessionEnd) -> StorageResult<SessionRecord> {
        self.mutate(|table| table.end(id, &end)).await
    }

    async fn find_open_session(
        &self,
        service_instance_id: &str,
    ) -> StorageResult<Option<SessionRecord>> {
        Ok(self.table.lock().await.open_for(service_instance_id).cloned())
    }

    async fn list_sessions(&self, service_instance_id: &str) -> StorageResult<Vec<SessionRecord>> {
        Ok(self.table.lock().await.list(service_instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_open_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sessions.json");

        let store = JsonFileSessionStore::open(&path).await.unwrap();
        let session = store
            .start_session(NewSession {
                service_instance_id: "bot".into(),
                start_slot: 7,
                start_block_time: None,
                started_at: Utc::now(),
            })
            .await
            .unwrap();
        drop(store);

        // A new process sees the session left open
        let reopened = JsonFileSessionStore::open(&path).await.unwrap();
        let open = reopened.find_open_session("bot").await.unwrap().unwrap();
        assert_eq!(open.id, session.id);
        assert_eq!(open.start_slot, 7);

        reopened
            .end_session(
                session.id,
                SessionEnd {
                    reason: "crash".into(),
                    ended_at: Utc::now(),
                    slot: None,
                    block_time: None,
                },
            )
            .await
            .unwrap();

        let again = JsonFileSessionStore::open(&path).await.unwrap();
        assert!(again.find_open_session("bot").await.unwrap().is_none());
        let all = again.list_sessions("bot").await.unwrap();
        assert_eq!(all[0].end_reason.as_deref(), Some("crash"));
    }

    #[tokio::test]
    async fn test_failed_change_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = JsonFileSessionStore::open(&path).await.unwrap();

        let missing = Uuid::new_v4();
        assert!(store
            .update_session_stats(missing, SessionStats::default())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            JsonFileSessionStore::open(&path).await,
            Err(StorageError::Json(_))
        ));
    }
}
