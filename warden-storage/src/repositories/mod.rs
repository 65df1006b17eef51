//! Session store implementations

pub mod file;
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{NewSession, SessionEnd, SessionRecord, SessionStats};
use crate::error::{StorageError, StorageResult};

pub use file::JsonFileSessionStore;
pub use memory::InMemorySessionStore;

/// Persistence for session markers
///
/// At most one open session exists per service instance id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn start_session(&self, session: NewSession) -> StorageResult<SessionRecord>;

    async fn update_session_stats(&self, id: Uuid, stats: SessionStats) -> StorageResult<()>;

    /// Close an open session; closing an unknown or closed session is `NotFound`
    async fn end_session(&self, id: Uuid, end: SessionEnd) -> StorageResult<SessionRecord>;

    async fn find_open_session(&self, service_instance_id: &str)
        -> StorageResult<Option<SessionRecord>>;

    /// All sessions of a service instance, oldest first
    async fn list_sessions(&self, service_instance_id: &str) -> StorageResult<Vec<SessionRecord>>;
}

/// Session rows plus the rules shared by every store
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct SessionTable {
    pub sessions: Vec<SessionRecord>,
}

impl SessionTable {
    pub fn start(&mut self, session: NewSession) -> StorageResult<SessionRecord> {
        if let Some(open) = self.open_for(&session.service_instance_id) {
            return Err(StorageError::DuplicateKey(format!(
                "session {} is still open for {}",
                open.id, open.service_instance_id
            )));
        }
        if session.service_instance_id.trim().is_empty() {
            return Err(StorageError::ValidationFailed(
                "service instance id is empty".to_string(),
            ));
        }

        let record = session.into_record();
        self.sessions.push(record.clone());
        Ok(record)
    }

    pub fn update(&mut self, id: Uuid, stats: &SessionStats) -> StorageResult<()> {
        let record = self.open_by_id(id)?;
        record.apply_stats(stats);
        Ok(())
    }

    pub fn end(&mut self, id: Uuid, end: &SessionEnd) -> StorageResult<SessionRecord> {
        let record = self.open_by_id(id)?;
        record.apply_end(end);
        Ok(record.clone())
    }

    pub fn open_for(&self, service_instance_id: &str) -> Option<&SessionRecord> {
        self.sessions
            .iter()
            .find(|s| s.is_open() && s.service_instance_id == service_instance_id)
    }

    pub fn list(&self, service_instance_id: &str) -> Vec<SessionRecord> {
        self.sessions
            .iter()
            .filter(|s| s.service_instance_id == service_instance_id)
            .cloned()
            .collect()
    }

    fn open_by_id(&mut self, id: Uuid) -> StorageResult<&mut SessionRecord> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id && s.is_open())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}
