use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{SessionStore, SessionTable};
use crate::entities::{NewSession, SessionEnd, SessionRecord, SessionStats};
use crate::error::StorageResult;

/// Process-local store, used in tests and when no store path is configured
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    table: Mutex<SessionTable>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn start_session(&self, session: NewSession) -> StorageResult<SessionRecord> {
        self.table.lock().start(session)
    }

    async fn update_session_stats(&self, id: Uuid, stats: SessionStats) -> StorageResult<()> {
        self.table.lock().update(id, &stats)
    }

    async fn end_session(&self, id: Uuid, end: SessionEnd) -> StorageResult<SessionRecord> {
        self.table.lock().end(id, &end)
    }

    async fn find_open_session(
        &self,
        service_instance_id: &str,
    ) -> StorageResult<Option<SessionRecord>> {
        Ok(self.table.lock().open_for(service_instance_id).cloned())
    }

    async fn list_sessions(&self, service_instance_id: &str) -> StorageResult<Vec<SessionRecord>> {
        Ok(self.table.lock().list(service_instance_id))
    }
}
