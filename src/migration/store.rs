use anyhow::Result;
use async_trait::async_trait;

use super::db::DbHandle;
use super::models::{Migration, MigrationHistory, NewHistory, Status};

/// Persistence seen by the orchestrator.
///
/// Every call is a single independent write or read; nothing here spans more
/// than one record. Real implementation: `DbHandle`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_migration(&self, id: i64) -> Result<Option<Migration>>;

    async fn save_migration(&self, migration: &Migration) -> Result<()>;

    async fn insert_history(&self, history: NewHistory) -> Result<MigrationHistory>;

    /// Finalize a RUNNING record. Returns false when the record was already terminal.
    async fn update_history_status(&self, id: i64, status: Status) -> Result<bool>;
}

#[async_trait]
impl JobStore for DbHandle {
    async fn find_migration(&self, id: i64) -> Result<Option<Migration>> {
        self.call(move |db| db.get_migration(id)).await
    }

    async fn save_migration(&self, migration: &Migration) -> Result<()> {
        let migration = migration.clone();
        self.call(move |db| db.save_migration(&migration).map(|_| ()))
            .await
    }

    async fn insert_history(&self, history: NewHistory) -> Result<MigrationHistory> {
        self.call(move |db| db.insert_history(&history)).await
    }

    async fn update_history_status(&self, id: i64, status: Status) -> Result<bool> {
        self.call(move |db| db.update_history_status(id, status))
            .await
    }
}
