//! Step history bookkeeping.
//!
//! A `StepRecorder` is created for one execution of one migration. It opens a
//! RUNNING record at each step start and closes it as DONE or FAILED. It holds
//! no business logic beyond keeping start timestamps strictly increasing
//! within the execution.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::models::{Migration, MigrationHistory, NewHistory, Status, Step};
use super::store::JobStore;
use crate::errors::MigrationError;

pub struct StepRecorder {
    store: Arc<dyn JobStore>,
    last_start: Option<DateTime<Utc>>,
}

impl StepRecorder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            last_start: None,
        }
    }

    /// Persist a new RUNNING record for `step` and return it for later finalization.
    pub async fn start_step(
        &mut self,
        migration: &Migration,
        step: Step,
        data: Option<String>,
    ) -> Result<MigrationHistory, MigrationError> {
        let date = self.next_timestamp(Utc::now());
        let record = self
            .store
            .insert_history(NewHistory {
                migration_id: migration.id,
                step,
                date,
                data,
            })
            .await
            .map_err(MigrationError::Store)?;
        tracing::info!(
            migration_id = migration.id,
            step = %step,
            data = record.data.as_deref().unwrap_or(""),
            "step started"
        );
        Ok(record)
    }

    /// Mark the record DONE.
    pub async fn end_step(&self, record: &mut MigrationHistory) -> Result<(), MigrationError> {
        self.finish(record, Status::Done).await
    }

    /// Mark the record FAILED. A record that is already terminal is left as is.
    pub async fn fail_step(&self, record: &mut MigrationHistory) -> Result<(), MigrationError> {
        self.finish(record, Status::Failed).await
    }

    async fn finish(&self, record: &mut MigrationHistory, status: Status) -> Result<(), MigrationError> {
        if record.status.is_terminal() {
            return Ok(());
        }
        let changed = self
            .store
            .update_history_status(record.id, status)
            .await
            .map_err(MigrationError::Store)?;
        if !changed {
            // Finalized behind our back, by reconciliation.
            if status == Status::Failed {
                tracing::warn!(
                    migration_id = record.migration_id,
                    step = %record.step,
                    "step record already finalized"
                );
                return Ok(());
            }
            return Err(MigrationError::Store(anyhow::anyhow!(
                "Step record {} ({}) is no longer RUNNING",
                record.id,
                record.step
            )));
        }
        record.status = status;
        tracing::info!(
            migration_id = record.migration_id,
            step = %record.step,
            status = %status,
            "step finished"
        );
        Ok(())
    }

    /// Timestamps are stored with microsecond precision; two steps opened within
    /// the same microsecond are nudged apart so start order is preserved.
    fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = truncate_micros(now);
        let date = match self.last_start {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_start = Some(date);
        date
    }
}

fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let micros = ts.timestamp_micros();
    DateTime::from_timestamp_micros(micros).unwrap_or(ts)
}
